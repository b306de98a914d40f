//! Directory listing and per-document mutual exclusion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Document, DocumentId};
use crate::error::DocumentError;

/// Held while a document is loaded, mutated and saved.
#[derive(Debug)]
pub struct DocumentGuard {
    _guard: OwnedMutexGuard<()>,
}

/// One async mutex per document path.
///
/// Entries nobody holds or waits for are dropped on the next acquisition.
#[derive(Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Holders and waiters keep a clone; the map alone means idle
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lock if nobody holds it.
    pub async fn try_lock(&self, id: &DocumentId) -> Option<DocumentGuard> {
        let lock = self.entry(id.path()).await;
        lock.try_lock_owned()
            .ok()
            .map(|guard| DocumentGuard { _guard: guard })
    }

    /// Wait for the lock on any file path.
    pub async fn lock(&self, path: &Path) -> DocumentGuard {
        let lock = self.entry(path).await;
        DocumentGuard {
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Access to the documents of the knowledge base.
#[derive(Default)]
pub struct DocumentStore {
    locks: DocumentLocks,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> &DocumentLocks {
        &self.locks
    }

    /// Markdown documents directly inside `dir`, sorted by file name.
    ///
    /// A missing directory has no documents. Hidden files (temp files from an
    /// interrupted save among them) are ignored.
    pub async fn list(&self, dir: &Path) -> Result<Vec<DocumentId>, DocumentError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DocumentError::io(dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DocumentError::io(dir, e))?
        {
            let path = entry.path();
            let is_markdown = path.extension().is_some_and(|ext| ext == "md");
            let is_hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !is_markdown || is_hidden {
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => ids.push(DocumentId::new(path)),
                _ => continue,
            }
        }

        ids.sort_by_key(|id| id.path().file_name().map(|n| n.to_os_string()));
        Ok(ids)
    }

    pub async fn load(&self, id: &DocumentId) -> Result<Document, DocumentError> {
        Document::load(id.path()).await
    }
}
