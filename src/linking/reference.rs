//! The Entity Reference note: known aliases and the links they resolve to.
//!
//! The note holds three markdown tables, one per entity type:
//!
//! ```text
//! ## People Aliases
//! | Detected Name | Resolved Link |
//! |---------------|---------------|
//! | Maxime | [[Maxime Dupont]] |
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentLocks, write_atomic};
use crate::error::DocumentError;

const TITLE: &str = "# Entity Resolution Reference";
const TABLE_HEADER: &str = "| Detected Name | Resolved Link |";
const TABLE_RULE: &str = "|---------------|---------------|";

/// Kind of a named entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    People,
    Org,
    Other,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::People, EntityType::Org, EntityType::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::People => "people",
            EntityType::Org => "org",
            EntityType::Other => "other",
        }
    }

    fn section_title(&self) -> &'static str {
        match self {
            EntityType::People => "People Aliases",
            EntityType::Org => "Organisation Aliases",
            EntityType::Other => "Other Aliases",
        }
    }

    fn from_heading(line: &str) -> Option<Self> {
        let heading = line.strip_prefix("## ")?;
        if heading.starts_with("People") {
            Some(EntityType::People)
        } else if heading.starts_with("Organisation") {
            Some(EntityType::Org)
        } else if heading.starts_with("Other") {
            Some(EntityType::Other)
        } else {
            None
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "people" | "person" => Ok(EntityType::People),
            "org" | "organisation" | "organization" => Ok(EntityType::Org),
            "other" => Ok(EntityType::Other),
            other => Err(format!(
                "unknown entity type '{other}' (expected people, org or other)"
            )),
        }
    }
}

/// A confirmed alias to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEntry {
    pub name: String,
    pub link: String,
    pub entity_type: EntityType,
}

/// In-memory index: lower-cased alias to link, grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityReferenceIndex {
    tables: BTreeMap<EntityType, BTreeMap<String, String>>,
}

impl EntityReferenceIndex {
    pub fn parse(content: &str) -> Self {
        let mut index = Self::default();
        let mut current = None;
        for line in content.lines().map(str::trim) {
            if line.starts_with("## ") {
                current = EntityType::from_heading(line);
                continue;
            }
            let Some(entity_type) = current else {
                continue;
            };
            if !line.starts_with('|') || line.contains("---") || line.contains("Detected Name") {
                continue;
            }
            let cells: Vec<&str> = line
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .collect();
            if let [name, link, ..] = cells.as_slice() {
                index.insert(entity_type, name, link);
            }
        }
        index
    }

    /// Insert unless the alias is already known for that type.
    pub fn insert(&mut self, entity_type: EntityType, name: &str, link: &str) -> bool {
        let key = name.trim().to_lowercase();
        if key.is_empty() || link.trim().is_empty() {
            return false;
        }
        let table = self.tables.entry(entity_type).or_default();
        if table.contains_key(&key) {
            return false;
        }
        table.insert(key, link.trim().to_string());
        true
    }

    /// Look an alias up across all types, case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<(EntityType, &str)> {
        let key = name.trim().to_lowercase();
        EntityType::ALL.into_iter().find_map(|t| {
            self.tables
                .get(&t)
                .and_then(|table| table.get(&key))
                .map(|link| (t, link.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compact listing for prompts, one `alias -> link (type)` per line.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (entity_type, table) in &self.tables {
            for (name, link) in table {
                out.push_str(&format!("- {name} -> {link} ({entity_type})\n"));
            }
        }
        out
    }

    pub fn render(&self) -> String {
        let mut lines = vec![TITLE.to_string(), String::new()];
        for entity_type in EntityType::ALL {
            lines.push(format!("## {}", entity_type.section_title()));
            lines.push(TABLE_HEADER.to_string());
            lines.push(TABLE_RULE.to_string());
            if let Some(table) = self.tables.get(&entity_type) {
                for (name, link) in table {
                    lines.push(format!("| {} | {link} |", title_case(name)));
                }
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

/// The note on disk. Clones share one lock, so concurrent readers and
/// writers never interleave a read-modify-write.
#[derive(Clone)]
pub struct EntityReferenceFile {
    path: PathBuf,
    locks: Arc<DocumentLocks>,
}

impl fmt::Debug for EntityReferenceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityReferenceFile").field("path", &self.path).finish()
    }
}

impl EntityReferenceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            locks: Arc::new(DocumentLocks::new()),
        }
    }

    /// Serialize access through `locks`, shared with other side-file writers.
    pub fn with_locks(mut self, locks: Arc<DocumentLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the index, creating an empty note first if there is none.
    pub async fn load(&self) -> Result<EntityReferenceIndex, DocumentError> {
        let _guard = self.locks.lock(&self.path).await;
        self.read_or_create().await
    }

    /// Add new aliases. Known aliases keep their existing link.
    /// Returns the number of aliases added.
    pub async fn record(&self, entries: &[ReferenceEntry]) -> Result<usize, DocumentError> {
        let _guard = self.locks.lock(&self.path).await;
        let mut index = self.read_or_create().await?;
        let added = entries
            .iter()
            .filter(|e| index.insert(e.entity_type, &e.name, &e.link))
            .count();
        if added > 0 {
            write_atomic(&self.path, &index.render()).await?;
            tracing::info!(added, path = %self.path.display(), "Updated Entity Reference note");
        }
        Ok(added)
    }

    async fn read_or_create(&self) -> Result<EntityReferenceIndex, DocumentError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(EntityReferenceIndex::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let index = EntityReferenceIndex::default();
                if let Some(parent) = self.path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| DocumentError::io(parent, e))?;
                }
                write_atomic(&self.path, &index.render()).await?;
                tracing::info!(path = %self.path.display(), "Created Entity Reference note");
                Ok(index)
            }
            Err(e) => Err(DocumentError::io(&self.path, e)),
        }
    }
}

fn title_case(name: &str) -> String {
    name.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
