//! Document state model.
//!
//! A document is a markdown file with an optional YAML frontmatter block. The
//! frontmatter carries the pipeline state: completed stages, category, pending
//! flags and side-channel fields handed from one stage to the next.

pub mod frontmatter;
pub mod store;

pub use store::{DocumentGuard, DocumentLocks, DocumentStore};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::DocumentError;

/// Frontmatter key holding the ordered list of completed stages.
pub const STAGES_KEY: &str = "processing_stages";

const CATEGORY_KEY: &str = "category";
const TAGS_KEY: &str = "tags";
const SOURCE_TAGS_KEY: &str = "source_tags";
const ABANDONED_KEY: &str = "abandoned";
const DATE_KEY: &str = "date";
const PENDING_SUFFIX: &str = "_pending";

/// Stable identity of a document: its file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(PathBuf);

impl DocumentId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// File name without the `.md` extension, as used inside `[[...]]` links.
    pub fn stem(&self) -> String {
        self.0
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.file_name() {
            Some(name) => write!(f, "{}", name.to_string_lossy()),
            None => write!(f, "{}", self.0.display()),
        }
    }
}

/// Closed set of document categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Meeting,
    Diary,
    Idea,
    Meditation,
    Todo,
    Mention,
    Email,
    Conversation,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Meeting,
        Category::Diary,
        Category::Idea,
        Category::Meditation,
        Category::Todo,
        Category::Mention,
        Category::Email,
        Category::Conversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Meeting => "meeting",
            Category::Diary => "diary",
            Category::Idea => "idea",
            Category::Meditation => "meditation",
            Category::Todo => "todo",
            Category::Mention => "mention",
            Category::Email => "email",
            Category::Conversation => "conversation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

/// Frontmatter key of a namespaced flag.
pub fn flag_key(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

/// A loaded document.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    metadata: Mapping,
    body: String,
    /// Original frontmatter block, reused verbatim while metadata is untouched.
    original_header: Option<String>,
    metadata_dirty: bool,
    body_dirty: bool,
    modified: Option<DateTime<Utc>>,
}

impl Document {
    /// Parse raw file content.
    pub fn parse(id: DocumentId, content: &str) -> Result<Self, DocumentError> {
        let split = frontmatter::split(content);
        let metadata = match split.yaml {
            Some(yaml) => frontmatter::parse(yaml).map_err(|reason| DocumentError::Parse {
                path: id.path().to_path_buf(),
                reason,
            })?,
            None => Mapping::new(),
        };
        Ok(Self {
            id,
            metadata,
            body: split.body.to_string(),
            original_header: split.header.map(str::to_string),
            metadata_dirty: false,
            body_dirty: false,
            modified: None,
        })
    }

    /// Read and parse a document from disk.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| DocumentError::io(&path, e))?;
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let mut doc = Self::parse(DocumentId::new(path), &content)?;
        doc.modified = modified;
        Ok(doc)
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.id.path()
    }

    /// Last modification time on disk, if the document was loaded from a file.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn metadata(&self) -> &Mapping {
        &self.metadata
    }

    pub fn is_dirty(&self) -> bool {
        self.metadata_dirty || self.body_dirty
    }

    pub fn title(&self) -> String {
        self.get_str("title")
            .map(str::to_string)
            .unwrap_or_else(|| self.id.stem())
    }

    // ── Stages ──────────────────────────────────────────────────────

    pub fn stages(&self) -> Vec<String> {
        match self.metadata.get(STAGES_KEY) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        match self.metadata.get(STAGES_KEY) {
            Some(Value::Sequence(seq)) => seq.iter().any(|v| v.as_str() == Some(stage)),
            _ => false,
        }
    }

    /// Record a completed stage. Returns `false` if it was already present.
    pub fn add_stage(&mut self, stage: &str) -> bool {
        if self.has_stage(stage) {
            return false;
        }
        let key = Value::from(STAGES_KEY);
        match self.metadata.get_mut(&key) {
            Some(Value::Sequence(seq)) => seq.push(Value::from(stage)),
            _ => {
                self.metadata
                    .insert(key, Value::Sequence(vec![Value::from(stage)]));
            }
        }
        self.metadata_dirty = true;
        true
    }

    // ── Category and tags ───────────────────────────────────────────

    /// Parsed category. Unknown strings read back as `None`.
    pub fn category(&self) -> Option<Category> {
        self.get_str(CATEGORY_KEY).and_then(|s| s.parse().ok())
    }

    pub fn set_category(&mut self, category: Category) {
        self.set_value(CATEGORY_KEY, Value::from(category.as_str()));
    }

    pub fn tags(&self) -> Vec<String> {
        self.string_list(TAGS_KEY)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().iter().any(|t| t == tag)
    }

    /// Append a tag unless already present.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.has_tag(tag) {
            return false;
        }
        let key = Value::from(TAGS_KEY);
        match self.metadata.get_mut(&key) {
            Some(Value::Sequence(seq)) => seq.push(Value::from(tag)),
            Some(Value::String(existing)) => {
                let first = Value::from(existing.as_str());
                self.metadata
                    .insert(key, Value::Sequence(vec![first, Value::from(tag)]));
            }
            _ => {
                self.metadata.insert(key, Value::Sequence(vec![Value::from(tag)]));
            }
        }
        self.metadata_dirty = true;
        true
    }

    pub fn source_tags(&self) -> Vec<String> {
        self.string_list(SOURCE_TAGS_KEY)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.metadata.get(ABANDONED_KEY), Some(Value::Bool(true)))
    }

    /// The `date` field, accepting `YYYY-MM-DD` with optional trailing time.
    pub fn date(&self) -> Option<NaiveDate> {
        let raw = self.get_str(DATE_KEY)?;
        let day = raw.get(..10).unwrap_or(raw);
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }

    // ── Flags ───────────────────────────────────────────────────────

    pub fn get_flag(&self, namespace: &str, name: &str, default: bool) -> bool {
        match self.metadata.get(flag_key(namespace, name).as_str()) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn set_flag(&mut self, namespace: &str, name: &str, value: bool) {
        self.set_value(&flag_key(namespace, name), Value::Bool(value));
    }

    pub fn clear_flag(&mut self, namespace: &str, name: &str) {
        self.remove_field(&flag_key(namespace, name));
    }

    /// All `*_pending` boolean keys.
    pub fn pending_flags(&self) -> impl Iterator<Item = (&str, bool)> {
        self.metadata.iter().filter_map(|(k, v)| {
            let key = k.as_str()?;
            match (key.ends_with(PENDING_SUFFIX), v) {
                (true, Value::Bool(b)) => Some((key, *b)),
                _ => None,
            }
        })
    }

    // ── Side-channel fields ─────────────────────────────────────────

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Deserialize a field. Missing or mistyped fields are `None`.
    pub fn get_field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.metadata.get(key)?;
        serde_yaml::from_value(value.clone()).ok()
    }

    pub fn set_field<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), DocumentError> {
        let value = serde_yaml::to_value(value).map_err(|e| DocumentError::Render {
            path: self.path().to_path_buf(),
            reason: format!("field '{key}': {e}"),
        })?;
        self.set_value(key, value);
        Ok(())
    }

    /// Remove a field. Returns `true` if it existed.
    pub fn remove_field(&mut self, key: &str) -> bool {
        let removed = self.metadata.remove(key).is_some();
        if removed {
            self.metadata_dirty = true;
        }
        removed
    }

    fn set_value(&mut self, key: &str, value: Value) {
        if self.metadata.get(key) == Some(&value) {
            return;
        }
        self.metadata.insert(Value::from(key), value);
        self.metadata_dirty = true;
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.metadata.get(key) {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    // ── Body ────────────────────────────────────────────────────────

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        let body = body.into();
        if body != self.body {
            self.body = body;
            self.body_dirty = true;
        }
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Full file content. Untouched metadata keeps its original text.
    pub fn render(&self) -> Result<String, DocumentError> {
        let header = match (&self.original_header, self.metadata_dirty) {
            (Some(original), false) => original.clone(),
            (None, false) => String::new(),
            (_, true) => frontmatter::render(&self.metadata).map_err(|reason| {
                DocumentError::Render {
                    path: self.path().to_path_buf(),
                    reason,
                }
            })?,
        };
        Ok(format!("{header}{}", self.body))
    }

    /// Atomically persist the document. Returns `false` when nothing changed.
    pub async fn save(&mut self) -> Result<bool, DocumentError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let content = self.render()?;
        write_atomic(self.path(), &content).await?;

        let split = frontmatter::split(&content);
        self.original_header = split.header.map(str::to_string);
        self.metadata_dirty = false;
        self.body_dirty = false;
        self.modified = Some(Utc::now());
        Ok(true)
    }
}

/// Write `content` to a sibling temp file, then rename it over `path`.
pub async fn write_atomic(path: &Path, content: &str) -> Result<(), DocumentError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, content).await {
        return Err(DocumentError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(DocumentError::io(path, e));
    }
    Ok(())
}
