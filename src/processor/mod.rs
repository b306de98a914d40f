//! Processor contract.
//!
//! A processor advances documents from its required stage to its own stage.
//! Eligibility is declared in a [`ProcessorSpec`]; the work itself happens in
//! [`Processor::process`], which reports a [`ProcessOutcome`] instead of
//! raising. The scheduler decides what to persist from that outcome.

pub mod registry;

pub use registry::ProcessorRegistry;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::warn;

use crate::document::{Category, Document, DocumentId, DocumentStore};
use crate::error::{DocumentError, LlmError};

/// Declared eligibility of one registered processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSpec {
    /// Unique registration key.
    pub key: String,
    /// Stage recorded when the processor completes.
    pub stage: String,
    /// Stage that must already be recorded.
    pub required_stage: Option<String>,
    /// Accepted categories. Empty accepts any document, categorised or not.
    pub categories: Vec<Category>,
    /// Prefix of the processor's frontmatter flags.
    pub flag_namespace: Option<String>,
    /// Directory scanned for candidates.
    pub input_dir: PathBuf,
    /// Skip documents modified more recently than this.
    pub min_age: Option<Duration>,
    /// Skip documents whose `date` is earlier than this.
    pub not_before: Option<NaiveDate>,
}

impl ProcessorSpec {
    pub fn new(key: impl Into<String>, stage: impl Into<String>, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            stage: stage.into(),
            required_stage: None,
            categories: Vec::new(),
            flag_namespace: None,
            input_dir: input_dir.into(),
            min_age: None,
            not_before: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn requires(mut self, stage: impl Into<String>) -> Self {
        self.required_stage = Some(stage.into());
        self
    }

    pub fn categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = categories.into_iter().collect();
        self
    }

    pub fn flag_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.flag_namespace = Some(namespace.into());
        self
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    pub fn min_age(mut self, age: Duration) -> Self {
        self.min_age = Some(age);
        self
    }

    pub fn not_before(mut self, date: NaiveDate) -> Self {
        self.not_before = Some(date);
        self
    }

    /// Flag namespace, falling back to the registration key.
    pub fn namespace(&self) -> &str {
        self.flag_namespace.as_deref().unwrap_or(&self.key)
    }

    /// Stage and category eligibility.
    pub fn accepts(&self, doc: &Document) -> bool {
        if doc.is_abandoned() || doc.has_stage(&self.stage) {
            return false;
        }
        if let Some(required) = &self.required_stage
            && !doc.has_stage(required)
        {
            return false;
        }
        if !self.categories.is_empty() {
            match doc.category() {
                Some(category) if self.categories.contains(&category) => {}
                _ => return false,
            }
        }
        true
    }

    /// Age and date gates applied during candidate selection.
    fn is_due(&self, doc: &Document) -> bool {
        if let Some(min_age) = self.min_age
            && let Some(modified) = doc.modified()
        {
            let age = Utc::now().signed_duration_since(modified);
            if age.to_std().map(|age| age < min_age).unwrap_or(true) {
                return false;
            }
        }
        if let Some(not_before) = self.not_before
            && let Some(date) = doc.date()
            && date < not_before
        {
            return false;
        }
        true
    }
}

/// Why a processor could not complete a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFailure {
    /// Retry on the next tick: timeouts, AI errors, I/O.
    Transient(String),
    /// User-correctable input. The error callout is already in the document.
    Validation(Vec<String>),
    /// Retrying will not help.
    Permanent(String),
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(reason) => write!(f, "transient failure: {reason}"),
            Self::Validation(errors) => write!(f, "validation failed: {}", errors.join("; ")),
            Self::Permanent(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

impl From<LlmError> for ProcessFailure {
    fn from(e: LlmError) -> Self {
        Self::Transient(e.to_string())
    }
}

impl From<DocumentError> for ProcessFailure {
    fn from(e: DocumentError) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Record the stage and save.
    Completed,
    /// Nothing to do yet. Edits are saved, the stage is not recorded.
    NotReady { reason: String },
    Failed(ProcessFailure),
}

impl ProcessOutcome {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Failed(ProcessFailure::Transient(reason.into()))
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Failed(ProcessFailure::Permanent(reason.into()))
    }

    /// Whether document edits made during the invocation should be kept.
    pub fn keeps_edits(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::NotReady { .. } | Self::Failed(ProcessFailure::Validation(_))
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NotReady { .. } => "not_ready",
            Self::Failed(ProcessFailure::Transient(_)) => "transient",
            Self::Failed(ProcessFailure::Validation(_)) => "validation",
            Self::Failed(ProcessFailure::Permanent(_)) => "permanent",
        }
    }
}

impl From<ProcessFailure> for ProcessOutcome {
    fn from(failure: ProcessFailure) -> Self {
        Self::Failed(failure)
    }
}

/// A pipeline step.
#[async_trait]
pub trait Processor: Send + Sync {
    fn spec(&self) -> &ProcessorSpec;

    /// Processor-specific eligibility on top of [`ProcessorSpec::accepts`].
    fn accepts_extra(&self, _doc: &Document) -> bool {
        true
    }

    /// Side-effect free eligibility check.
    fn accepts(&self, doc: &Document) -> bool {
        self.spec().accepts(doc) && self.accepts_extra(doc)
    }

    /// Documents in the input directory this processor would run on.
    ///
    /// Unreadable documents are logged and skipped.
    async fn select_candidates(&self, store: &DocumentStore) -> Vec<DocumentId> {
        let spec = self.spec();
        let ids = match store.list(&spec.input_dir).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(processor = %spec.key, error = %e, "Failed to list input directory");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for id in ids {
            match store.load(&id).await {
                Ok(doc) if self.accepts(&doc) && spec.is_due(&doc) => candidates.push(id),
                Ok(_) => {}
                Err(e) => {
                    warn!(processor = %spec.key, doc = %id, error = %e, "Skipping unreadable document");
                }
            }
        }
        candidates
    }

    /// Do the work. Mutations stay in memory; the caller saves.
    async fn process(&self, doc: &mut Document) -> ProcessOutcome;
}
