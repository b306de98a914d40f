//! Idea and todo extraction.
//!
//! The extracted items are appended under a `## Ideas` (or `## Todos`)
//! heading at the end of the body. Optionally every extraction is also
//! collected into a directory note that links back to its source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{CLASSIFIED, excerpt};
use crate::document::{Category, Document, DocumentLocks, write_atomic};
use crate::error::DocumentError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::processor::{ProcessFailure, ProcessOutcome, Processor, ProcessorSpec};

const MAX_TRANSCRIPT_CHARS: usize = 12000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionKind {
    Ideas,
    Todos,
}

impl ExtractionKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Ideas => "idea_extractor",
            Self::Todos => "todo_extractor",
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Ideas => "ideas_extracted",
            Self::Todos => "todos_extracted",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::Ideas => Category::Idea,
            Self::Todos => Category::Todo,
        }
    }

    /// Section heading, without the `##`.
    pub fn heading(&self) -> &'static str {
        match self {
            Self::Ideas => "Ideas",
            Self::Todos => "Todos",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            Self::Ideas => {
                "Extract every distinct idea from the transcript. Rephrase each one as a \
                 short, self-contained sentence a reader can understand without the transcript."
            }
            Self::Todos => {
                "Extract every actionable task from the transcript. Phrase each one as an \
                 imperative starting with a verb, and keep any deadline that was mentioned."
            }
        }
    }

    fn directory_template(&self) -> &'static str {
        match self {
            Self::Ideas => "---\ntags:\n  - ideas\n  - directory\n---\n# Ideas Directory\n\n",
            Self::Todos => "---\ntags:\n  - todos\n  - directory\n---\n# Todo Directory\n\n",
        }
    }
}

/// Extracts one kind of item into a body section.
pub struct SectionExtractor {
    spec: ProcessorSpec,
    kind: ExtractionKind,
    llm: Arc<dyn LlmProvider>,
    directory: Option<PathBuf>,
    locks: Arc<DocumentLocks>,
}

impl SectionExtractor {
    pub fn new(kind: ExtractionKind, input_dir: impl Into<PathBuf>, llm: Arc<dyn LlmProvider>) -> Self {
        Self::with_spec(kind, Self::default_spec(kind, input_dir), llm)
    }

    pub fn with_spec(kind: ExtractionKind, spec: ProcessorSpec, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            spec,
            kind,
            llm,
            directory: None,
            locks: Arc::new(DocumentLocks::new()),
        }
    }

    pub fn default_spec(kind: ExtractionKind, input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new(kind.key(), kind.stage(), input_dir)
            .requires(CLASSIFIED)
            .categories([kind.category()])
    }

    /// Also collect extractions into the directory note at `path`.
    pub fn with_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.directory = Some(path.into());
        self
    }

    /// Serialize directory note writes through `locks`.
    pub fn with_locks(mut self, locks: Arc<DocumentLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn kind(&self) -> ExtractionKind {
        self.kind
    }

    async fn extract(&self, doc: &mut Document) -> Result<ProcessOutcome, ProcessFailure> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_extract_system_prompt(self.kind)),
            ChatMessage::user(format!(
                "Transcript:\n{}",
                excerpt(doc.body().trim(), MAX_TRANSCRIPT_CHARS)
            )),
        ])
        .with_temperature(0.2);

        let response: ExtractionResponse = complete_json(self.llm.as_ref(), request).await?;
        let items = response.cleaned();
        if items.is_empty() {
            debug!(doc = %doc.id(), kind = self.kind.heading(), "Nothing extracted");
            return Ok(ProcessOutcome::Completed);
        }

        let body = append_section(doc.body(), self.kind.heading(), &items);
        doc.set_body(body);

        if let Some(directory) = &self.directory {
            let date = doc.get_str("date").unwrap_or_default().to_string();
            let _guard = self.locks.lock(directory).await;
            let added = append_to_directory(directory, self.kind, &doc.id().stem(), &date, &items).await?;
            if added {
                info!(doc = %doc.id(), directory = %directory.display(), "Added to directory note");
            }
        }

        info!(doc = %doc.id(), kind = self.kind.heading(), items = items.len(), "Extracted items");
        Ok(ProcessOutcome::Completed)
    }
}

#[async_trait]
impl Processor for SectionExtractor {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    async fn process(&self, doc: &mut Document) -> ProcessOutcome {
        self.extract(doc).await.unwrap_or_else(ProcessOutcome::Failed)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_extract_system_prompt(kind: ExtractionKind) -> String {
    format!(
        "You extract structured notes from voice transcripts.\n\n\
         {}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"items\": [\"...\", \"...\"]}}\n\n\
         Rules:\n\
         - One item per entry, no numbering or bullet characters\n\
         - Use the language of the transcript\n\
         - Return an empty list if there is nothing to extract",
        kind.instructions()
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    items: Vec<String>,
}

impl ExtractionResponse {
    /// Trimmed, non-empty items with any leading bullet removed.
    fn cleaned(self) -> Vec<String> {
        self.items
            .into_iter()
            .map(|item| item.trim().trim_start_matches(['-', '*']).trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    }
}

// ── Output ──────────────────────────────────────────────────────────

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn append_section(body: &str, heading: &str, items: &[String]) -> String {
    let mut out = body.trim_end().to_string();
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("\n## {heading}\n\n{}\n", bullet_list(items)));
    out
}

/// Append one entry to the directory note, creating it from the template.
/// Returns `false` when the note already links to `stem`.
async fn append_to_directory(
    path: &Path,
    kind: ExtractionKind,
    stem: &str,
    date: &str,
    items: &[String],
) -> Result<bool, DocumentError> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DocumentError::io(parent, e))?;
            }
            kind.directory_template().to_string()
        }
        Err(e) => return Err(DocumentError::io(path, e)),
    };

    let link = format!("[[{stem}]]");
    if existing.contains(&link) {
        return Ok(false);
    }

    let entry = format!(
        "\n## {} from {link} - {date}\n\n{}\n\n---\n",
        kind.heading(),
        bullet_list(items)
    );
    write_atomic(path, &format!("{existing}{entry}")).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::processors::testing::ScriptedLlm;
    use tempfile::TempDir;

    fn idea_doc() -> Document {
        Document::parse(
            DocumentId::new("/vault/2025-12-20 Voice.md"),
            "---\ndate: 2025-12-20\ncategory: idea\nprocessing_stages: [transcribed, classified]\n---\nWhat if notes synced offline?\n",
        )
        .unwrap()
    }

    #[test]
    fn default_spec_per_kind() {
        let spec = SectionExtractor::default_spec(ExtractionKind::Todos, "/vault");
        assert_eq!(spec.key, "todo_extractor");
        assert_eq!(spec.stage, "todos_extracted");
        assert_eq!(spec.required_stage.as_deref(), Some("classified"));
        assert_eq!(spec.categories, vec![Category::Todo]);
    }

    #[test]
    fn section_is_appended_after_body() {
        let body = append_section("Transcript text\n\n", "Ideas", &["One".into(), "Two".into()]);
        assert_eq!(body, "Transcript text\n\n## Ideas\n\n- One\n- Two\n");
    }

    #[test]
    fn items_are_cleaned() {
        let response = ExtractionResponse {
            items: vec!["- Offline sync".into(), "   ".into(), "* Share links ".into()],
        };
        assert_eq!(response.cleaned(), vec!["Offline sync", "Share links"]);
    }

    #[tokio::test]
    async fn appends_idea_section() {
        let llm = Arc::new(ScriptedLlm::new([r#"{"items": ["Offline sync for notes"]}"#]));
        let extractor = SectionExtractor::new(ExtractionKind::Ideas, "/vault", llm);
        let mut doc = idea_doc();
        assert!(extractor.accepts(&doc));

        let outcome = extractor.process(&mut doc).await;
        assert_eq!(outcome, ProcessOutcome::Completed);
        assert!(doc.body().starts_with("What if notes synced offline?\n"));
        assert!(doc.body().ends_with("\n## Ideas\n\n- Offline sync for notes\n"));
    }

    #[tokio::test]
    async fn empty_extraction_completes_without_section() {
        let llm = Arc::new(ScriptedLlm::new([r#"{"items": []}"#]));
        let extractor = SectionExtractor::new(ExtractionKind::Ideas, "/vault", llm);
        let mut doc = idea_doc();

        assert_eq!(extractor.process(&mut doc).await, ProcessOutcome::Completed);
        assert!(!doc.is_dirty());
    }

    #[tokio::test]
    async fn malformed_answer_is_transient() {
        let llm = Arc::new(ScriptedLlm::new(["Sure! Here are the ideas: offline sync"]));
        let extractor = SectionExtractor::new(ExtractionKind::Ideas, "/vault", llm);
        let outcome = extractor.process(&mut idea_doc()).await;
        assert_eq!(outcome.label(), "transient");
    }

    #[tokio::test]
    async fn directory_note_is_created_and_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let directory = dir.path().join("KnowledgeBot").join("Ideas Directory.md");
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"items": ["Offline sync"]}"#,
            r#"{"items": ["Offline sync"]}"#,
        ]));
        let extractor =
            SectionExtractor::new(ExtractionKind::Ideas, "/vault", llm).with_directory(&directory);

        extractor.process(&mut idea_doc()).await;
        let content = tokio::fs::read_to_string(&directory).await.unwrap();
        assert!(content.starts_with("---\ntags:\n  - ideas\n  - directory\n---\n# Ideas Directory\n"));
        assert!(content.contains("\n## Ideas from [[2025-12-20 Voice]] - 2025-12-20\n\n- Offline sync\n\n---\n"));

        extractor.process(&mut idea_doc()).await;
        let again = tokio::fs::read_to_string(&directory).await.unwrap();
        assert_eq!(again, content);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_directory_note_keeps_concurrent_entries() {
        let dir = TempDir::new().unwrap();
        let directory = dir.path().join("Ideas Directory.md");
        let locks = Arc::new(DocumentLocks::new());
        let extractor = |reply: &'static str| {
            SectionExtractor::new(ExtractionKind::Ideas, "/vault", Arc::new(ScriptedLlm::new([reply])))
                .with_directory(&directory)
                .with_locks(Arc::clone(&locks))
        };
        let first = extractor(r#"{"items": ["Offline sync"]}"#);
        let second = extractor(r#"{"items": ["Shared links"]}"#);

        let mut voice = idea_doc();
        let mut walk = Document::parse(
            DocumentId::new("/vault/2025-12-21 Walk.md"),
            "---\ndate: 2025-12-21\ncategory: idea\nprocessing_stages: [classified]\n---\nShare links?\n",
        )
        .unwrap();
        let (a, b) = tokio::join!(first.process(&mut voice), second.process(&mut walk));
        assert_eq!(a, ProcessOutcome::Completed);
        assert_eq!(b, ProcessOutcome::Completed);

        let content = tokio::fs::read_to_string(&directory).await.unwrap();
        assert!(content.contains("[[2025-12-20 Voice]]"));
        assert!(content.contains("[[2025-12-21 Walk]]"));
        assert_eq!(content.matches("# Ideas Directory").count(), 1);
    }
}
