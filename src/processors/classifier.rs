//! Transcript classification.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CLASSIFIED, excerpt};
use crate::document::{Category, Document};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::processor::{ProcessOutcome, Processor, ProcessorSpec};

const TRANSCRIBED: &str = "transcribed";
const TRANSCRIPTION_TAG: &str = "transcription";
const MAX_TRANSCRIPT_CHARS: usize = 8000;

/// Assigns one [`Category`] to each transcript and tags it with it.
pub struct Classifier {
    spec: ProcessorSpec,
    llm: Arc<dyn LlmProvider>,
}

impl Classifier {
    pub fn new(input_dir: impl Into<PathBuf>, llm: Arc<dyn LlmProvider>) -> Self {
        Self::with_spec(Self::default_spec(input_dir), llm)
    }

    pub fn with_spec(spec: ProcessorSpec, llm: Arc<dyn LlmProvider>) -> Self {
        Self { spec, llm }
    }

    pub fn default_spec(input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new("classifier", CLASSIFIED, input_dir).requires(TRANSCRIBED)
    }
}

#[async_trait]
impl Processor for Classifier {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    fn accepts_extra(&self, doc: &Document) -> bool {
        doc.has_tag(TRANSCRIPTION_TAG)
    }

    async fn process(&self, doc: &mut Document) -> ProcessOutcome {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(build_classify_user_prompt(doc)),
        ])
        .with_max_tokens(16)
        .with_temperature(0.0);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(e) => return ProcessOutcome::Failed(e.into()),
        };

        let category = match parse_category(&response.content) {
            Ok(category) => category,
            Err(e) => {
                debug!(doc = %doc.id(), raw = %response.content, "Unusable classification");
                return ProcessOutcome::transient(e);
            }
        };

        doc.set_category(category);
        doc.add_tag(category.as_str());
        info!(doc = %doc.id(), category = %category, "Classified transcript");
        ProcessOutcome::Completed
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt() -> String {
    let mut prompt = String::from(
        "You classify voice note transcripts from a personal knowledge base.\n\n\
         Categories:\n",
    );
    for category in Category::ALL {
        prompt.push_str(&format!("- {}: {}\n", category, describe(category)));
    }
    prompt.push_str(
        "\nRespond with ONLY the category name, in lowercase, with no punctuation or explanation.",
    );
    prompt
}

fn describe(category: Category) -> &'static str {
    match category {
        Category::Meeting => "a conversation or call between several people about work or a project",
        Category::Diary => "a personal journal entry about the day, feelings or events",
        Category::Idea => "a new concept, project idea or brainstorm",
        Category::Meditation => "a guided or reflective meditation session",
        Category::Todo => "a list of tasks or reminders to act on",
        Category::Mention => "a short note about a person, book or resource to remember",
        Category::Email => "an email digest or dictated email",
        Category::Conversation => "an informal conversation that is not a work meeting",
    }
}

fn build_classify_user_prompt(doc: &Document) -> String {
    format!("Transcript:\n{}", excerpt(doc.body().trim(), MAX_TRANSCRIPT_CHARS))
}

// ── Response parsing ────────────────────────────────────────────────

/// First word of the answer, stripped of quotes and punctuation.
fn parse_category(raw: &str) -> Result<Category, String> {
    let word = raw
        .split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .unwrap_or_default();
    if word.is_empty() {
        return Err("empty classification".to_string());
    }
    word.parse()
}
