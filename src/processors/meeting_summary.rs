//! Meeting summaries and the monthly meeting index.
//!
//! The AI drafts a summary with recent index entries as context, the user
//! edits it in a free-text form, and the accepted summary is upserted into
//! `<YYYY-MM> Meetings.md`, newest meeting first.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{Local, Months, NaiveDate, Utc};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::speaker_identifier::ATTENDEES_KEY;
use super::{ResolvedEntity, SPEAKERS_IDENTIFIED, excerpt};
use crate::document::{Category, Document, DocumentLocks, frontmatter, write_atomic};
use crate::error::DocumentError;
use crate::forms::{self, Form, FormReadback};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::notify::Notifier;
use crate::processor::{ProcessFailure, ProcessOutcome, Processor, ProcessorSpec};
use crate::review::{ReviewWorkflow, run_review};

const MAX_INDEX_LINES: usize = 500;
/// Below this many lines the previous month is added as context.
const MIN_INDEX_LINES: usize = 100;
const MAX_TRANSCRIPT_CHARS: usize = 30000;

static ENTRY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,2} (\d{4}-\d{2}-\d{2}) - (.+)$").unwrap());
static WIKILINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[[^\]]+\]\]").unwrap());

/// Closes an entry. Summaries are free markdown, so a `---` rule cannot.
const ENTRY_END: &str = "<!-- entry:end -->";

pub struct MeetingSummarizer {
    spec: ProcessorSpec,
    llm: Arc<dyn LlmProvider>,
    notifier: Arc<dyn Notifier>,
    index_dir: PathBuf,
    locks: Arc<DocumentLocks>,
}

impl MeetingSummarizer {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        index_dir: impl Into<PathBuf>,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_spec(Self::default_spec(input_dir), index_dir, llm, notifier)
    }

    pub fn with_spec(
        spec: ProcessorSpec,
        index_dir: impl Into<PathBuf>,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            spec,
            llm,
            notifier,
            index_dir: index_dir.into(),
            locks: Arc::new(DocumentLocks::new()),
        }
    }

    /// Serialize index rewrites through `locks`.
    pub fn with_locks(mut self, locks: Arc<DocumentLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn default_spec(input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new("meeting_summary", "meeting_summarized", input_dir)
            .requires(SPEAKERS_IDENTIFIED)
            .flag_namespace("meeting_summary")
            .categories([Category::Meeting])
    }

    fn index_path(&self, date: NaiveDate) -> PathBuf {
        self.index_dir.join(format!("{} Meetings.md", month_of(date)))
    }

    /// Tail of this month's index, topped up from the previous month when
    /// this month is still sparse.
    async fn index_context(&self, date: NaiveDate) -> Result<String, DocumentError> {
        let mut lines = read_lines(&self.index_path(date)).await?;
        if lines.len() > MAX_INDEX_LINES {
            lines.drain(..lines.len() - MAX_INDEX_LINES);
        }

        if lines.len() < MIN_INDEX_LINES
            && let Some(previous) = date.checked_sub_months(Months::new(1))
        {
            let mut earlier = read_lines(&self.index_path(previous)).await?;
            if !earlier.is_empty() {
                let room = MAX_INDEX_LINES - lines.len();
                if earlier.len() > room {
                    earlier.drain(..earlier.len() - room);
                }
                earlier.push("\n--- Current Month ---\n".to_string());
                earlier.append(&mut lines);
                lines = earlier;
            }
        }

        if lines.is_empty() {
            return Ok("No previous meetings in index.".to_string());
        }
        Ok(lines.join("\n"))
    }
}

fn meeting_date(doc: &Document) -> NaiveDate {
    doc.date().unwrap_or_else(|| Utc::now().date_naive())
}

fn month_of(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

async fn read_lines(path: &Path) -> Result<Vec<String>, DocumentError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content.trim().lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(DocumentError::io(path, e)),
    }
}

#[async_trait]
impl Processor for MeetingSummarizer {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    async fn process(&self, doc: &mut Document) -> ProcessOutcome {
        run_review(self, doc, self.notifier.as_ref()).await
    }
}

#[async_trait]
impl ReviewWorkflow for MeetingSummarizer {
    type Proposal = String;
    type Accepted = String;

    fn namespace(&self) -> &str {
        self.spec.namespace()
    }

    fn display_name(&self) -> &str {
        "Meeting Summary"
    }

    async fn propose(&self, doc: &Document) -> Result<Option<String>, ProcessFailure> {
        let context = self.index_context(meeting_date(doc)).await?;
        let transcript = forms::remove_form(doc.body(), self.namespace());
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_summary_system_prompt()),
            ChatMessage::user(build_summary_user_prompt(doc, &context, &transcript)),
        ])
        .with_temperature(0.3);

        let response = self.llm.complete(request).await?;
        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(ProcessFailure::Transient("empty summary from AI".to_string()));
        }
        debug!(doc = %doc.id(), chars = summary.len(), "Meeting summary drafted");
        Ok(Some(summary.to_string()))
    }

    fn render(&self, _doc: &mut Document, proposal: String) -> Result<Form, ProcessFailure> {
        Ok(Form::new(self.namespace(), "Meeting Summary - Review and edit as needed").text(proposal))
    }

    fn parse(&self, _doc: &Document, form: &FormReadback) -> Result<String, Vec<String>> {
        match form.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(vec!["Summary cannot be empty".to_string()]),
        }
    }

    async fn finalize(&self, doc: &mut Document, summary: String) -> Result<String, ProcessFailure> {
        let date = meeting_date(doc);
        let mut mentioned: Vec<String> = doc
            .get_field::<Vec<ResolvedEntity>>("resolved_entities")
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.resolved_link)
            .filter(|link| !link.is_empty())
            .collect();
        mentioned.sort();
        mentioned.dedup();

        let entry = IndexEntry {
            date: date.format("%Y-%m-%d").to_string(),
            title: doc.title(),
            source: format!("[[{}]]", doc.id().stem()),
            attendees: doc.get_field(ATTENDEES_KEY).unwrap_or_default(),
            mentioned,
            summary: summary.clone(),
        };

        let path = self.index_path(date);
        let _guard = self.locks.lock(&path).await;
        let mut index = MonthlyIndex::load(&path).await?;
        if index.upsert(entry) {
            info!(doc = %doc.id(), index = %path.display(), "Overwriting existing index entry");
        }
        index.save(&path, &month_of(date)).await?;
        info!(doc = %doc.id(), index = %path.display(), entries = index.len(), "Updated monthly index");

        Ok(format!(
            "> [!success] Meeting Summary Complete - See [[{} Meetings]]\n\n{summary}",
            month_of(date)
        ))
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_summary_system_prompt() -> String {
    "You write concise meeting summaries for a personal knowledge base.\n\n\
     Rules:\n\
     - Start with one sentence stating the purpose of the meeting\n\
     - Follow with bullet points for decisions, key points and action items\n\
     - Keep existing [[wikilinks]] exactly as written\n\
     - Use the previous meetings only to connect recurring topics, never summarize them\n\
     - Respond with the summary only, in markdown, without a title"
        .to_string()
}

fn build_summary_user_prompt(doc: &Document, context: &str, transcript: &str) -> String {
    let mut prompt = String::with_capacity(transcript.len() + context.len() + 128);
    prompt.push_str(&format!("Meeting: {}\n", doc.title()));
    if let Some(date) = doc.date() {
        prompt.push_str(&format!("Date: {date}\n"));
    }
    prompt.push_str(&format!("\nPrevious meetings:\n{context}\n"));
    prompt.push_str(&format!(
        "\nTranscript:\n{}",
        excerpt(transcript.trim(), MAX_TRANSCRIPT_CHARS)
    ));
    prompt
}

// ── Monthly index ───────────────────────────────────────────────────

/// One meeting in the monthly index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub title: String,
    /// `[[...]]` link to the meeting note. Unique within an index.
    pub source: String,
    pub attendees: Vec<String>,
    pub mentioned: Vec<String>,
    pub summary: String,
}

/// The `<YYYY-MM> Meetings.md` note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthlyIndex {
    metadata: Mapping,
    entries: Vec<IndexEntry>,
}

impl MonthlyIndex {
    /// Parse an index note. Sections without a source link are dropped.
    pub fn parse(content: &str) -> Self {
        let split = frontmatter::split(content);
        let metadata = split
            .yaml
            .and_then(|yaml| frontmatter::parse(yaml).ok())
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut current: Option<(IndexEntry, bool)> = None;
        for line in split.body.lines() {
            if let Some(caps) = ENTRY_HEADER.captures(line) {
                if let Some((entry, closed)) = current.take() {
                    entries.push(finish_entry(entry, closed));
                }
                current = Some((
                    IndexEntry {
                        date: caps[1].to_string(),
                        title: caps[2].trim().to_string(),
                        source: String::new(),
                        attendees: Vec::new(),
                        mentioned: Vec::new(),
                        summary: String::new(),
                    },
                    false,
                ));
                continue;
            }
            let Some((entry, closed)) = current.as_mut() else {
                continue;
            };
            if *closed {
                continue;
            }
            if line.trim() == ENTRY_END {
                *closed = true;
                continue;
            }
            // Metadata lines only count once, before the summary starts
            if entry.summary.trim().is_empty() {
                if entry.source.is_empty()
                    && let Some(rest) = line.strip_prefix("*Source:*")
                {
                    entry.source = WIKILINK.find(rest).map(|m| m.as_str().to_string()).unwrap_or_default();
                    continue;
                }
                if entry.attendees.is_empty()
                    && let Some(rest) = line.strip_prefix("**Attendees:**")
                {
                    entry.attendees = links_in(rest);
                    continue;
                }
                if entry.mentioned.is_empty()
                    && let Some(rest) = line.strip_prefix("**Mentioned:**")
                {
                    entry.mentioned = links_in(rest);
                    continue;
                }
            }
            entry.summary.push_str(line);
            entry.summary.push('\n');
        }
        if let Some((entry, closed)) = current {
            entries.push(finish_entry(entry, closed));
        }

        let entries = entries.into_iter().filter(|e| !e.source.is_empty()).collect();
        Self { metadata, entries }
    }

    pub async fn load(path: &Path) -> Result<Self, DocumentError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DocumentError::io(path, e)),
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry with the same source. Returns `true` when
    /// an entry was replaced.
    pub fn upsert(&mut self, entry: IndexEntry) -> bool {
        let replaced = match self.entries.iter_mut().find(|e| e.source == entry.source) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.entries.push(entry);
                false
            }
        };
        // Dates are ISO strings; sort_by is stable.
        self.entries.sort_by(|a, b| b.date.cmp(&a.date));
        replaced
    }

    pub fn render(&self, month: &str) -> Result<String, String> {
        let mut metadata = self.metadata.clone();
        if !metadata.contains_key("type") {
            metadata.insert(Value::from("type"), Value::from("meeting_index"));
        }
        if !metadata.contains_key("month") {
            metadata.insert(Value::from("month"), Value::from(month));
        }
        metadata.insert(
            Value::from("updated"),
            Value::from(Local::now().format("%Y-%m-%d %H:%M").to_string()),
        );
        metadata.insert(Value::from("entry_count"), Value::from(self.entries.len() as u64));

        let mut lines: Vec<String> = Vec::new();
        for entry in &self.entries {
            lines.push(format!("# {} - {}", entry.date, entry.title));
            lines.push(String::new());
            lines.push(format!("*Source:* {}", entry.source));
            lines.push(String::new());
            let mut has_metadata = false;
            if !entry.attendees.is_empty() {
                lines.push(format!("**Attendees:** {}", entry.attendees.join(", ")));
                has_metadata = true;
            }
            if !entry.mentioned.is_empty() {
                lines.push(format!("**Mentioned:** {}", entry.mentioned.join(", ")));
                has_metadata = true;
            }
            if has_metadata {
                lines.push(String::new());
            }
            lines.push(entry.summary.clone());
            lines.push(ENTRY_END.to_string());
            lines.push(String::new());
            lines.push("---".to_string());
            lines.push(String::new());
        }

        Ok(format!("{}{}", frontmatter::render(&metadata)?, lines.join("\n")))
    }

    pub async fn save(&self, path: &Path, month: &str) -> Result<(), DocumentError> {
        let content = self.render(month).map_err(|reason| DocumentError::Render {
            path: path.to_path_buf(),
            reason,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DocumentError::io(parent, e))?;
        }
        write_atomic(path, &content).await
    }
}

/// Trim the summary. Entries written without an end marker close with a
/// `---` rule, which is not part of the summary.
fn finish_entry(mut entry: IndexEntry, closed: bool) -> IndexEntry {
    let mut summary = entry.summary.trim();
    if !closed && let Some(rest) = summary.strip_suffix("---") {
        summary = rest.trim_end();
    }
    entry.summary = summary.to_string();
    entry
}

fn links_in(text: &str) -> Vec<String> {
    WIKILINK.find_iter(text).map(|m| m.as_str().to_string()).collect()
}
