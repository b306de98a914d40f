//! Speaker identification for meeting transcripts.
//!
//! Transcripts label turns as `Speaker A:`, `Speaker B:` and so on. The AI
//! guesses who each label is, the user confirms a wikilink per speaker, and
//! the labels are then rewritten to those links. The linked speakers are kept
//! in the `attendees` field for the meeting index.
//!
//! A transcript with a single speaker is assigned to the vault owner without
//! a review when one is configured.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ENTITIES_RESOLVED, ResolvedEntity, SPEAKERS_IDENTIFIED, excerpt};
use crate::document::{Category, Document};
use crate::forms::{self, Form, FormField, FormReadback};
use crate::linking::EntityType;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::notify::Notifier;
use crate::processor::{ProcessFailure, ProcessOutcome, Processor, ProcessorSpec};
use crate::review::{ReviewWorkflow, run_review};

/// Frontmatter list of the speakers' links, in order of first turn.
pub const ATTENDEES_KEY: &str = "attendees";
const IDENTIFIED_KEY: &str = "identified_speakers";
const SPEAKERS_KEY: &str = "speakers";
const OPT_OUT_TAG: &str = "nospeaker";
const MAX_TRANSCRIPT_CHARS: usize = 30000;

static SPEAKER_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(Speaker [A-Za-z0-9]{1,3}):").unwrap());

/// The AI's guess for one label, as shown in the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerGuess {
    pub label: String,
    #[serde(default)]
    pub suggested_link: String,
    #[serde(default)]
    pub reason: String,
}

/// A confirmed label. An empty `link` keeps the label as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerMapping {
    pub label: String,
    #[serde(default)]
    pub link: String,
}

pub struct SpeakerIdentifier {
    spec: ProcessorSpec,
    llm: Arc<dyn LlmProvider>,
    notifier: Arc<dyn Notifier>,
    owner: Option<String>,
}

impl SpeakerIdentifier {
    pub fn new(input_dir: impl Into<PathBuf>, llm: Arc<dyn LlmProvider>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_spec(Self::default_spec(input_dir), llm, notifier)
    }

    pub fn with_spec(spec: ProcessorSpec, llm: Arc<dyn LlmProvider>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            spec,
            llm,
            notifier,
            owner: None,
        }
    }

    pub fn default_spec(input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new("speaker_identifier", SPEAKERS_IDENTIFIED, input_dir)
            .requires(ENTITIES_RESOLVED)
            .flag_namespace("speaker_identification")
            .categories([Category::Meeting])
    }

    /// Name of the vault owner, for single-speaker transcripts and as a hint.
    pub fn with_owner(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let name = name.trim();
        self.owner = (!name.is_empty()).then(|| name.to_string());
        self
    }

    fn owner_link(&self) -> Option<String> {
        self.owner.as_deref().map(as_wikilink)
    }
}

#[async_trait]
impl Processor for SpeakerIdentifier {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    async fn process(&self, doc: &mut Document) -> ProcessOutcome {
        if !doc.get_flag(self.namespace(), "pending", false) {
            let labels = speaker_labels(doc.body());
            if labels.is_empty() || doc.source_tags().iter().any(|t| t == OPT_OUT_TAG) {
                debug!(doc = %doc.id(), "No speakers to identify");
                return ProcessOutcome::Completed;
            }
            if let ([label], Some(owner)) = (labels.as_slice(), self.owner_link()) {
                let mapping = vec![SpeakerMapping {
                    label: label.clone(),
                    link: owner,
                }];
                return match apply_mappings(doc, &mapping) {
                    Ok(_) => {
                        info!(doc = %doc.id(), "Single speaker assigned to owner");
                        ProcessOutcome::Completed
                    }
                    Err(failure) => ProcessOutcome::Failed(failure),
                };
            }
        }
        run_review(self, doc, self.notifier.as_ref()).await
    }
}

#[async_trait]
impl ReviewWorkflow for SpeakerIdentifier {
    type Proposal = Vec<SpeakerGuess>;
    type Accepted = Vec<SpeakerMapping>;

    fn namespace(&self) -> &str {
        self.spec.namespace()
    }

    fn display_name(&self) -> &str {
        "Speaker Identification"
    }

    async fn propose(&self, doc: &Document) -> Result<Option<Vec<SpeakerGuess>>, ProcessFailure> {
        let transcript = forms::remove_form(doc.body(), self.namespace());
        let labels = speaker_labels(&transcript);
        if labels.is_empty() {
            return Ok(None);
        }
        let people = known_people(doc);

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_speaker_system_prompt()),
            ChatMessage::user(build_speaker_user_prompt(
                &labels,
                &people,
                self.owner.as_deref(),
                &transcript,
            )),
        ])
        .with_temperature(0.1);

        let response: SpeakerResponse = complete_json(self.llm.as_ref(), request).await?;
        let guesses = match_guesses(&labels, response, &people);
        debug!(doc = %doc.id(), speakers = guesses.len(), "Speakers guessed");
        Ok(Some(guesses))
    }

    fn render(&self, doc: &mut Document, proposal: Vec<SpeakerGuess>) -> Result<Form, ProcessFailure> {
        doc.set_field(IDENTIFIED_KEY, &proposal)?;

        let mut form = Form::new(
            self.namespace(),
            "Speaker Identification - Link each speaker to a person",
        );
        for (i, guess) in proposal.into_iter().enumerate() {
            let heading = match guess.reason.split_whitespace().collect::<Vec<_>>().join(" ") {
                reason if reason.is_empty() => guess.label,
                reason => format!("{} - {reason}", guess.label),
            };
            form = form.section(
                Some(heading),
                vec![FormField::new(format!("speaker_{i}_link"), "Link", guess.suggested_link)],
            );
        }
        Ok(form)
    }

    fn parse(&self, doc: &Document, form: &FormReadback) -> Result<Vec<SpeakerMapping>, Vec<String>> {
        let identified: Vec<SpeakerGuess> = doc.get_field(IDENTIFIED_KEY).unwrap_or_default();

        let mut errors = Vec::new();
        let mut mappings = Vec::with_capacity(identified.len());
        for (i, guess) in identified.into_iter().enumerate() {
            let link = form.field(&format!("speaker_{i}_link"));
            if let Some(error) = forms::validate_wikilink(link, &format!("Speaker {} Link", i + 1), true) {
                errors.push(error);
            }
            mappings.push(SpeakerMapping {
                label: guess.label,
                link: link.to_string(),
            });
        }

        if errors.is_empty() { Ok(mappings) } else { Err(errors) }
    }

    async fn finalize(&self, doc: &mut Document, accepted: Vec<SpeakerMapping>) -> Result<String, ProcessFailure> {
        let attendees = apply_mappings(doc, &accepted)?;
        doc.remove_field(IDENTIFIED_KEY);
        info!(
            doc = %doc.id(),
            speakers = accepted.len(),
            linked = attendees.len(),
            "Speakers identified"
        );
        Ok(build_summary(accepted.len(), &attendees))
    }

    fn review_details(&self, form: &Form) -> String {
        format!(
            "{} speakers to identify. Please review and check Finished in Obsidian.",
            form.sections.len()
        )
    }
}

/// Distinct `Speaker X` labels in order of first turn.
fn speaker_labels(text: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for caps in SPEAKER_LABEL.captures_iter(text) {
        let label = &caps[1];
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

/// People confirmed by entity resolution, as `(detected name, link)`.
fn known_people(doc: &Document) -> Vec<(String, String)> {
    doc.get_field::<Vec<ResolvedEntity>>("resolved_entities")
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.entity_type == EntityType::People && !e.resolved_link.is_empty())
        .map(|e| (e.detected_name, e.resolved_link))
        .collect()
}

fn as_wikilink(name: &str) -> String {
    let name = name.trim();
    if name.starts_with("[[") && name.ends_with("]]") {
        name.to_string()
    } else {
        format!("[[{name}]]")
    }
}

/// Rewrite the labels at the start of each turn and record the speakers.
/// Returns the attendee links.
fn apply_mappings(doc: &mut Document, mappings: &[SpeakerMapping]) -> Result<Vec<String>, ProcessFailure> {
    let mut body = doc.body().to_string();
    let mut attendees: Vec<String> = Vec::new();
    for mapping in mappings.iter().filter(|m| !m.link.is_empty()) {
        let pattern = Regex::new(&format!("(?m)^{}:", regex::escape(&mapping.label)))
            .map_err(|e| ProcessFailure::Permanent(format!("speaker label pattern: {e}")))?;
        let replacement = format!("{}:", mapping.link);
        body = pattern
            .replace_all(&body, regex::NoExpand(&replacement))
            .into_owned();
        if !attendees.contains(&mapping.link) {
            attendees.push(mapping.link.clone());
        }
    }
    doc.set_body(body);
    doc.set_field(SPEAKERS_KEY, &mappings)?;
    doc.set_field(ATTENDEES_KEY, &attendees)?;
    Ok(attendees)
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_speaker_system_prompt() -> String {
    "You identify the speakers of meeting transcripts from a personal knowledge base.\n\n\
     Each turn starts with a label like \"Speaker A:\". Use how speakers address each other, \
     introductions and what they say about themselves to tell who each label is.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"speakers\": [{\"label\": \"Speaker A\", \"name\": \"Full Name\", \"reason\": \"...\"}]}\n\n\
     Rules:\n\
     - List every label exactly as written in the transcript\n\
     - name is empty if the transcript gives no clue, never guess\n\
     - Prefer the names of the known people when one matches\n\
     - reason is one short sentence citing the clue"
        .to_string()
}

fn build_speaker_user_prompt(
    labels: &[String],
    people: &[(String, String)],
    owner: Option<&str>,
    transcript: &str,
) -> String {
    let mut prompt = format!("Labels: {}\n", labels.join(", "));
    if let Some(owner) = owner {
        prompt.push_str(&format!("The note owner, usually one of the speakers: {owner}\n"));
    }
    if people.is_empty() {
        prompt.push_str("Known people: none\n");
    } else {
        prompt.push_str("Known people:\n");
        for (name, link) in people {
            prompt.push_str(&format!("- {name} -> {link}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nTranscript:\n{}",
        excerpt(transcript.trim(), MAX_TRANSCRIPT_CHARS)
    ));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct SpeakerResponse {
    #[serde(default)]
    speakers: Vec<RawSpeaker>,
}

#[derive(Debug, Deserialize)]
struct RawSpeaker {
    #[serde(default)]
    label: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    reason: String,
}

/// One guess per transcript label. Labels the AI skipped get an empty link.
/// A name matching a known person takes that person's link.
fn match_guesses(labels: &[String], response: SpeakerResponse, people: &[(String, String)]) -> Vec<SpeakerGuess> {
    labels
        .iter()
        .map(|label| {
            let raw = response
                .speakers
                .iter()
                .find(|s| s.label.trim().eq_ignore_ascii_case(label));
            let name = raw.map(|s| s.name.trim()).unwrap_or("");
            let suggested_link = if name.is_empty() || name.eq_ignore_ascii_case("unknown") {
                String::new()
            } else {
                people
                    .iter()
                    .find(|(detected, link)| {
                        detected.eq_ignore_ascii_case(name) || link.eq_ignore_ascii_case(&as_wikilink(name))
                    })
                    .map(|(_, link)| link.clone())
                    .unwrap_or_else(|| as_wikilink(name))
            };
            SpeakerGuess {
                label: label.clone(),
                suggested_link,
                reason: raw.map(|s| s.reason.trim().to_string()).unwrap_or_default(),
            }
        })
        .collect()
}

// ── Output ──────────────────────────────────────────────────────────

fn build_summary(speakers: usize, attendees: &[String]) -> String {
    let mut summary = format!(
        "> [!success] Speakers identified ({} of {speakers} speakers linked)",
        attendees.len()
    );
    if !attendees.is_empty() {
        summary.push_str(&format!("\n\n**Attendees:** {}", attendees.join(", ")));
    }
    summary
}
