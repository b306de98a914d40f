//! Named entity resolution.
//!
//! The AI detects people, organisations and other named things in the text
//! and suggests a wikilink for each, seeded from the Entity Reference note.
//! The user confirms or corrects every mapping in a form; the accepted links
//! are then substituted into the body and new aliases are recorded.
//!
//! Confirmed mappings are left in the `resolved_entities` field for later
//! stages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ENTITIES_RESOLVED, excerpt};
use crate::document::{Category, Document};
use crate::forms::{self, Form, FormField, FormReadback};
use crate::linking::{EntityReferenceFile, EntityReferenceIndex, EntityType, Linker, ReferenceEntry};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, complete_json};
use crate::notify::Notifier;
use crate::processor::{ProcessFailure, ProcessOutcome, Processor, ProcessorSpec};
use crate::review::{ReviewWorkflow, run_review};

const DETECTED_KEY: &str = "detected_entities";
const RESOLVED_KEY: &str = "resolved_entities";
const OPT_OUT_TAG: &str = "noentity";
const EMAIL_DIGEST_CREATED: &str = "email_digest_created";
const MAX_TEXT_CHARS: usize = 30000;

/// One AI detection, as proposed in the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedEntity {
    pub detected_name: String,
    pub suggested_link: String,
    pub entity_type: EntityType,
}

/// A mapping confirmed by the user. `resolved_link` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub detected_name: String,
    #[serde(default)]
    pub resolved_link: String,
    pub entity_type: EntityType,
}

/// What is kept in the frontmatter between proposal and submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredDetection {
    detected_name: String,
    entity_type: EntityType,
}

pub struct EntityResolver {
    spec: ProcessorSpec,
    display_name: String,
    llm: Arc<dyn LlmProvider>,
    notifier: Arc<dyn Notifier>,
    reference: EntityReferenceFile,
}

impl EntityResolver {
    /// Resolver for meeting transcripts.
    pub fn meetings(
        input_dir: impl Into<PathBuf>,
        reference: EntityReferenceFile,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_spec(Self::default_spec(input_dir), "Entity Resolution", reference, llm, notifier)
    }

    /// Resolver for daily email digests.
    pub fn emails(
        input_dir: impl Into<PathBuf>,
        reference: EntityReferenceFile,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_spec(
            Self::email_spec(input_dir),
            "Email Entity Resolution",
            reference,
            llm,
            notifier,
        )
    }

    pub fn with_spec(
        spec: ProcessorSpec,
        display_name: impl Into<String>,
        reference: EntityReferenceFile,
        llm: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            spec,
            display_name: display_name.into(),
            llm,
            notifier,
            reference,
        }
    }

    pub fn default_spec(input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new("entity_resolver", ENTITIES_RESOLVED, input_dir)
            .flag_namespace("entity_resolution")
            .categories([Category::Meeting])
    }

    pub fn email_spec(input_dir: impl Into<PathBuf>) -> ProcessorSpec {
        ProcessorSpec::new("entity_resolver_emails", ENTITIES_RESOLVED, input_dir)
            .requires(EMAIL_DIGEST_CREATED)
            .flag_namespace("email_entity_resolution")
            .categories([Category::Email])
    }
}

#[async_trait]
impl Processor for EntityResolver {
    fn spec(&self) -> &ProcessorSpec {
        &self.spec
    }

    fn accepts_extra(&self, doc: &Document) -> bool {
        !doc.source_tags().iter().any(|t| t == OPT_OUT_TAG)
    }

    async fn process(&self, doc: &mut Document) -> ProcessOutcome {
        run_review(self, doc, self.notifier.as_ref()).await
    }
}

#[async_trait]
impl ReviewWorkflow for EntityResolver {
    type Proposal = Vec<DetectedEntity>;
    type Accepted = Vec<ResolvedEntity>;

    fn namespace(&self) -> &str {
        self.spec.namespace()
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn propose(&self, doc: &Document) -> Result<Option<Vec<DetectedEntity>>, ProcessFailure> {
        let index = self.reference.load().await?;
        let body = forms::remove_form(doc.body(), self.namespace());
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_detect_system_prompt()),
            ChatMessage::user(build_detect_user_prompt(&index, &body)),
        ])
        .with_temperature(0.1);

        let response: DetectionResponse = complete_json(self.llm.as_ref(), request).await?;
        let entities = resolve_detections(response, &index);
        debug!(doc = %doc.id(), detected = entities.len(), known = index.len(), "Entities detected");
        Ok((!entities.is_empty()).then_some(entities))
    }

    fn render(&self, doc: &mut Document, proposal: Vec<DetectedEntity>) -> Result<Form, ProcessFailure> {
        let stored: Vec<StoredDetection> = proposal
            .iter()
            .map(|e| StoredDetection {
                detected_name: e.detected_name.clone(),
                entity_type: e.entity_type,
            })
            .collect();
        doc.set_field(DETECTED_KEY, &stored)?;

        let mut form = Form::new(
            self.namespace(),
            "Entity Resolution - Review and confirm entity mappings",
        );
        for (i, entity) in proposal.into_iter().enumerate() {
            form = form.section(
                Some(entity.detected_name),
                vec![
                    FormField::new(format!("entity_{i}_link"), "Link", entity.suggested_link),
                    FormField::new(format!("entity_{i}_type"), "Type", entity.entity_type.as_str()),
                ],
            );
        }
        Ok(form)
    }

    fn parse(&self, doc: &Document, form: &FormReadback) -> Result<Vec<ResolvedEntity>, Vec<String>> {
        let detected: Vec<StoredDetection> = doc.get_field(DETECTED_KEY).unwrap_or_default();
        let choices: Vec<&str> = EntityType::ALL.iter().map(EntityType::as_str).collect();

        let mut errors = Vec::new();
        let mut resolved = Vec::with_capacity(detected.len());
        for (i, detection) in detected.into_iter().enumerate() {
            let link = form.field(&format!("entity_{i}_link"));
            let raw_type = match form.field(&format!("entity_{i}_type")) {
                "" => EntityType::Other.as_str(),
                value => value,
            };

            let type_error = forms::validate_choice(raw_type, &choices, &format!("Entity {} Type", i + 1), false);
            let link_error = forms::validate_wikilink(link, &format!("Entity {} Link", i + 1), true);
            errors.extend(type_error.into_iter().chain(link_error));

            resolved.push(ResolvedEntity {
                detected_name: detection.detected_name,
                resolved_link: link.to_string(),
                entity_type: raw_type.parse().unwrap_or(detection.entity_type),
            });
        }

        if errors.is_empty() { Ok(resolved) } else { Err(errors) }
    }

    async fn finalize(&self, doc: &mut Document, accepted: Vec<ResolvedEntity>) -> Result<String, ProcessFailure> {
        let terms: Vec<&str> = accepted.iter().map(|e| e.detected_name.as_str()).collect();
        let replacements: HashMap<String, String> = accepted
            .iter()
            .filter(|e| !e.resolved_link.is_empty())
            .map(|e| (e.detected_name.clone(), e.resolved_link.clone()))
            .collect();

        let (body, replaced) = Linker::new(&terms, &replacements).apply(doc.body());
        doc.set_body(body);

        doc.set_field(RESOLVED_KEY, &accepted)?;
        doc.remove_field(DETECTED_KEY);

        let entries: Vec<ReferenceEntry> = accepted
            .iter()
            .filter(|e| !e.resolved_link.is_empty())
            .map(|e| ReferenceEntry {
                name: e.detected_name.clone(),
                link: e.resolved_link.clone(),
                entity_type: e.entity_type,
            })
            .collect();
        let recorded = self.reference.record(&entries).await?;

        info!(
            doc = %doc.id(),
            entities = accepted.len(),
            replaced,
            recorded,
            "Entities resolved"
        );
        Ok(build_summary(&accepted))
    }

    fn review_details(&self, form: &Form) -> String {
        format!(
            "{} entities detected. Please review and check Finished in Obsidian.",
            form.sections.len()
        )
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_detect_system_prompt() -> String {
    "You detect named entities in transcripts and emails from a personal knowledge base.\n\n\
     Entity types:\n\
     - \"people\": individual persons, including first names and nicknames\n\
     - \"org\": companies, associations, institutions, teams\n\
     - \"other\": projects, products, places, events worth linking\n\n\
     Respond with ONLY a JSON object:\n\
     {\"entities\": [{\"detected_name\": \"...\", \"entity_type\": \"people\", \"suggested_link\": \"[[...]]\"}]}\n\n\
     Rules:\n\
     - detected_name must be the exact text as it appears in the transcript\n\
     - List each detected name once\n\
     - Reuse the link from the known references when the name matches one\n\
     - suggested_link is a wikilink like [[Full Name]], or empty if unsure\n\
     - Do not list generic words, pronouns or dates"
        .to_string()
}

fn build_detect_user_prompt(index: &EntityReferenceIndex, text: &str) -> String {
    let references = if index.is_empty() {
        "No existing references.\n".to_string()
    } else {
        index.summary()
    };
    format!(
        "Known references:\n{references}\nTranscript:\n{}",
        excerpt(text.trim(), MAX_TEXT_CHARS)
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct DetectionResponse {
    #[serde(default)]
    entities: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default)]
    detected_name: String,
    #[serde(default)]
    suggested_link: String,
    #[serde(default)]
    entity_type: String,
}

/// Drop blank and repeated names. A known alias overrides the AI's link.
fn resolve_detections(response: DetectionResponse, index: &EntityReferenceIndex) -> Vec<DetectedEntity> {
    let mut entities: Vec<DetectedEntity> = Vec::new();
    for raw in response.entities {
        let name = raw.detected_name.trim();
        if name.is_empty() || entities.iter().any(|e| e.detected_name == name) {
            continue;
        }
        let mut entity = DetectedEntity {
            detected_name: name.to_string(),
            suggested_link: raw.suggested_link.trim().to_string(),
            entity_type: raw.entity_type.parse().unwrap_or(EntityType::Other),
        };
        if let Some((entity_type, link)) = index.lookup(name) {
            entity.entity_type = entity_type;
            entity.suggested_link = link.to_string();
        }
        entities.push(entity);
    }
    entities
}

// ── Output ──────────────────────────────────────────────────────────

fn build_summary(resolved: &[ResolvedEntity]) -> String {
    let linked: Vec<&ResolvedEntity> = resolved.iter().filter(|e| !e.resolved_link.is_empty()).collect();
    let mut lines = vec![format!(
        "> [!success] Entity resolution complete ({} entities resolved)",
        linked.len()
    )];
    for entity_type in EntityType::ALL {
        let links: Vec<&str> = linked
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.resolved_link.as_str())
            .collect();
        if !links.is_empty() {
            lines.push(String::new());
            lines.push(format!("**{}:** {}", capitalize(entity_type.as_str()), links.join(", ")));
        }
    }
    lines.join("\n")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentId;
    use crate::notify::LogNotifier;
    use crate::processors::testing::ScriptedLlm;
    use tempfile::TempDir;

    const MEETING: &str = "---\ncategory: meeting\nprocessing_stages: [transcribed, classified]\n---\nMaxime, have you talked to Pause IA? [[Irina]] was there.\n";

    fn resolver(dir: &TempDir, llm: Arc<ScriptedLlm>) -> EntityResolver {
        EntityResolver::meetings(
            dir.path(),
            EntityReferenceFile::new(dir.path().join("Entity Reference.md")),
            llm,
            Arc::new(LogNotifier),
        )
    }

    fn meeting(content: &str) -> Document {
        Document::parse(DocumentId::new("/vault/2025-12-20 Standup.md"), content).unwrap()
    }

    fn tick_finished(doc: &mut Document) {
        let body = doc.body().replace("- [ ] Finished", "- [x] Finished");
        doc.set_body(body);
    }

    fn set_input(doc: &mut Document, name: &str, value: &str) {
        let marker = format!("<!-- input:{name} -->");
        let body: Vec<String> = doc
            .body()
            .lines()
            .map(|line| match line.find(&marker) {
                Some(at) => format!("{}{marker}{value}", &line[..at]),
                None => line.to_string(),
            })
            .collect();
        doc.set_body(body.join("\n") + "\n");
    }

    #[test]
    fn detections_are_deduplicated_and_seeded_from_index() {
        let mut index = EntityReferenceIndex::default();
        index.insert(EntityType::Org, "Pause IA", "[[Pause IA]]");
        let response: DetectionResponse = serde_json::from_str(
            r#"{"entities": [
                {"detected_name": "Maxime", "entity_type": "person", "suggested_link": "[[Maxime]]"},
                {"detected_name": "Maxime", "entity_type": "people"},
                {"detected_name": "pause ia", "entity_type": "other"},
                {"detected_name": "  "}
            ]}"#,
        )
        .unwrap();

        let entities = resolve_detections(response, &index);
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, EntityType::People);
        assert_eq!(entities[0].suggested_link, "[[Maxime]]");
        assert_eq!(entities[1].entity_type, EntityType::Org);
        assert_eq!(entities[1].suggested_link, "[[Pause IA]]");
    }

    #[test]
    fn summary_groups_links_by_type() {
        let summary = build_summary(&[
            ResolvedEntity {
                detected_name: "Maxime".into(),
                resolved_link: "[[Maxime Dupont]]".into(),
                entity_type: EntityType::People,
            },
            ResolvedEntity {
                detected_name: "Pause IA".into(),
                resolved_link: "[[Pause IA]]".into(),
                entity_type: EntityType::Org,
            },
            ResolvedEntity {
                detected_name: "Thing".into(),
                resolved_link: String::new(),
                entity_type: EntityType::Other,
            },
        ]);
        assert_eq!(
            summary,
            "> [!success] Entity resolution complete (2 entities resolved)\n\n\
             **People:** [[Maxime Dupont]]\n\n**Org:** [[Pause IA]]"
        );
    }

    #[test]
    fn noentity_source_tag_opts_out() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, Arc::new(ScriptedLlm::new(Vec::<String>::new())));
        assert!(resolver.accepts(&meeting(MEETING)));
        let opted_out = meeting(
            "---\ncategory: meeting\nsource_tags: [noentity]\n---\nMaxime\n",
        );
        assert!(!resolver.accepts(&opted_out));
    }

    #[test]
    fn email_variant_spec() {
        let spec = EntityResolver::email_spec("/digests");
        assert_eq!(spec.key, "entity_resolver_emails");
        assert_eq!(spec.stage, "entities_resolved");
        assert_eq!(spec.required_stage.as_deref(), Some("email_digest_created"));
        assert_eq!(spec.namespace(), "email_entity_resolution");
        assert_eq!(spec.categories, vec![Category::Email]);
    }

    #[tokio::test]
    async fn nothing_detected_completes() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, Arc::new(ScriptedLlm::new([r#"{"entities": []}"#])));
        let mut doc = meeting(MEETING);
        assert_eq!(resolver.process(&mut doc).await, ProcessOutcome::Completed);
    }

    #[tokio::test]
    async fn full_resolution_cycle() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new([r#"```json
{"entities": [
  {"detected_name": "Maxime", "entity_type": "people", "suggested_link": "[[Maxime Dupont]]"},
  {"detected_name": "Pause IA", "entity_type": "org", "suggested_link": ""},
  {"detected_name": "Irina", "entity_type": "people", "suggested_link": "[[Irina Tavera]]"}
]}
```"#]));
        let resolver = resolver(&dir, llm.clone());
        let mut doc = meeting(MEETING);

        let outcome = resolver.process(&mut doc).await;
        assert!(matches!(outcome, ProcessOutcome::NotReady { .. }));
        assert!(doc.get_flag("entity_resolution", "pending", false));
        assert!(doc.body().contains("## Maxime\n**Link:** <!-- input:entity_0_link -->[[Maxime Dupont]]"));
        assert!(doc.body().contains("**Type:** <!-- input:entity_1_type -->org"));
        assert!(llm.prompt(0).contains("No existing references."));

        // Awaiting the checkbox: no further AI call.
        let outcome = resolver.process(&mut doc).await;
        assert!(matches!(outcome, ProcessOutcome::NotReady { .. }));
        assert_eq!(llm.calls(), 1);

        set_input(&mut doc, "entity_1_link", "[[Pause IA]]");
        tick_finished(&mut doc);
        let outcome = resolver.process(&mut doc).await;
        assert_eq!(outcome, ProcessOutcome::Completed);

        let body = doc.body();
        assert!(body.contains("[[Maxime Dupont]], have you talked to [[Pause IA]]? [[Irina]] was there."));
        assert!(body.contains("> [!success] Entity resolution complete (3 entities resolved)"));
        assert!(!forms::has_form(body, "entity_resolution"));
        assert!(!doc.get_flag("entity_resolution", "pending", false));
        assert!(doc.get_field::<Vec<StoredDetection>>(DETECTED_KEY).is_none());

        let resolved: Vec<ResolvedEntity> = doc.get_field(RESOLVED_KEY).unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[1].resolved_link, "[[Pause IA]]");

        let index = resolver.reference.load().await.unwrap();
        assert_eq!(index.lookup("maxime"), Some((EntityType::People, "[[Maxime Dupont]]")));
        assert_eq!(index.lookup("Pause IA"), Some((EntityType::Org, "[[Pause IA]]")));
    }

    #[tokio::test]
    async fn invalid_mappings_are_reported() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(ScriptedLlm::new([
            r#"{"entities": [{"detected_name": "Maxime", "entity_type": "people", "suggested_link": "[[Maxime Dupont]]"}]}"#,
        ]));
        let resolver = resolver(&dir, llm);
        let mut doc = meeting(MEETING);
        resolver.process(&mut doc).await;

        set_input(&mut doc, "entity_0_link", "Maxime Dupont");
        set_input(&mut doc, "entity_0_type", "animal");
        tick_finished(&mut doc);
        let outcome = resolver.process(&mut doc).await;

        let ProcessOutcome::Failed(ProcessFailure::Validation(errors)) = outcome else {
            panic!("expected validation failure, got {outcome:?}");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Entity 1 Type must be one of"));
        assert!(errors[1].starts_with("Entity 1 Link must be a wikilink"));
        assert!(doc.body().contains("> [!error]"));
        assert!(doc.body().contains("- [ ] Finished"));
        assert!(doc.body().starts_with("<!-- form:entity_resolution:start -->"));
        assert!(doc.body().contains("Maxime, have you talked"));
    }
}
