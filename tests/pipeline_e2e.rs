//! End-to-end pipeline runs over a temporary vault.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use noteflow::config::{SchedulerConfig, VaultPaths};
use noteflow::document::{Category, Document, DocumentStore};
use noteflow::error::LlmError;
use noteflow::linking::{EntityReferenceFile, EntityType};
use noteflow::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmModels, LlmProvider, Role};
use noteflow::notify::LogNotifier;
use noteflow::processor::ProcessorRegistry;
use noteflow::forms;
use noteflow::processors::{
    EntityResolver, ExtractionKind, MeetingSummarizer, MonthlyIndex, SectionExtractor, SpeakerIdentifier,
    build_registry,
};
use noteflow::scheduler::Scheduler;

/// Answers according to which processor is asking.
struct RoutingLlm {
    system_prompts: Mutex<Vec<String>>,
}

impl RoutingLlm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            system_prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmProvider for RoutingLlm {
    fn model_name(&self) -> &str {
        "routing"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.system_prompts.lock().unwrap().push(system.clone());

        let content = if system.contains("classify") {
            "idea".to_string()
        } else if system.contains("Extract every distinct idea") {
            r#"{"items": ["Sync notes while offline"]}"#.to_string()
        } else if system.contains("Extract every actionable task") {
            r#"{"items": []}"#.to_string()
        } else if system.contains("identify the speakers") {
            r#"{"speakers": [{"label": "Speaker A", "name": "Camille Martin", "reason": "Chairs the call"}, {"label": "Speaker B", "name": "Maxime", "reason": "Called Maxime"}]}"#
                .to_string()
        } else if system.contains("named entities") {
            r#"{"entities": [{"detected_name": "Maxime", "entity_type": "people", "suggested_link": "[[Maxime Dupont]]"}]}"#
                .to_string()
        } else {
            "Summary.".to_string()
        };

        Ok(CompletionResponse {
            content,
            input_tokens: 50,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_jitter: std::time::Duration::ZERO,
        ..SchedulerConfig::default()
    }
}

async fn vault() -> (TempDir, VaultPaths) {
    let dir = TempDir::new().unwrap();
    let paths = VaultPaths::under(dir.path());
    for d in paths.directories() {
        tokio::fs::create_dir_all(&d).await.unwrap();
    }
    (dir, paths)
}

async fn read(path: &Path) -> Document {
    Document::load(path).await.unwrap()
}

#[tokio::test]
async fn idea_extraction_after_one_tick() {
    let (_dir, paths) = vault().await;
    let note = paths.transcripts.join("2025-12-20 Voice.md");
    tokio::fs::write(
        &note,
        "---\ndate: 2025-12-20\ncategory: idea\nprocessing_stages:\n- transcribed\n- classified\n---\nWhat if notes synced while offline?\n",
    )
    .await
    .unwrap();

    let mut registry = ProcessorRegistry::new();
    registry
        .register(Arc::new(
            SectionExtractor::new(ExtractionKind::Ideas, &paths.transcripts, RoutingLlm::new())
                .with_directory(&paths.ideas_directory),
        ))
        .unwrap();
    let scheduler = Scheduler::new(registry, Arc::new(DocumentStore::new()), test_config());

    let report = scheduler.run_tick().await;
    assert_eq!(report.get("idea_extractor").unwrap().completed, 1);

    let doc = read(&note).await;
    assert_eq!(doc.stages(), vec!["transcribed", "classified", "ideas_extracted"]);
    assert!(doc.body().contains("\n## Ideas\n\n- Sync notes while offline\n"));
    let directory = tokio::fs::read_to_string(&paths.ideas_directory).await.unwrap();
    assert!(directory.contains("## Ideas from [[2025-12-20 Voice]] - 2025-12-20"));

    // Already past the stage: not a candidate any more.
    let report = scheduler.run_tick().await;
    assert_eq!(report.get("idea_extractor").unwrap().candidates, 0);
    assert_eq!(read(&note).await.stages().len(), 3);
}

#[tokio::test]
async fn entity_resolution_waits_for_review() {
    let (_dir, paths) = vault().await;
    let note = paths.transcripts.join("2025-12-20 Standup.md");
    tokio::fs::write(
        &note,
        "---\ncategory: meeting\nprocessing_stages: [transcribed, classified]\n---\nMaxime, have you sent the deck?\n",
    )
    .await
    .unwrap();

    let llm = RoutingLlm::new();
    let reference = EntityReferenceFile::new(paths.entity_reference());
    let mut registry = ProcessorRegistry::new();
    registry
        .register(Arc::new(EntityResolver::meetings(
            &paths.transcripts,
            reference.clone(),
            llm.clone(),
            Arc::new(LogNotifier),
        )))
        .unwrap();
    let scheduler = Scheduler::new(registry, Arc::new(DocumentStore::new()), test_config());

    let report = scheduler.run_tick().await;
    assert_eq!(report.get("entity_resolver").unwrap().not_ready, 1);
    let doc = read(&note).await;
    assert!(doc.get_flag("entity_resolution", "pending", false));
    assert!(!doc.has_stage("entities_resolved"));

    // Nobody ticked Finished: repeated ticks change nothing.
    let before = tokio::fs::read_to_string(&note).await.unwrap();
    for _ in 0..3 {
        scheduler.run_tick().await;
    }
    assert_eq!(tokio::fs::read_to_string(&note).await.unwrap(), before);
    assert_eq!(llm.system_prompts.lock().unwrap().len(), 1);

    tokio::fs::write(&note, before.replace("- [ ] Finished", "- [x] Finished"))
        .await
        .unwrap();
    let report = scheduler.run_tick().await;
    assert_eq!(report.get("entity_resolver").unwrap().completed, 1);

    let doc = read(&note).await;
    assert!(doc.has_stage("entities_resolved"));
    assert!(!doc.get_flag("entity_resolution", "pending", false));
    assert!(doc.body().contains("[[Maxime Dupont]], have you sent the deck?"));
    assert!(doc.body().contains("> [!success] Entity resolution complete (1 entities resolved)"));

    let index = reference.load().await.unwrap();
    assert_eq!(index.lookup("Maxime"), Some((EntityType::People, "[[Maxime Dupont]]")));
}

#[tokio::test]
async fn standard_pipeline_classifies_then_extracts() {
    let (_dir, paths) = vault().await;
    let note = paths.transcripts.join("2025-12-21 Voice.md");
    tokio::fs::write(
        &note,
        "---\ndate: 2025-12-21\ntags:\n- transcription\nprocessing_stages:\n- transcribed\n---\nWhat if notes synced while offline?\n",
    )
    .await
    .unwrap();

    let llm = RoutingLlm::new();
    let models = LlmModels {
        main: llm.clone(),
        small: llm,
    };
    let registry = build_registry(&paths, &models, Arc::new(LogNotifier), Some("Camille Martin")).unwrap();
    assert_eq!(registry.len(), 7);
    let scheduler = Scheduler::new(registry, Arc::new(DocumentStore::new()), test_config());

    scheduler.run_tick().await;
    let doc = read(&note).await;
    assert_eq!(doc.category(), Some(Category::Idea));
    assert!(doc.has_tag("idea"));
    assert!(doc.has_stage("classified"));

    scheduler.run_tick().await;
    let doc = read(&note).await;
    assert!(doc.has_stage("ideas_extracted"));
    assert!(!doc.has_stage("todos_extracted"));
    assert!(doc.body().contains("## Ideas"));
    assert!(tokio::fs::try_exists(&paths.ideas_directory).await.unwrap());
}

#[tokio::test]
async fn rejected_review_is_persisted_until_fixed() {
    let (_dir, paths) = vault().await;
    let note = paths.transcripts.join("2025-12-20 Standup.md");
    tokio::fs::write(
        &note,
        "---\ncategory: meeting\nprocessing_stages: [transcribed, classified]\n---\nMaxime, have you sent the deck?\n",
    )
    .await
    .unwrap();

    let mut registry = ProcessorRegistry::new();
    registry
        .register(Arc::new(EntityResolver::meetings(
            &paths.transcripts,
            EntityReferenceFile::new(paths.entity_reference()),
            RoutingLlm::new(),
            Arc::new(LogNotifier),
        )))
        .unwrap();
    let scheduler = Scheduler::new(registry, Arc::new(DocumentStore::new()), test_config());
    scheduler.run_tick().await;

    // Link typed without brackets, then Finished ticked.
    let form = tokio::fs::read_to_string(&note).await.unwrap();
    let edited = form
        .replace(
            "<!-- input:entity_0_link -->[[Maxime Dupont]]",
            "<!-- input:entity_0_link -->Maxime Dupont",
        )
        .replace("- [ ] Finished", "- [x] Finished");
    tokio::fs::write(&note, &edited).await.unwrap();

    let report = scheduler.run_tick().await;
    assert_eq!(report.get("entity_resolver").unwrap().failed, 1);

    let doc = read(&note).await;
    assert!(doc.body().contains("> [!error] Validation errors"));
    assert!(doc.body().contains("> - Entity 1 Link must be a wikilink"));
    let readback = forms::read_form(doc.body(), "entity_resolution").unwrap();
    assert!(!readback.finished);
    assert_eq!(readback.field("entity_0_link"), "Maxime Dupont");
    assert!(doc.get_flag("entity_resolution", "pending", false));
    assert!(!doc.has_stage("entities_resolved"));

    // Unchecked again: the next tick waits instead of failing twice.
    let report = scheduler.run_tick().await;
    assert_eq!(report.get("entity_resolver").unwrap().not_ready, 1);

    let fixed = tokio::fs::read_to_string(&note)
        .await
        .unwrap()
        .replace(
            "<!-- input:entity_0_link -->Maxime Dupont",
            "<!-- input:entity_0_link -->[[Maxime Dupont]]",
        )
        .replace("- [ ] Finished", "- [x] Finished");
    tokio::fs::write(&note, fixed).await.unwrap();
    let report = scheduler.run_tick().await;
    assert_eq!(report.get("entity_resolver").unwrap().completed, 1);
    let doc = read(&note).await;
    assert!(doc.has_stage("entities_resolved"));
    assert!(!doc.body().contains("[!error]"));
}

/// Ticks until `namespace` has a pending form, at most `max` times.
async fn tick_until_form(scheduler: &Scheduler, note: &Path, namespace: &str, max: usize) -> Document {
    for _ in 0..max {
        scheduler.run_tick().await;
        let doc = read(note).await;
        if forms::has_form(doc.body(), namespace) {
            return doc;
        }
    }
    panic!("no {namespace} form after {max} ticks");
}

#[tokio::test]
async fn speakers_feed_the_meeting_index() {
    let (_dir, paths) = vault().await;
    let note = paths.transcripts.join("2025-12-20 Standup.md");
    tokio::fs::write(
        &note,
        "---\ndate: 2025-12-20\ncategory: meeting\nprocessing_stages: [transcribed, classified, entities_resolved]\n\
         resolved_entities:\n  - detected_name: Maxime\n    resolved_link: '[[Maxime Dupont]]'\n    entity_type: people\n---\n\
         Speaker A: [[Maxime Dupont]], have you sent the deck?\nSpeaker B: Yes, this morning.\n",
    )
    .await
    .unwrap();

    let llm = RoutingLlm::new();
    let mut registry = ProcessorRegistry::new();
    registry
        .register(Arc::new(SpeakerIdentifier::new(
            &paths.transcripts,
            llm.clone(),
            Arc::new(LogNotifier),
        )))
        .unwrap();
    registry
        .register(Arc::new(MeetingSummarizer::new(
            &paths.transcripts,
            &paths.meeting_indexes,
            llm,
            Arc::new(LogNotifier),
        )))
        .unwrap();
    let scheduler = Scheduler::new(registry, Arc::new(DocumentStore::new()), test_config());

    let doc = tick_until_form(&scheduler, &note, "speaker_identification", 1).await;
    assert!(doc.body().contains("<!-- input:speaker_1_link -->[[Maxime Dupont]]"));
    assert!(!doc.has_stage("speakers_identified"));

    let checked = tokio::fs::read_to_string(&note)
        .await
        .unwrap()
        .replace("- [ ] Finished", "- [x] Finished");
    tokio::fs::write(&note, checked).await.unwrap();

    let doc = tick_until_form(&scheduler, &note, "meeting_summary", 3).await;
    assert!(doc.has_stage("speakers_identified"));
    assert!(doc.body().contains("[[Camille Martin]]: [[Maxime Dupont]], have you sent the deck?\n"));
    assert!(doc.body().contains("[[Maxime Dupont]]: Yes, this morning.\n"));

    let checked = tokio::fs::read_to_string(&note)
        .await
        .unwrap()
        .replace("- [ ] Finished", "- [x] Finished");
    tokio::fs::write(&note, checked).await.unwrap();
    let report = scheduler.run_tick().await;
    assert_eq!(report.get("meeting_summary").unwrap().completed, 1);

    let index = MonthlyIndex::load(&paths.meeting_indexes.join("2025-12 Meetings.md"))
        .await
        .unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(
        index.entries()[0].attendees,
        vec!["[[Camille Martin]]", "[[Maxime Dupont]]"]
    );
    assert_eq!(read(&note).await.stages().last().map(String::as_str), Some("meeting_summarized"));
}
