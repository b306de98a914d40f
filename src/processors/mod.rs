//! Concrete pipeline steps.
//!
//! ```text
//! transcribed ─▶ classifier ─▶ classified ─┬─▶ idea_extractor ─▶ ideas_extracted
//!                                          ├─▶ todo_extractor ─▶ todos_extracted
//!                                          └─ (meeting) ─▶ entity_resolver ─▶ entities_resolved
//!                                                ─▶ speaker_identifier ─▶ speakers_identified
//!                                                ─▶ meeting_summary ─▶ meeting_summarized
//! email_digest_created ─▶ entity_resolver_emails ─▶ entities_resolved
//! ```

pub mod classifier;
pub mod entity_resolver;
pub mod extractor;
pub mod meeting_summary;
pub mod speaker_identifier;

pub use classifier::Classifier;
pub use entity_resolver::{DetectedEntity, EntityResolver, ResolvedEntity};
pub use extractor::{ExtractionKind, SectionExtractor};
pub use meeting_summary::{IndexEntry, MeetingSummarizer, MonthlyIndex};
pub use speaker_identifier::{SpeakerGuess, SpeakerIdentifier, SpeakerMapping};

use std::sync::Arc;

use crate::config::VaultPaths;
use crate::document::DocumentLocks;
use crate::error::RegistryError;
use crate::linking::EntityReferenceFile;
use crate::llm::LlmModels;
use crate::notify::Notifier;
use crate::processor::ProcessorRegistry;

/// Stage recorded by the classifier, required by the extractors.
pub const CLASSIFIED: &str = "classified";

/// Stage recorded by the entity resolvers.
pub const ENTITIES_RESOLVED: &str = "entities_resolved";

/// Stage recorded by the speaker identifier, required by the meeting summary.
pub const SPEAKERS_IDENTIFIED: &str = "speakers_identified";

/// Register the standard pipeline for a vault.
///
/// `owner` is the vault owner's name, used for single-speaker transcripts.
pub fn build_registry(
    paths: &VaultPaths,
    models: &LlmModels,
    notifier: Arc<dyn Notifier>,
    owner: Option<&str>,
) -> Result<ProcessorRegistry, RegistryError> {
    // Notes rewritten by more than one document: reference, directories, indexes
    let side_files = Arc::new(DocumentLocks::new());
    let reference = EntityReferenceFile::new(paths.entity_reference()).with_locks(side_files.clone());
    let mut registry = ProcessorRegistry::new();

    registry.register(Arc::new(Classifier::new(&paths.transcripts, models.small.clone())))?;
    registry.register(Arc::new(
        SectionExtractor::new(ExtractionKind::Ideas, &paths.transcripts, models.main.clone())
            .with_directory(&paths.ideas_directory)
            .with_locks(side_files.clone()),
    ))?;
    registry.register(Arc::new(
        SectionExtractor::new(ExtractionKind::Todos, &paths.transcripts, models.main.clone())
            .with_directory(&paths.todos_directory)
            .with_locks(side_files.clone()),
    ))?;
    registry.register(Arc::new(EntityResolver::meetings(
        &paths.transcripts,
        reference.clone(),
        models.main.clone(),
        notifier.clone(),
    )))?;
    registry.register(Arc::new(EntityResolver::emails(
        &paths.email_digests,
        reference,
        models.main.clone(),
        notifier.clone(),
    )))?;
    let mut speakers = SpeakerIdentifier::new(&paths.transcripts, models.main.clone(), notifier.clone());
    if let Some(owner) = owner {
        speakers = speakers.with_owner(owner);
    }
    registry.register(Arc::new(speakers))?;
    registry.register(Arc::new(
        MeetingSummarizer::new(
            &paths.transcripts,
            &paths.meeting_indexes,
            models.main.clone(),
            notifier,
        )
        .with_locks(side_files),
    ))?;

    Ok(registry)
}

/// Leading part of `text`, cut on a char boundary, for prompts.
fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}\n[...]", &text[..end]),
        None => text.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_cuts_on_char_boundary() {
        assert_eq!(excerpt("héllo", 10), "héllo");
        assert_eq!(excerpt("héllo", 2), "hé\n[...]");
    }
}
