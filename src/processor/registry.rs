//! Processor registry, validated before the scheduler starts.

use std::sync::Arc;

use tracing::info;

use super::Processor;
use crate::error::RegistryError;

/// Registered processors in registration order.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor. Keys and flag namespaces must be unique and its
    /// [`ProcessorSpec`](super::ProcessorSpec) self-consistent.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<(), RegistryError> {
        let spec = processor.spec();
        let invalid = |reason: &str| RegistryError::Invalid {
            key: spec.key.clone(),
            reason: reason.to_string(),
        };

        if spec.key.trim().is_empty() {
            return Err(invalid("registration key is empty"));
        }
        if spec.stage.trim().is_empty() {
            return Err(invalid("stage name is empty"));
        }
        if spec.required_stage.as_deref() == Some(spec.stage.as_str()) {
            return Err(invalid("required stage is the processor's own stage"));
        }
        if let Some(existing) = self.get(&spec.key) {
            return Err(RegistryError::Conflict {
                key: spec.key.clone(),
                existing_stage: existing.spec().stage.clone(),
            });
        }
        // Shared namespaces would share the pending flag and the form markers
        if let Some(existing) = self
            .processors
            .iter()
            .find(|p| p.spec().namespace() == spec.namespace())
        {
            return Err(invalid(&format!(
                "flag namespace '{}' is already used by '{}'",
                spec.namespace(),
                existing.spec().key
            )));
        }

        info!(
            processor = %spec.key,
            stage = %spec.stage,
            requires = spec.required_stage.as_deref().unwrap_or("-"),
            input = %spec.input_dir.display(),
            "Registered processor"
        );
        self.processors.push(processor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.iter().find(|p| p.spec().key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.processors.iter()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.spec().key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
