//! Processor registry keyed by job kind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RunError;
use crate::processor::TaskRunProcessor;
use crate::task::JobKind;

/// Registry of job logic, one processor per job kind.
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<JobKind, Arc<dyn TaskRunProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a processor, replacing any previous one for `kind`.
    pub async fn register(&self, kind: JobKind, processor: Arc<dyn TaskRunProcessor>) {
        let name = processor.name().to_string();
        if self
            .processors
            .write()
            .await
            .insert(kind, processor)
            .is_some()
        {
            tracing::warn!(kind = %kind, processor = %name, "Replaced registered processor");
        } else {
            tracing::debug!(kind = %kind, processor = %name, "Registered processor");
        }
    }

    /// Register a processor (sync version for startup).
    pub fn register_sync(&self, kind: JobKind, processor: Arc<dyn TaskRunProcessor>) {
        if let Ok(mut processors) = self.processors.try_write() {
            tracing::debug!(kind = %kind, processor = %processor.name(), "Registered processor");
            processors.insert(kind, processor);
        }
    }

    pub async fn get(&self, kind: JobKind) -> Result<Arc<dyn TaskRunProcessor>, RunError> {
        self.processors
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| RunError::ProcessorNotFound {
                kind: kind.to_string(),
            })
    }

    pub async fn has(&self, kind: JobKind) -> bool {
        self.processors.read().await.contains_key(&kind)
    }

    pub fn count(&self) -> usize {
        self.processors.try_read().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
