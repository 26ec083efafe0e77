use super::{ExportError, OutputProcessor, ProcessOutcome};
use crate::buffer::Batch;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of output processors keyed by name.
#[derive(Default)]
pub struct OutputManager {
    processors: parking_lot::RwLock<BTreeMap<String, Arc<dyn OutputProcessor>>>,
}

impl OutputManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor`, initializing it first when it is not ready yet.
    /// A processor already registered under the same name is replaced and
    /// shut down.
    pub async fn register(&self, processor: Arc<dyn OutputProcessor>) -> Result<(), ExportError> {
        let name = processor.name().to_string();
        if processor.is_enabled() && !processor.is_ready() {
            processor.initialize().await?;
        }

        let previous = self.processors.write().insert(name.clone(), processor);
        if let Some(previous) = previous {
            warn!(output = %name, "Replacing already registered output processor");
            previous.shutdown().await;
        }
        info!(output = %name, "Registered output processor");
        Ok(())
    }

    /// Remove and shut down the processor called `name`.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.processors.write().remove(name);
        match removed {
            Some(processor) => {
                processor.shutdown().await;
                info!(output = %name, "Unregistered output processor");
                true
            }
            None => false,
        }
    }

    pub fn processor_names(&self) -> Vec<String> {
        self.processors.read().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OutputProcessor>> {
        self.processors.read().get(name).cloned()
    }

    fn active(&self) -> Vec<Arc<dyn OutputProcessor>> {
        self.processors
            .read()
            .values()
            .filter(|p| p.is_enabled() && p.is_ready())
            .cloned()
            .collect()
    }

    /// Whether any processor would receive a batch right now.
    pub fn has_active(&self) -> bool {
        self.processors
            .read()
            .values()
            .any(|p| p.is_enabled() && p.is_ready())
    }

    /// Hand `batch` to every enabled and ready processor concurrently and
    /// wait for all of them.
    pub async fn process(&self, batch: &Batch) -> Vec<(String, ProcessOutcome)> {
        if batch.is_empty() {
            return Vec::new();
        }
        let active = self.active();
        if active.is_empty() {
            debug!(batch_id = batch.id(), "No active output processors");
            return Vec::new();
        }

        join_all(active.iter().map(|processor| async move {
            (processor.name().to_string(), processor.process(batch).await)
        }))
        .await
    }

    pub async fn shutdown_all(&self) {
        let all: Vec<Arc<dyn OutputProcessor>> = self.processors.read().values().cloned().collect();
        join_all(all.iter().map(|p| p.shutdown())).await;
    }
}
