//! Lookup of worker adapters by processing type.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    EmbeddingIngestClient, EmbeddingSink, RecognitionAdapter, SubmissionTracker, TrackedWorker,
    TranscriptionAdapter, WorkerAdapter, WorkerHttpClient,
};
use crate::config::WorkersConfig;
use crate::error::ConfigError;
use crate::task::ProcessingType;

#[derive(Clone, Default)]
pub struct WorkerRegistry {
    adapters: HashMap<ProcessingType, Arc<dyn WorkerAdapter>>,
    sink: Option<Arc<dyn EmbeddingSink>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds HTTP adapters for every configured endpoint. Each adapter is
    /// wrapped for re-entrant submission.
    pub fn from_config(config: &WorkersConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        if let Some(endpoint) = &config.recognition {
            let http = WorkerHttpClient::from_endpoint("recognition", endpoint)?;
            registry.register_tracked(
                Arc::new(RecognitionAdapter::new(http)),
                SubmissionTracker::new(endpoint.submission_ttl()),
            );
        }
        if let Some(endpoint) = &config.transcription {
            let http = WorkerHttpClient::from_endpoint("transcription", endpoint)?;
            registry.register_tracked(
                Arc::new(TranscriptionAdapter::new(http)),
                SubmissionTracker::new(endpoint.submission_ttl()),
            );
        }
        if let Some(endpoint) = &config.embedding {
            let http = WorkerHttpClient::from_endpoint("embedding", endpoint)?;
            let client = Arc::new(EmbeddingIngestClient::new(http));
            registry.set_sink(client.clone());
            registry.register_tracked(client, SubmissionTracker::new(endpoint.submission_ttl()));
        }

        log::info!(
            "Worker registry ready: {} adapters, embedding sink {}",
            registry.adapters.len(),
            if registry.sink.is_some() { "configured" } else { "absent" }
        );
        Ok(registry)
    }

    /// Registers `adapter` for its processing type, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn WorkerAdapter>) {
        self.adapters.insert(adapter.processing_type(), adapter);
    }

    pub fn register_tracked(&mut self, adapter: Arc<dyn WorkerAdapter>, tracker: SubmissionTracker) {
        self.register(Arc::new(TrackedWorker::new(adapter, tracker)));
    }

    pub fn set_sink(&mut self, sink: Arc<dyn EmbeddingSink>) {
        self.sink = Some(sink);
    }

    pub fn get(&self, processing_type: ProcessingType) -> Option<Arc<dyn WorkerAdapter>> {
        self.adapters.get(&processing_type).cloned()
    }

    pub fn sink(&self) -> Option<Arc<dyn EmbeddingSink>> {
        self.sink.clone()
    }
}
