//! Test harness wiring an `Orchestrator` to in-process collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arkflow::config::{Config, RouteConfig};
use arkflow::db::Database;
use arkflow::material::{Material, MemoryMaterialDirectory};
use arkflow::worker::{SubmissionTracker, WorkerAdapter, WorkerRegistry};
use arkflow::{InProcessQueue, Orchestrator, ProcessingTask, ProcessingType};

use super::fakes::{FakePresigner, RecordingSink};

pub const OCR_TOPIC: &str = "ocr.jobs";
pub const TEXT_TOPIC: &str = "text.extracted";

/// Config with fast polling, an in-memory database and the reaper off.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.database.in_memory = true;
    config.reaper.enabled = false;
    config.dispatch.routes.text_extraction = RouteConfig::Queue {
        topic: OCR_TOPIC.to_string(),
    };
    config.dispatch.routes.transcription = RouteConfig::Direct;
    config.dispatch.routes.embedding_ingest = RouteConfig::Direct;
    config.queue.text_extracted_topic = Some(TEXT_TOPIC.to_string());
    config.queue.consumer_concurrency = 2;
    config.polling.interval_ms = 10;
    config.polling.deadline_secs = 5;
    config.polling.call_timeout_secs = 1;
    config.polling.submit_timeout_secs = 1;
    config
}

pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub materials: Arc<MemoryMaterialDirectory>,
    pub presigner: Arc<FakePresigner>,
    pub queue: InProcessQueue,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    /// Harness without direct workers and with a working embedding sink.
    pub fn new() -> Self {
        Self::build(test_config(), Vec::new(), RecordingSink::default())
    }

    /// Harness with `workers` registered behind submission trackers.
    pub fn with_workers(workers: Vec<Arc<dyn WorkerAdapter>>) -> Self {
        Self::build(test_config(), workers, RecordingSink::default())
    }

    pub fn build(
        config: Config,
        workers: Vec<Arc<dyn WorkerAdapter>>,
        sink: RecordingSink,
    ) -> Self {
        let materials = Arc::new(MemoryMaterialDirectory::new());
        let presigner = Arc::new(FakePresigner::default());
        let queue = InProcessQueue::new();
        let sink = Arc::new(sink);

        let mut registry = WorkerRegistry::new();
        for worker in workers {
            registry.register_tracked(worker, SubmissionTracker::new(Duration::from_secs(60)));
        }
        registry.set_sink(sink.clone());

        let orchestrator = Orchestrator::builder(config)
            .database(Database::open_in_memory().expect("Failed to open database"))
            .materials(materials.clone())
            .presigner(presigner.clone())
            .queue(Arc::new(queue.clone()))
            .workers(registry)
            .build()
            .expect("Failed to build orchestrator");

        Self {
            orchestrator,
            materials,
            presigner,
            queue,
            sink,
        }
    }

    /// Stores a material; its content type follows the file extension.
    pub fn add_material(&self, id: &str, owner: &str, storage_ref: &str) {
        self.materials.insert(Material::stored(id, owner, storage_ref));
    }

    pub async fn create(
        &self,
        material_id: &str,
        user_id: &str,
        processing_type: ProcessingType,
    ) -> arkflow::Result<ProcessingTask> {
        self.orchestrator
            .create_processing_task(material_id, user_id, processing_type, Default::default())
            .await
    }

    /// Waits until every supervised background job has finished.
    pub async fn settle(&self) {
        self.orchestrator.supervisor().wait_idle().await;
    }
}
