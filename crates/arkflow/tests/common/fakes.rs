//! In-process stand-ins for the orchestrator's collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use arkflow::chunk::Chunk;
use arkflow::consumer::CompletionSink;
use arkflow::material::{ContentPresigner, MaterialError};
use arkflow::queue::{MessageQueue, QueueError, Subscription};
use arkflow::reconcile::CompletionUpdate;
use arkflow::task::{TaskStore, TaskUpdate};
use arkflow::InProcessQueue;
use arkflow::worker::{
    EmbeddingSink, WorkerAdapter, WorkerError, WorkerJob, WorkerOutput, WorkerPoll, WorkerStatus,
};
use arkflow::ProcessingType;

/// Presigner returning `https://storage.test/<ref>?sig=test`.
#[derive(Default)]
pub struct FakePresigner {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakePresigner {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentPresigner for FakePresigner {
    async fn presign_download(
        &self,
        storage_ref: &str,
        _ttl: Duration,
    ) -> Result<String, MaterialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(MaterialError::Storage("bucket unreachable".to_string()));
        }
        Ok(format!("https://storage.test/{}?sig=test", storage_ref))
    }
}

/// Scripted worker behaviour.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Completes with the text after the given number of processing polls.
    CompleteAfter(u32, String),
    FailWith(String),
    NeverFinish,
    PanicOnPoll,
}

pub struct FakeWorker {
    name: String,
    processing_type: ProcessingType,
    behavior: Behavior,
    submits: AtomicUsize,
    polls: Mutex<HashMap<String, u32>>,
    hang_first_submit: bool,
}

impl FakeWorker {
    pub fn new(processing_type: ProcessingType, behavior: Behavior) -> Self {
        Self {
            name: format!("fake-{}", processing_type.source_label()),
            processing_type,
            behavior,
            submits: AtomicUsize::new(0),
            polls: Mutex::new(HashMap::new()),
            hang_first_submit: false,
        }
    }

    /// The first submit never answers.
    pub fn hanging_first_submit(mut self) -> Self {
        self.hang_first_submit = true;
        self
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self, task_id: &str) -> u32 {
        self.polls.lock().unwrap().get(task_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WorkerAdapter for FakeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn processing_type(&self) -> ProcessingType {
        self.processing_type
    }

    async fn submit(&self, _job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
        let previous = self.submits.fetch_add(1, Ordering::SeqCst);
        if self.hang_first_submit && previous == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(WorkerStatus::Queued)
    }

    async fn poll(&self, task_id: &str) -> Result<WorkerPoll, WorkerError> {
        let count = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(task_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        match &self.behavior {
            Behavior::CompleteAfter(processing, text) if count > *processing => {
                Ok(WorkerPoll::completed(WorkerOutput {
                    content: Some(text.clone()),
                    ..WorkerOutput::default()
                }))
            }
            Behavior::CompleteAfter(..) | Behavior::NeverFinish => {
                Ok(WorkerPoll::in_progress(WorkerStatus::Processing, 0.5))
            }
            Behavior::FailWith(reason) => Ok(WorkerPoll::failed(reason.clone())),
            Behavior::PanicOnPoll => panic!("fake worker crashed"),
        }
    }
}

/// Embedding sink remembering every batch.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<Chunk>>>,
    fail: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    /// Sink that takes `delay` to accept each batch.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<Chunk>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingSink for RecordingSink {
    async fn upsert_chunks(
        &self,
        _material_id: &str,
        _user_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::Unavailable("vector store offline".to_string()));
        }
        self.batches.lock().unwrap().push(chunks.to_vec());
        Ok(chunks.len())
    }
}

/// Completion sink that rejects its first `failures` reports and can be
/// held closed until released.
pub struct ScriptedCompletionSink {
    failures: AtomicUsize,
    gate: Option<Notify>,
    received: Mutex<Vec<CompletionUpdate>>,
}

impl ScriptedCompletionSink {
    pub fn accepting() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            gate: None,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Holds every report until `release` is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::accepting()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn received(&self) -> Vec<CompletionUpdate> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionSink for ScriptedCompletionSink {
    async fn deliver(&self, update: CompletionUpdate) -> arkflow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.received.lock().unwrap().push(update);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(arkflow::ArkflowError::Validation(
                "callback endpoint unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue whose worker answers before `publish` returns: every published
/// job immediately receives `report` in the attached store.
pub struct FastReportQueue {
    inner: InProcessQueue,
    report: TaskUpdate,
    store: Mutex<Option<TaskStore>>,
}

impl FastReportQueue {
    pub fn new(report: TaskUpdate) -> Self {
        Self {
            inner: InProcessQueue::new(),
            report,
            store: Mutex::new(None),
        }
    }

    pub fn attach(&self, store: TaskStore) {
        *self.store.lock().unwrap() = Some(store);
    }
}

#[async_trait]
impl MessageQueue for FastReportQueue {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), QueueError> {
        self.inner.publish(topic, key, payload).await?;
        let store = self.store.lock().unwrap().clone();
        if let Some(store) = store {
            store
                .update_by_id(key, self.report.clone())
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, QueueError> {
        self.inner.subscribe(topic).await
    }
}
