//! Worker-side consumption of queued jobs.
//!
//! A `JobConsumer` takes jobs off a topic, submits them to a worker,
//! polls until the worker is done and reports the result through a
//! `CompletionSink`. A delivery is acknowledged only after the report
//! was accepted, so a crash between the two redelivers the job; the
//! re-entrant worker wrapper keeps redelivery from submitting twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tracing::{info_span, Instrument};

use crate::config::{PollingConfig, QueueConfig};
use crate::dispatch::JobMessage;
use crate::error::{ArkflowError, Result};
use crate::queue::{Delivery, MessageQueue};
use crate::reconcile::{CompletionReconciler, CompletionUpdate, PollLoop};
use crate::worker::WorkerAdapter;

/// Deliveries of one job before a retryable submit error is final.
const MAX_SUBMIT_ATTEMPTS: u32 = 3;
/// Deliveries of one job whose report may be rejected before the job is
/// dropped and left to the reaper.
pub const MAX_REPORT_ATTEMPTS: u32 = 8;
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
const REDELIVERY_BASE_DELAY: Duration = Duration::from_millis(500);
const REDELIVERY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Receiver of worker reports.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn deliver(&self, update: CompletionUpdate) -> Result<()>;
}

#[async_trait]
impl CompletionSink for CompletionReconciler {
    async fn deliver(&self, update: CompletionUpdate) -> Result<()> {
        match self.apply_callback(update).await {
            Ok(_) => Ok(()),
            // Redelivery cannot fix a report the task no longer accepts.
            Err(e @ ArkflowError::InvalidTransition { .. }) => {
                log::warn!("Dropping report: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct JobConsumer {
    queue: Arc<dyn MessageQueue>,
    topic: String,
    adapter: Arc<dyn WorkerAdapter>,
    sink: Arc<dyn CompletionSink>,
    poll: PollLoop,
    concurrency: usize,
    submit_timeout: Duration,
    callback_timeout: Duration,
    stopped: AtomicBool,
    wake: Notify,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        topic: &str,
        adapter: Arc<dyn WorkerAdapter>,
        sink: Arc<dyn CompletionSink>,
        poll: PollLoop,
    ) -> Self {
        Self {
            queue,
            topic: topic.to_string(),
            adapter,
            sink,
            poll,
            concurrency: 1,
            submit_timeout: Duration::from_secs(30),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Applies concurrency and timeouts from configuration.
    pub fn configured(mut self, queue: &QueueConfig, polling: &PollingConfig) -> Self {
        self.concurrency = queue.consumer_concurrency.max(1);
        self.callback_timeout = queue.callback_timeout();
        self.submit_timeout = polling.submit_timeout();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumes the topic until `stop` is called or the queue closes,
    /// then waits for in-flight jobs.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut subscription = self.queue.subscribe(&self.topic).await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        log::info!(
            "Consuming {} with {} ({} concurrent)",
            self.topic,
            self.adapter.name(),
            self.concurrency
        );

        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.wake.notified() => break,
            };

            let delivery = tokio::select! {
                delivery = subscription.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
                _ = self.wake.notified() => break,
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle(delivery).await;
                drop(permit);
            });
        }

        // Every permit back means every spawned handler finished.
        let _ = permits.acquire_many(self.concurrency as u32).await;
        log::info!("Stopped consuming {}", self.topic);
        Ok(())
    }

    /// Signals `run` to stop taking new deliveries.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    async fn handle(&self, delivery: Delivery) {
        let message: JobMessage = match serde_json::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                log::error!(
                    "Dropping undecodable job {} on {}: {}",
                    delivery.key,
                    self.topic,
                    e
                );
                delivery.ack();
                return;
            }
        };

        let span = info_span!(
            "consume_job",
            task_id = %message.task_id,
            topic = %self.topic,
            attempt = delivery.attempt
        );
        self.process(message, delivery).instrument(span).await
    }

    async fn process(&self, message: JobMessage, delivery: Delivery) {
        let job = message.to_worker_job();
        let task_id = job.task_id.clone();

        let update = match tokio::time::timeout(self.submit_timeout, self.adapter.submit(&job)).await {
            Ok(Ok(_)) => self
                .poll
                .wait_for_terminal(self.adapter.as_ref(), &task_id)
                .await
                .into_update(&task_id),
            Ok(Err(e)) if e.is_retryable() && delivery.attempt < MAX_SUBMIT_ATTEMPTS => {
                log::warn!("Submit of task {} failed, will retry: {}", task_id, e);
                return self.redeliver(delivery).await;
            }
            Ok(Err(e)) => CompletionUpdate::failed(
                &task_id,
                ArkflowError::Dispatch(format!("submit to {}: {}", self.adapter.name(), e))
                    .to_string(),
            ),
            Err(_) if delivery.attempt < MAX_SUBMIT_ATTEMPTS => {
                log::warn!("Submit of task {} timed out, will retry", task_id);
                return self.redeliver(delivery).await;
            }
            Err(_) => CompletionUpdate::failed(
                &task_id,
                ArkflowError::Timeout(format!(
                    "submit to {} took longer than {}s",
                    self.adapter.name(),
                    self.submit_timeout.as_secs()
                ))
                .to_string(),
            ),
        };
        let update = update.with_meta("consumer", self.topic.clone());

        match tokio::time::timeout(self.callback_timeout, self.sink.deliver(update)).await {
            Ok(Ok(())) => {
                log::debug!("Reported task {}", task_id);
                delivery.ack();
            }
            Ok(Err(e)) => {
                log::warn!("Report for task {} was not accepted: {}", task_id, e);
                self.retry_report(&task_id, delivery).await;
            }
            Err(_) => {
                log::warn!(
                    "Report for task {} took longer than {:?}",
                    task_id,
                    self.callback_timeout
                );
                self.retry_report(&task_id, delivery).await;
            }
        }
    }

    async fn retry_report(&self, task_id: &str, delivery: Delivery) {
        if delivery.attempt >= MAX_REPORT_ATTEMPTS {
            log::error!(
                "Giving up on reporting task {} after {} deliveries",
                task_id,
                delivery.attempt
            );
            delivery.ack();
            return;
        }
        self.redeliver(delivery).await;
    }

    async fn redeliver(&self, delivery: Delivery) {
        let exponent = delivery.attempt.saturating_sub(1).min(6);
        let delay = (REDELIVERY_BASE_DELAY * 2u32.pow(exponent)).min(REDELIVERY_MAX_DELAY);
        tokio::time::sleep(delay).await;
        delivery.nack();
    }
}
