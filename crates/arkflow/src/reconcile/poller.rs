//! Bounded polling of a worker until it reports a terminal status.

use std::time::Duration;

use tokio::time::Instant;

use super::CompletionUpdate;
use crate::config::PollingConfig;
use crate::error::ArkflowError;
use crate::task::TaskStatus;
use crate::worker::{WorkerAdapter, WorkerOutput, WorkerStatus};

const UNREPORTED_WORKER_ERROR: &str = "worker reported failure without details";

/// Consecutive "unknown task" answers before the job counts as lost.
const MAX_UNKNOWN_POLLS: u32 = 3;

/// How a polled job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(WorkerOutput),
    Failed(String),
    TimedOut { waited: Duration },
}

impl PollOutcome {
    /// Converts the outcome into the completion update for `task_id`.
    pub fn into_update(self, task_id: &str) -> CompletionUpdate {
        match self {
            PollOutcome::Completed(output) => CompletionUpdate {
                task_id: task_id.to_string(),
                status: TaskStatus::Completed,
                content: output.content,
                metadata: output.metadata,
                error_reason: None,
            },
            PollOutcome::Failed(reason) => CompletionUpdate::failed(
                task_id,
                ArkflowError::UpstreamWorker(reason).to_string(),
            ),
            PollOutcome::TimedOut { waited } => CompletionUpdate::failed(
                task_id,
                ArkflowError::Timeout(format!(
                    "worker did not finish within {}s",
                    waited.as_secs()
                ))
                .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollLoop {
    interval: Duration,
    deadline: Duration,
    call_timeout: Duration,
}

impl PollLoop {
    pub fn new(interval: Duration, deadline: Duration, call_timeout: Duration) -> Self {
        Self {
            interval,
            deadline,
            call_timeout,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(config.interval(), config.deadline(), config.call_timeout())
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Time a poll call started at `now` may take.
    ///
    /// Never more than the call timeout, and never past one interval
    /// beyond the deadline.
    fn call_budget(&self, now: Instant, deadline: Instant) -> Duration {
        self.call_timeout
            .min(deadline.saturating_duration_since(now) + self.interval)
    }

    /// Polls `adapter` every interval until the job is terminal or the
    /// deadline passes. Poll errors and slow calls are retried on the
    /// next tick; a worker that keeps answering "unknown task" fails the
    /// job early.
    pub async fn wait_for_terminal(&self, adapter: &dyn WorkerAdapter, task_id: &str) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + self.deadline;
        let mut polls: u32 = 0;
        let mut unknown_polls: u32 = 0;

        loop {
            polls += 1;
            let budget = self.call_budget(Instant::now(), deadline);
            let answer = tokio::time::timeout(budget, adapter.poll(task_id)).await;
            if !matches!(&answer, Ok(Err(e)) if e.is_not_found()) {
                unknown_polls = 0;
            }
            match answer {
                Ok(Ok(poll)) => match poll.status {
                    WorkerStatus::Completed => {
                        log::debug!("Task {} completed after {} polls", task_id, polls);
                        return PollOutcome::Completed(poll.output.unwrap_or_default());
                    }
                    WorkerStatus::Failed => {
                        let reason = poll
                            .error
                            .filter(|e| !e.trim().is_empty())
                            .unwrap_or_else(|| UNREPORTED_WORKER_ERROR.to_string());
                        return PollOutcome::Failed(reason);
                    }
                    status => {
                        log::debug!(
                            "Task {} still {:?} on {} ({:.0}%)",
                            task_id,
                            status,
                            adapter.name(),
                            poll.progress * 100.0
                        );
                    }
                },
                Ok(Err(e)) if e.is_not_found() => {
                    unknown_polls += 1;
                    if unknown_polls >= MAX_UNKNOWN_POLLS {
                        log::warn!(
                            "{} does not know task {} after {} polls",
                            adapter.name(),
                            task_id,
                            unknown_polls
                        );
                        return PollOutcome::Failed(format!(
                            "{} lost track of the job",
                            adapter.name()
                        ));
                    }
                    log::debug!("{} does not know task {} yet", adapter.name(), task_id);
                }
                Ok(Err(e)) => {
                    log::warn!("Polling {} for task {} failed: {}", adapter.name(), task_id, e);
                }
                Err(_) => {
                    log::warn!(
                        "Polling {} for task {} took longer than {:?}",
                        adapter.name(),
                        task_id,
                        budget
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut {
                    waited: now - started,
                };
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerError, WorkerJob, WorkerPoll};
    use crate::task::ProcessingType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays scripted poll answers, repeating the last one.
    struct ScriptedWorker {
        script: Mutex<Vec<Result<WorkerPoll, WorkerError>>>,
        polls: Mutex<u32>,
    }

    impl ScriptedWorker {
        fn new(mut script: Vec<Result<WorkerPoll, WorkerError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                polls: Mutex::new(0),
            }
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    #[async_trait]
    impl WorkerAdapter for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        fn processing_type(&self) -> ProcessingType {
            ProcessingType::TextExtraction
        }

        async fn submit(&self, _job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
            Ok(WorkerStatus::Queued)
        }

        async fn poll(&self, _task_id: &str) -> Result<WorkerPoll, WorkerError> {
            *self.polls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                match script.last().unwrap() {
                    Ok(poll) => Ok(poll.clone()),
                    Err(e) => Err(e.clone()),
                }
            }
        }
    }

    /// Never answers a poll.
    struct HungWorker;

    #[async_trait]
    impl WorkerAdapter for HungWorker {
        fn name(&self) -> &str {
            "hung"
        }

        fn processing_type(&self) -> ProcessingType {
            ProcessingType::TextExtraction
        }

        async fn submit(&self, _job: &WorkerJob) -> Result<WorkerStatus, WorkerError> {
            Ok(WorkerStatus::Queued)
        }

        async fn poll(&self, _task_id: &str) -> Result<WorkerPoll, WorkerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(WorkerPoll::in_progress(WorkerStatus::Processing, 0.0))
        }
    }

    fn poll_loop() -> PollLoop {
        PollLoop::new(
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_processing_polls() {
        let worker = ScriptedWorker::new(vec![
            Ok(WorkerPoll::in_progress(WorkerStatus::Processing, 0.5)),
            Ok(WorkerPoll::completed(WorkerOutput {
                content: Some("hello world".to_string()),
                ..WorkerOutput::default()
            })),
        ]);

        let outcome = poll_loop().wait_for_terminal(&worker, "t1").await;
        match outcome {
            PollOutcome::Completed(output) => {
                assert_eq!(output.content.as_deref(), Some("hello world"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(worker.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let worker = ScriptedWorker::new(vec![
            Err(WorkerError::Unavailable("503".to_string())),
            Ok(WorkerPoll::failed("bad scan")),
        ]);

        let outcome = poll_loop().wait_for_terminal(&worker, "t1").await;
        assert_eq!(outcome, PollOutcome::Failed("bad scan".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_wait() {
        let worker = ScriptedWorker::new(vec![Ok(WorkerPoll::in_progress(
            WorkerStatus::Processing,
            0.1,
        ))]);

        let started = Instant::now();
        let outcome = poll_loop().wait_for_terminal(&worker, "t1").await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(12));
        assert_eq!(worker.polls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_poll_times_out_within_one_interval_of_deadline() {
        let poll = PollLoop::new(
            Duration::from_secs(2),
            Duration::from_secs(11),
            Duration::from_secs(10),
        );

        let started = Instant::now();
        let outcome = poll.wait_for_terminal(&HungWorker, "t1").await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert!(elapsed >= Duration::from_secs(11));
        assert!(elapsed <= Duration::from_secs(13), "timed out after {:?}", elapsed);
    }

    #[test]
    fn test_call_budget_shrinks_near_deadline() {
        let poll = PollLoop::new(
            Duration::from_secs(2),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        let now = Instant::now();
        assert_eq!(poll.call_budget(now, now + Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(poll.call_budget(now, now + Duration::from_secs(1)), Duration::from_secs(3));
        assert_eq!(poll.call_budget(now, now), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_unknown_task_fails_early() {
        let worker = ScriptedWorker::new(vec![Err(WorkerError::UnknownTask("t1".to_string()))]);

        let started = Instant::now();
        let outcome = poll_loop().wait_for_terminal(&worker, "t1").await;

        assert_eq!(
            outcome,
            PollOutcome::Failed("scripted lost track of the job".to_string())
        );
        assert_eq!(worker.polls(), MAX_UNKNOWN_POLLS);
        assert!(started.elapsed() < poll_loop().deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_task_before_registration_is_tolerated() {
        let worker = ScriptedWorker::new(vec![
            Err(WorkerError::UnknownTask("t1".to_string())),
            Err(WorkerError::UnknownTask("t1".to_string())),
            Ok(WorkerPoll::in_progress(WorkerStatus::Queued, 0.0)),
            Err(WorkerError::UnknownTask("t1".to_string())),
            Ok(WorkerPoll::completed(WorkerOutput::default())),
        ]);

        let outcome = poll_loop().wait_for_terminal(&worker, "t1").await;
        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(worker.polls(), 5);
    }

    #[test]
    fn test_outcome_reasons() {
        let update = PollOutcome::Failed("bad scan".to_string()).into_update("t1");
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.error_reason.as_deref(), Some("worker failed: bad scan"));

        let update = PollOutcome::TimedOut {
            waited: Duration::from_secs(600),
        }
        .into_update("t1");
        assert_eq!(
            update.error_reason.as_deref(),
            Some("timeout: worker did not finish within 600s")
        );
    }
}
