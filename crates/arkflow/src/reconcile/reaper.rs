//! Fails tasks that stopped making progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::ReaperConfig;
use crate::error::{ArkflowError, Result};
use crate::task::{TaskStore, TaskUpdate};

/// Periodic sweep over pending and processing tasks.
pub struct Reaper {
    store: TaskStore,
    stale_after: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Reaper {
    pub fn new(store: TaskStore, stale_after: Duration) -> Self {
        Self {
            store,
            stale_after,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(store: TaskStore, config: &ReaperConfig) -> Self {
        Self::new(store, config.stale_after())
    }

    /// Fails every task not updated within `stale_after`. Returns how
    /// many tasks were failed.
    pub fn sweep(&self) -> Result<usize> {
        let older_than = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| ArkflowError::Validation(format!("stale_after out of range: {}", e)))?;
        let reason = ArkflowError::Timeout(format!(
            "no progress for {}s",
            self.stale_after.as_secs()
        ))
        .to_string();

        let mut reaped = 0;
        for task in self.store.find_stale(older_than)? {
            match self.store.update_by_id(&task.id, TaskUpdate::failed(reason.clone())) {
                Ok(outcome) if outcome.changed => {
                    log::warn!(
                        "Reaped stale task {} ({} for material {})",
                        task.id,
                        task.processing_type,
                        task.material_id
                    );
                    reaped += 1;
                }
                Ok(_) => {}
                // Finished between the scan and the update.
                Err(ArkflowError::InvalidTransition { .. } | ArkflowError::ConcurrentUpdate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Runs `sweep` every `interval` until `stop` is called.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = self.wake.notified() => {},
                }

                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }

                match self.sweep() {
                    Ok(0) => {}
                    Ok(n) => log::info!("Reaper failed {} stale tasks", n),
                    Err(e) => log::error!("Reaper sweep failed: {}", e),
                }
            }
        })
    }

    /// Signals the sweep loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
