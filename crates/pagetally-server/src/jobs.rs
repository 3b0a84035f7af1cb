//! Bounded executor for background export jobs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use pagetally_core::clock::Clock;
use pagetally_core::export::{record_failure, run_export, Export, ExportState};
use pagetally_core::store::{ExportStore, HitStore};

/// Message recorded on an export whose task panicked.
pub const PANIC_MESSAGE: &str = "export failed: internal error";

/// Runs export jobs in the background with bounded concurrency.
///
/// Jobs return immediately to the caller; their progress is only visible
/// through the stored export state. A panicking job is caught at the task
/// boundary and recorded as `failed`.
pub struct JobExecutor {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl JobExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Run `export` to a terminal state in the background.
    pub fn spawn_export(
        &self,
        exports: Arc<dyn ExportStore>,
        hits: Arc<dyn HitStore>,
        clock: Arc<dyn Clock>,
        export: Export,
    ) {
        let id = export.id;
        let job = {
            let exports = Arc::clone(&exports);
            let clock = Arc::clone(&clock);
            async move { run_export(&*exports, &*hits, &*clock, &export).await }
        };
        self.spawn_guarded(id, exports, clock, job);
    }

    fn spawn_guarded<F>(
        &self,
        export_id: i64,
        exports: Arc<dyn ExportStore>,
        clock: Arc<dyn Clock>,
        job: F,
    ) where
        F: Future<Output = ExportState> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let task = async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(export_id, "Executor closed before export could start");
                    record_failure(&*exports, &*clock, export_id, "export failed: server shutting down")
                        .await;
                    return;
                }
            };

            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(state) => debug!(export_id, state = state.as_str(), "Export job finished"),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    error!(export_id, panic = %detail, "Export job panicked");
                    record_failure(&*exports, &*clock, export_id, PANIC_MESSAGE).await;
                }
            }
        };

        let mut tasks = self.lock_tasks();
        // Reap finished jobs so the set only tracks live ones.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Number of jobs not yet reaped.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait up to `timeout` for every job spawned so far.
    /// Returns the number still running when the timeout hit; those are aborted.
    pub async fn join_all(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Export task aborted");
                }
            }
        })
        .await;
        match drained {
            Ok(()) => 0,
            Err(_) => {
                let left = tasks.len();
                warn!(left, "Export jobs still running at timeout, aborting them");
                tasks.abort_all();
                left
            }
        }
    }

    /// Stop accepting new work and wait for in-flight jobs.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.permits.close();
        self.join_all(timeout).await
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
