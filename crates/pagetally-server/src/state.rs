use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pagetally_core::{
    clock::{Clock, SystemClock},
    config::Config,
    export::Export,
    flush::{FlushOutcome, Flusher},
    memstore::Memstore,
    session::SaltSchedule,
};
use pagetally_duckdb::DuckDbBackend;

use crate::jobs::JobExecutor;

/// Write attempts for the last flush before exit.
const FINAL_FLUSH_ATTEMPTS: u32 = 3;
const FINAL_FLUSH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
///
/// Constructed once per process; the memstore, flusher and job executor
/// live exactly as long as the server does and are drained on shutdown.
pub struct AppState {
    /// The DuckDB backend. Internally uses `Arc<tokio::sync::Mutex<Connection>>`.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// Time source for validation, session epochs and export timestamps.
    pub clock: Arc<dyn Clock>,

    /// In-memory hit buffer. Handlers only ever append to it.
    pub memstore: Arc<Memstore>,

    /// Moves the buffer into DuckDB; driven by [`AppState::run_buffer_flush_loop`].
    pub flusher: Arc<Flusher>,

    /// Background export jobs.
    pub jobs: JobExecutor,
}

impl AppState {
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        Self::with_clock(db, config, Arc::new(SystemClock))
    }

    /// Like [`AppState::new`] with an injected clock (tests, replay).
    pub fn with_clock(db: DuckDbBackend, config: Config, clock: Arc<dyn Clock>) -> Self {
        let db = Arc::new(db);
        let memstore = Arc::new(Memstore::new(
            Arc::clone(&clock),
            SaltSchedule::new(config.salt_rotation()),
        ));
        let flusher = Arc::new(Flusher::new(
            Arc::clone(&memstore),
            db.clone(),
            db.clone(),
        ));
        let jobs = JobExecutor::new(config.export_concurrency);
        Self {
            db,
            config: Arc::new(config),
            clock,
            memstore,
            flusher,
            jobs,
        }
    }

    /// Seed the session allocator above every session number already stored.
    pub async fn init_sessions(&self) -> anyhow::Result<()> {
        let max = self.db.max_session().await?;
        self.memstore.reserve_sessions_after(max).await;
        info!(max_session = max, "Session allocator seeded");
        Ok(())
    }

    /// Drain the buffer into DuckDB now.
    pub async fn flush_buffer(&self) -> FlushOutcome {
        self.flusher.flush().await
    }

    /// Last flush before exit; returns the number of rows stored.
    ///
    /// Errors when any buffered hit did not reach DuckDB. Hits that could
    /// not be stored are saved under `data_dir` for `pagetally import`, and
    /// the error names the file.
    pub async fn drain_buffer(&self) -> anyhow::Result<usize> {
        let outcome = self
            .flusher
            .drain(
                FINAL_FLUSH_ATTEMPTS,
                FINAL_FLUSH_RETRY_DELAY,
                Path::new(&self.config.data_dir),
                self.clock.now(),
            )
            .await
            .context("buffered hits could not be stored or saved")?;
        match outcome.dead_letter {
            Some(path) => anyhow::bail!(
                "{} buffered hits could not be stored; saved to {}",
                outcome.dead_lettered,
                path.display()
            ),
            None => Ok(outcome.persisted),
        }
    }

    /// Background loop: flush on the configured interval until `shutdown`.
    pub async fn run_buffer_flush_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.buffer_flush_interval();
        Arc::clone(&self.flusher).run(interval, shutdown).await;
    }

    /// Hand an export to the background executor.
    pub fn spawn_export(&self, export: Export) {
        self.jobs.spawn_export(
            self.db.clone(),
            self.db.clone(),
            Arc::clone(&self.clock),
            export,
        );
    }
}
