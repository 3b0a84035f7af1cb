//! Flush cycle: drain the memstore into durable storage on a timer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::export::{blocking, ExportError, ExportWriter};
use crate::hit::Hit;
use crate::memstore::{BufferedHit, Memstore};
use crate::store::{FlushedHit, HitStore, StatsUpdater};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Rows committed to storage.
    pub persisted: usize,
    /// Rows put back into the buffer after a failed write.
    pub requeued: usize,
}

/// What the final drain did with the buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    pub persisted: usize,
    /// Submissions that could not be stored and went to `dead_letter`.
    pub dead_lettered: usize,
    pub dead_letter: Option<PathBuf>,
}

pub struct Flusher {
    memstore: Arc<Memstore>,
    store: Arc<dyn HitStore>,
    stats: Arc<dyn StatsUpdater>,
    /// Held for the whole flush so timer and manual triggers never overlap.
    in_flight: Mutex<()>,
    wake: Notify,
}

impl Flusher {
    pub fn new(
        memstore: Arc<Memstore>,
        store: Arc<dyn HitStore>,
        stats: Arc<dyn StatsUpdater>,
    ) -> Self {
        Self {
            memstore,
            store,
            stats,
            in_flight: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn memstore(&self) -> &Arc<Memstore> {
        &self.memstore
    }

    /// Ask the flush loop to run before its next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Drain the buffer and write it out.
    ///
    /// The buffer lock is only held for the swap. On a failed write the rows
    /// are re-queued; on success the stats collaborator is called once per
    /// site with exactly that site's rows.
    pub async fn flush(&self) -> FlushOutcome {
        let _guard = self.in_flight.lock().await;

        let rows = self.memstore.persist().await;
        if rows.is_empty() {
            return FlushOutcome::default();
        }

        let hits: Vec<Hit> = rows.iter().map(|r| r.hit.clone()).collect();
        let ids = match self.store.insert_hits(&hits).await {
            Ok(ids) if ids.len() == hits.len() => ids,
            Ok(ids) => {
                error!(
                    expected = hits.len(),
                    got = ids.len(),
                    "Hit store returned a mismatched id count, re-queueing batch"
                );
                let requeued = rows.len();
                self.memstore.requeue(rows).await;
                return FlushOutcome {
                    persisted: 0,
                    requeued,
                };
            }
            Err(e) => {
                error!(count = rows.len(), error = %e, "Buffer flush failed, rows re-queued");
                let requeued = rows.len();
                self.memstore.requeue(rows).await;
                return FlushOutcome {
                    persisted: 0,
                    requeued,
                };
            }
        };

        let merged: u64 = rows.iter().map(|r| u64::from(r.count.saturating_sub(1))).sum();
        let persisted = hits.len();

        let mut by_site: BTreeMap<String, Vec<FlushedHit>> = BTreeMap::new();
        for (id, row) in ids.into_iter().zip(rows) {
            by_site
                .entry(row.hit.website_id.clone())
                .or_default()
                .push(FlushedHit {
                    id,
                    hit: row.hit,
                    count: row.count,
                });
        }
        for (website_id, site_hits) in &by_site {
            if let Err(e) = self.stats.update_stats(website_id, site_hits).await {
                error!(website_id = %website_id, count = site_hits.len(), error = %e, "Stats update failed");
            }
        }

        info!(count = persisted, merged, sites = by_site.len(), "Buffer flushed");
        FlushOutcome {
            persisted,
            requeued: 0,
        }
    }

    /// Final flush before exit.
    ///
    /// A failed write is retried up to `attempts` times, `retry_delay` apart.
    /// Whatever is still buffered after that is written to
    /// `<dir>/unflushed-<timestamp>.csv.gz` in the export format so it can be
    /// imported later. An error means buffered hits were lost.
    pub async fn drain(
        &self,
        attempts: u32,
        retry_delay: Duration,
        dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<DrainOutcome, ExportError> {
        let attempts = attempts.max(1);
        let mut outcome = DrainOutcome::default();
        for attempt in 1..=attempts {
            let flushed = self.flush().await;
            outcome.persisted += flushed.persisted;
            if flushed.requeued == 0 {
                return Ok(outcome);
            }
            warn!(attempt, attempts, requeued = flushed.requeued, "Final flush failed");
            if attempt < attempts {
                tokio::time::sleep(retry_delay).await;
            }
        }

        let rows = {
            let _guard = self.in_flight.lock().await;
            self.memstore.persist().await
        };
        if rows.is_empty() {
            return Ok(outcome);
        }
        let path = dir.join(format!("unflushed-{}.csv.gz", now.format("%Y%m%dT%H%M%S")));
        let submissions: usize = rows.iter().map(|r| r.count.max(1) as usize).sum();
        match write_dead_letter(path.clone(), rows).await {
            Ok(()) => {
                error!(
                    count = submissions,
                    path = %path.display(),
                    "Could not store buffered hits, wrote them to a dead-letter file"
                );
                outcome.dead_lettered = submissions;
                outcome.dead_letter = Some(path);
                Ok(outcome)
            }
            Err(e) => {
                error!(count = submissions, error = %e, "Buffered hits lost");
                Err(e)
            }
        }
    }

    /// Flush every `interval`, or earlier when [`Flusher::wake`] is called,
    /// until `shutdown` is cancelled. The final drain is left to the caller.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing is buffered yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.flush().await;
        }
        info!("Flush loop stopped");
    }
}

/// Write buffered rows as an export file, one line per merged submission.
async fn write_dead_letter(path: PathBuf, rows: Vec<BufferedHit>) -> Result<(), ExportError> {
    blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = ExportWriter::create(&path)?;
        for row in &rows {
            for _ in 0..row.count.max(1) {
                writer.write_hit(&row.hit)?;
            }
        }
        writer.finish()?;
        Ok(())
    })
    .await
}
