//! Storage abstraction.
//!
//! The flush cycle and the export job only talk to storage through these
//! traits; `pagetally-duckdb` provides the implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::export::{Export, ExportSummary};
use crate::hit::Hit;

/// A hit as read back from durable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHit {
    pub id: i64,
    pub hit: Hit,
}

/// A row just committed by a flush, with the number of submissions that
/// were merged into it while buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedHit {
    pub id: i64,
    pub hit: Hit,
    pub count: u32,
}

#[async_trait]
pub trait HitStore: Send + Sync + 'static {
    /// Write all hits atomically: either every row is committed or none is.
    /// Returns the assigned ids, ascending and in input order.
    async fn insert_hits(&self, hits: &[Hit]) -> anyhow::Result<Vec<i64>>;

    /// Hits of `website_id` with `id > after_id`, ascending by id.
    async fn hits_after(
        &self,
        website_id: &str,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredHit>>;

    /// Highest session number stored so far (0 when there are none).
    async fn max_session(&self) -> anyhow::Result<i64>;
}

/// Downstream statistics, updated after every successful flush.
#[async_trait]
pub trait StatsUpdater: Send + Sync + 'static {
    /// Called once per site with exactly the rows flushed for that site.
    /// Each row counts as `count` pageviews.
    async fn update_stats(&self, website_id: &str, hits: &[FlushedHit]) -> anyhow::Result<()>;
}

/// Result of asking storage for a new export.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateExport {
    /// A new pending export was recorded.
    Created(Export),
    /// An unfinished export with the same cursor already exists for the site.
    Joined(Export),
    /// An unfinished export with a different cursor already exists.
    Conflict(Export),
}

#[async_trait]
pub trait ExportStore: Send + Sync + 'static {
    /// Record a pending export for `website_id`, unless one is already
    /// pending or running for that site. The check and insert are atomic.
    async fn create_export(
        &self,
        website_id: &str,
        start_from_hit_id: i64,
        export_dir: &Path,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CreateExport>;

    async fn get_export(&self, website_id: &str, id: i64) -> anyhow::Result<Option<Export>>;

    /// `pending → running`. Returns `false` if the export was not pending.
    async fn mark_export_running(&self, id: i64) -> anyhow::Result<bool>;

    /// `running → done`.
    async fn finish_export(
        &self,
        id: i64,
        summary: &ExportSummary,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// `pending | running → failed`. Terminal exports are left untouched.
    async fn fail_export(
        &self,
        id: i64,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Fail every export still pending or running; used at startup after a crash.
    async fn fail_unfinished_exports(
        &self,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<usize>;
}
