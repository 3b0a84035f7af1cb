use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagetally_core::export::{Export, ExportSummary};
use pagetally_core::hit::Hit;
use pagetally_core::store::{
    CreateExport, ExportStore, FlushedHit, HitStore, StatsUpdater, StoredHit,
};

use crate::DuckDbBackend;

#[async_trait]
impl HitStore for DuckDbBackend {
    async fn insert_hits(&self, hits: &[Hit]) -> anyhow::Result<Vec<i64>> {
        DuckDbBackend::insert_hits(self, hits).await
    }

    async fn hits_after(
        &self,
        website_id: &str,
        after_id: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredHit>> {
        DuckDbBackend::hits_after(self, website_id, after_id, limit).await
    }

    async fn max_session(&self) -> anyhow::Result<i64> {
        DuckDbBackend::max_session(self).await
    }
}

#[async_trait]
impl StatsUpdater for DuckDbBackend {
    async fn update_stats(&self, website_id: &str, hits: &[FlushedHit]) -> anyhow::Result<()> {
        self.update_hit_stats(website_id, hits).await
    }
}

#[async_trait]
impl ExportStore for DuckDbBackend {
    async fn create_export(
        &self,
        website_id: &str,
        start_from_hit_id: i64,
        export_dir: &Path,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CreateExport> {
        DuckDbBackend::create_export(self, website_id, start_from_hit_id, export_dir, now).await
    }

    async fn get_export(&self, website_id: &str, id: i64) -> anyhow::Result<Option<Export>> {
        DuckDbBackend::get_export(self, website_id, id).await
    }

    async fn mark_export_running(&self, id: i64) -> anyhow::Result<bool> {
        DuckDbBackend::mark_export_running(self, id).await
    }

    async fn finish_export(
        &self,
        id: i64,
        summary: &ExportSummary,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        DuckDbBackend::finish_export(self, id, summary, finished_at).await
    }

    async fn fail_export(
        &self,
        id: i64,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        DuckDbBackend::fail_export(self, id, error, finished_at).await
    }

    async fn fail_unfinished_exports(
        &self,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        DuckDbBackend::fail_unfinished_exports(self, error, finished_at).await
    }
}
