//! Hourly hit rollup, maintained after each flush.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use pagetally_core::store::FlushedHit;

use crate::schema::{format_ts, ts_column};
use crate::DuckDbBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyStat {
    pub path: String,
    pub event: bool,
    pub hour: DateTime<Utc>,
    pub total: i64,
    /// Number of first visits in the hour.
    pub unique: i64,
}

impl DuckDbBackend {
    /// Add the given rows of `website_id` to the hourly rollup. A row counts
    /// as `count` pageviews and at most one first visit.
    pub async fn update_hit_stats(&self, website_id: &str, hits: &[FlushedHit]) -> Result<()> {
        let mut grouped: BTreeMap<(String, bool, DateTime<Utc>), (i64, i64)> = BTreeMap::new();
        for stored in hits {
            let hour = stored.hit.created_at.duration_trunc(Duration::hours(1))?;
            let entry = grouped
                .entry((stored.hit.path.clone(), stored.hit.event, hour))
                .or_default();
            entry.0 += i64::from(stored.count);
            if stored.hit.first_visit {
                entry.1 += 1;
            }
        }
        if grouped.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hit_stats (website_id, path, event, hour, total, uniq) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (website_id, path, event, hour) DO UPDATE SET \
                 total = hit_stats.total + EXCLUDED.total, \
                 uniq = hit_stats.uniq + EXCLUDED.uniq",
            )?;
            for ((path, event, hour), (total, unique)) in &grouped {
                stmt.execute(duckdb::params![
                    website_id,
                    path,
                    *event,
                    format_ts(*hour),
                    *total,
                    *unique
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn hourly_stats(&self, website_id: &str) -> Result<Vec<HourlyStat>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT path, event, CAST(hour AS VARCHAR), total, uniq FROM hit_stats \
             WHERE website_id = ?1 ORDER BY hour, path, event",
        )?;
        let rows = stmt.query_map(duckdb::params![website_id], |row| {
            Ok(HourlyStat {
                path: row.get(0)?,
                event: row.get(1)?,
                hour: ts_column(row, 2)?,
                total: row.get(3)?,
                unique: row.get(4)?,
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}
