use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use pagetally_core::export::{export_file_name, Export, ExportState, ExportSummary};
use pagetally_core::store::CreateExport;

use crate::schema::{format_ts, opt_ts_column, ts_column};
use crate::DuckDbBackend;

const SELECT_EXPORT_COLUMNS: &str = "id, website_id, start_from_hit_id, last_hit_id, path, \
     CAST(created_at AS VARCHAR), CAST(finished_at AS VARCHAR), num_rows, size, hash, error, state";

fn row_to_export(row: &duckdb::Row<'_>) -> duckdb::Result<Export> {
    let state: String = row.get(11)?;
    let state = ExportState::parse(&state).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            11,
            duckdb::types::Type::Text,
            anyhow!("unknown export state {state:?}").into(),
        )
    })?;
    Ok(Export {
        id: row.get(0)?,
        site_id: row.get(1)?,
        start_from_hit_id: row.get(2)?,
        last_hit_id: row.get(3)?,
        path: row.get(4)?,
        created_at: ts_column(row, 5)?,
        finished_at: opt_ts_column(row, 6)?,
        num_rows: row.get(7)?,
        size: row.get(8)?,
        hash: row.get(9)?,
        error: row.get(10)?,
        state,
    })
}

fn query_export(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Option<Export>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_export(row)?)),
        None => Ok(None),
    }
}

impl DuckDbBackend {
    /// Record a new pending export, or report the unfinished one that blocks it.
    ///
    /// The lookup and the insert run under the connection lock in one
    /// transaction, so two concurrent calls for the same site can never
    /// both create an export.
    pub async fn create_export(
        &self,
        website_id: &str,
        start_from_hit_id: i64,
        export_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<CreateExport> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let unfinished = query_export(
            &tx,
            &format!(
                "SELECT {SELECT_EXPORT_COLUMNS} FROM exports \
                 WHERE website_id = ?1 AND state IN ('pending', 'running') \
                 ORDER BY id LIMIT 1"
            ),
            duckdb::params![website_id],
        )?;
        if let Some(existing) = unfinished {
            tx.commit()?;
            return Ok(if existing.start_from_hit_id == start_from_hit_id {
                CreateExport::Joined(existing)
            } else {
                CreateExport::Conflict(existing)
            });
        }

        let id: i64 = tx
            .prepare("SELECT nextval('exports_id_seq')")?
            .query_row([], |row| row.get(0))?;
        let path = export_dir.join(export_file_name(website_id, id, now));
        let path = path.to_string_lossy().into_owned();
        tx.execute(
            "INSERT INTO exports (id, website_id, start_from_hit_id, path, created_at, state) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            duckdb::params![id, website_id, start_from_hit_id, path, format_ts(now)],
        )?;
        tx.commit()?;

        Ok(CreateExport::Created(Export {
            id,
            site_id: website_id.to_string(),
            start_from_hit_id,
            last_hit_id: None,
            path,
            created_at: now,
            finished_at: None,
            num_rows: None,
            size: None,
            hash: None,
            error: None,
            state: ExportState::Pending,
        }))
    }

    /// Load an export of `website_id`. Exports of other sites are not visible.
    pub async fn get_export(&self, website_id: &str, id: i64) -> Result<Option<Export>> {
        let conn = self.conn.lock().await;
        query_export(
            &conn,
            &format!("SELECT {SELECT_EXPORT_COLUMNS} FROM exports WHERE id = ?1 AND website_id = ?2"),
            duckdb::params![id, website_id],
        )
    }

    pub async fn mark_export_running(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE exports SET state = 'running' WHERE id = ?1 AND state = 'pending'",
            duckdb::params![id],
        )?;
        Ok(changed > 0)
    }

    pub async fn finish_export(
        &self,
        id: i64,
        summary: &ExportSummary,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE exports SET state = 'done', last_hit_id = ?2, num_rows = ?3, size = ?4, \
             hash = ?5, finished_at = ?6 \
             WHERE id = ?1 AND state = 'running'",
            duckdb::params![
                id,
                summary.last_hit_id,
                summary.num_rows,
                summary.size,
                summary.hash,
                format_ts(finished_at),
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("export {id} is not running"));
        }
        Ok(())
    }

    pub async fn fail_export(&self, id: i64, error: &str, finished_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE exports SET state = 'failed', error = ?2, finished_at = ?3 \
             WHERE id = ?1 AND state IN ('pending', 'running')",
            duckdb::params![id, error, format_ts(finished_at)],
        )?;
        Ok(())
    }

    /// Fail every unfinished export. Run at startup: nothing can still be
    /// working on them.
    pub async fn fail_unfinished_exports(
        &self,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE exports SET state = 'failed', error = ?1, finished_at = ?2 \
             WHERE state IN ('pending', 'running')",
            duckdb::params![error, format_ts(finished_at)],
        )?;
        Ok(changed)
    }
}
