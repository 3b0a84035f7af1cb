use anyhow::Result;

use pagetally_core::hit::{Hit, RefScheme};
use pagetally_core::store::StoredHit;

use crate::schema::{format_ts, ts_column};
use crate::DuckDbBackend;

const INSERT_HIT_SQL: &str = r#"INSERT INTO hits (
        website_id, path, title, event, referrer, ref_scheme,
        size, query, bot, browser, location, session, first_visit,
        created_at
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6,
        ?7, ?8, ?9, ?10, ?11, ?12, ?13,
        ?14
    ) RETURNING id"#;

const SELECT_HIT_COLUMNS: &str = "id, website_id, path, title, event, referrer, ref_scheme, \
     size, query, bot, browser, location, session, first_visit, CAST(created_at AS VARCHAR)";

fn row_to_stored(row: &duckdb::Row<'_>) -> duckdb::Result<StoredHit> {
    let ref_scheme: Option<String> = row.get(6)?;
    Ok(StoredHit {
        id: row.get(0)?,
        hit: Hit {
            website_id: row.get(1)?,
            path: row.get(2)?,
            title: row.get(3)?,
            event: row.get(4)?,
            referrer: row.get(5)?,
            ref_scheme: ref_scheme.as_deref().and_then(RefScheme::parse),
            size: row.get(7)?,
            query: row.get(8)?,
            bot: row.get(9)?,
            browser: row.get(10)?,
            location: row.get(11)?,
            session: row.get(12)?,
            first_visit: row.get(13)?,
            created_at: ts_column(row, 14)?,
        },
    })
}

impl DuckDbBackend {
    /// Insert a batch of hits in a single transaction.
    ///
    /// Returns the assigned ids in input order. Either every row is
    /// committed or, on error, none is.
    pub async fn insert_hits(&self, hits: &[Hit]) -> Result<Vec<i64>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(hits.len());
        {
            let mut stmt = tx.prepare(INSERT_HIT_SQL)?;
            for hit in hits {
                let id: i64 = stmt.query_row(
                    duckdb::params![
                        hit.website_id,
                        hit.path,
                        hit.title,
                        hit.event,
                        hit.referrer,
                        hit.ref_scheme.map(RefScheme::as_str),
                        hit.size,
                        hit.query,
                        hit.bot,
                        hit.browser,
                        hit.location,
                        hit.session,
                        hit.first_visit,
                        format_ts(hit.created_at),
                    ],
                    |row| row.get(0),
                )?;
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Hits of `website_id` with `id > after_id`, ascending by id.
    pub async fn hits_after(
        &self,
        website_id: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredHit>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {SELECT_HIT_COLUMNS} FROM hits \
             WHERE website_id = ?1 AND id > ?2 ORDER BY id LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(duckdb::params![website_id, after_id, limit], row_to_stored)?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(hits)
    }

    /// Highest stored session number, or 0.
    pub async fn max_session(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let max: i64 = conn
            .prepare("SELECT COALESCE(MAX(session), 0) FROM hits")?
            .query_row([], |row| row.get(0))?;
        Ok(max)
    }

    pub async fn count_hits(&self, website_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .prepare("SELECT COUNT(*) FROM hits WHERE website_id = ?1")?
            .query_row(duckdb::params![website_id], |row| row.get(0))?;
        Ok(count)
    }

    /// Delete every hit and stats row of a site. Returns the number of hits removed.
    pub async fn delete_site_hits(&self, website_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM hits WHERE website_id = ?1",
            duckdb::params![website_id],
        )?;
        tx.execute(
            "DELETE FROM hit_stats WHERE website_id = ?1",
            duckdb::params![website_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
