use anyhow::Result;
use serde::Serialize;

use crate::backend::generate_id;
use crate::DuckDbBackend;

/// Stored API token. The raw token is never persisted; only its hash.
#[derive(Debug, Clone, Serialize)]
pub struct ApiTokenRecord {
    pub id: String,
    pub website_id: String,
    pub name: String,
    pub prefix: String,
    pub perm_count: bool,
    pub perm_export: bool,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

pub struct CreateTokenParams<'a> {
    pub website_id: &'a str,
    pub name: &'a str,
    pub token_hash: &'a str,
    pub prefix: &'a str,
    pub perm_count: bool,
    pub perm_export: bool,
}

const SELECT_TOKEN_COLUMNS: &str = "id, website_id, name, prefix, perm_count, perm_export, \
     CAST(created_at AS VARCHAR), CAST(last_used_at AS VARCHAR)";

fn row_to_token(row: &duckdb::Row<'_>) -> duckdb::Result<ApiTokenRecord> {
    Ok(ApiTokenRecord {
        id: row.get(0)?,
        website_id: row.get(1)?,
        name: row.get(2)?,
        prefix: row.get(3)?,
        perm_count: row.get(4)?,
        perm_export: row.get(5)?,
        created_at: row.get(6)?,
        last_used_at: row.get(7)?,
    })
}

impl DuckDbBackend {
    pub async fn create_api_token(&self, params: CreateTokenParams<'_>) -> Result<ApiTokenRecord> {
        let conn = self.conn.lock().await;
        let id = generate_id("tok");
        conn.execute(
            "INSERT INTO api_tokens \
             (id, website_id, name, token_hash, prefix, perm_count, perm_export, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)",
            duckdb::params![
                id,
                params.website_id,
                params.name,
                params.token_hash,
                params.prefix,
                params.perm_count,
                params.perm_export,
            ],
        )?;

        let record = conn
            .prepare(&format!("SELECT {SELECT_TOKEN_COLUMNS} FROM api_tokens WHERE id = ?1"))?
            .query_row(duckdb::params![id], row_to_token)?;
        Ok(record)
    }

    /// Look up a token by the SHA-256 of its raw value.
    pub async fn lookup_api_token(&self, token_hash: &str) -> Result<Option<ApiTokenRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_TOKEN_COLUMNS} FROM api_tokens WHERE token_hash = ?1"
        ))?;
        let mut rows = stmt.query(duckdb::params![token_hash])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_token(row)?)),
            None => Ok(None),
        }
    }

    pub async fn touch_api_token(&self, token_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE api_tokens SET last_used_at = CURRENT_TIMESTAMP WHERE id = ?1",
            duckdb::params![token_id],
        )?;
        Ok(())
    }

    pub async fn delete_api_token(&self, token_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "DELETE FROM api_tokens WHERE id = ?1",
            duckdb::params![token_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_is_found_by_hash_only() {
        let db = DuckDbBackend::open_in_memory().expect("db");
        let record = db
            .create_api_token(CreateTokenParams {
                website_id: "site_a",
                name: "ci",
                token_hash: "deadbeef",
                prefix: "ptk_0123abcd",
                perm_count: true,
                perm_export: false,
            })
            .await
            .expect("create");
        assert!(record.id.starts_with("tok_"));
        assert!(record.last_used_at.is_none());

        let found = db
            .lookup_api_token("deadbeef")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(found.id, record.id);
        assert!(found.perm_count);
        assert!(!found.perm_export);
        assert!(db.lookup_api_token("cafebabe").await.expect("lookup").is_none());

        db.touch_api_token(&record.id).await.expect("touch");
        let touched = db.lookup_api_token("deadbeef").await.expect("lookup").expect("exists");
        assert!(touched.last_used_at.is_some());

        assert!(db.delete_api_token(&record.id).await.expect("delete"));
        assert!(db.lookup_api_token("deadbeef").await.expect("lookup").is_none());
    }
}
