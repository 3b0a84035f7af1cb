use anyhow::Result;
use serde::Serialize;

use crate::backend::generate_id;
use crate::DuckDbBackend;

#[derive(Debug, Clone, Serialize)]
pub struct Website {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub created_at: String,
}

impl DuckDbBackend {
    pub async fn create_website(&self, name: &str, domain: &str) -> Result<Website> {
        let conn = self.conn.lock().await;
        let id = generate_id("site");
        conn.execute(
            "INSERT INTO websites (id, name, domain, created_at) \
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)",
            duckdb::params![id, name, domain],
        )?;

        let website = conn
            .prepare(
                "SELECT id, name, domain, CAST(created_at AS VARCHAR) FROM websites WHERE id = ?1",
            )?
            .query_row(duckdb::params![id], |row| {
                Ok(Website {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    domain: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
        Ok(website)
    }

    /// Insert or update a website with a fixed id.
    ///
    /// Used by test fixtures and to seed the default site on first start.
    pub async fn seed_website(&self, id: &str, domain: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO websites (id, name, domain, created_at)
               VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
               ON CONFLICT (id) DO UPDATE SET domain = EXCLUDED.domain"#,
            duckdb::params![id, domain, domain],
        )?;
        Ok(())
    }

    pub async fn website_exists(&self, website_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .prepare("SELECT COUNT(*) FROM websites WHERE id = ?1")?
            .query_row(duckdb::params![website_id], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Id of the oldest website, if any.
    pub async fn first_website_id(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM websites ORDER BY created_at, id LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_website_exists() {
        let db = DuckDbBackend::open_in_memory().expect("db");
        let site = db.create_website("Blog", "blog.example.com").await.expect("create");
        assert!(site.id.starts_with("site_"));
        assert_eq!(site.id.len(), "site_".len() + 10);
        assert!(db.website_exists(&site.id).await.expect("exists"));
        assert!(!db.website_exists("site_missing").await.expect("exists"));
        assert_eq!(db.first_website_id().await.expect("first"), Some(site.id));
    }

    #[tokio::test]
    async fn seeding_twice_is_harmless() {
        let db = DuckDbBackend::open_in_memory().expect("db");
        db.seed_website("site_1", "a.example.com").await.expect("seed");
        db.seed_website("site_1", "b.example.com").await.expect("seed");
        assert!(db.website_exists("site_1").await.expect("exists"));
    }
}
