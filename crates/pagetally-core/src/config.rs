use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    /// Flush cadence of the ingestion buffer.
    pub buffer_flush_interval_ms: u64,
    /// Buffer length at which the flush task is woken before its next tick.
    pub buffer_max_size: usize,
    /// Period after which the session salt rotates and the session table is reset.
    pub salt_rotation_secs: u64,
    /// Maximum number of export tasks running at the same time.
    pub export_concurrency: usize,
    pub shutdown_timeout_secs: u64,
    pub duckdb_memory_limit: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let salt_rotation_secs: u64 = std::env::var("PAGETALLY_SALT_ROTATION_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .map_err(|e| format!("invalid salt rotation period: {e}"))?;
        if salt_rotation_secs == 0 {
            return Err("PAGETALLY_SALT_ROTATION_SECS must be greater than zero".to_string());
        }

        Ok(Self {
            port: std::env::var("PAGETALLY_PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("PAGETALLY_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            buffer_flush_interval_ms: std::env::var("PAGETALLY_FLUSH_INTERVAL_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .map_err(|e| format!("invalid flush interval: {e}"))?,
            buffer_max_size: std::env::var("PAGETALLY_BUFFER_MAX_SIZE")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10_000),
            salt_rotation_secs,
            export_concurrency: std::env::var("PAGETALLY_EXPORT_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<usize>()
                .map(|n| n.max(1))
                .unwrap_or(2),
            shutdown_timeout_secs: std::env::var("PAGETALLY_SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            duckdb_memory_limit: std::env::var("PAGETALLY_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
        })
    }

    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms.max(1))
    }

    pub fn salt_rotation(&self) -> Duration {
        Duration::from_secs(self.salt_rotation_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("pagetally.db")
    }

    /// Directory that receives compressed export files.
    pub fn export_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("exports")
    }
}
