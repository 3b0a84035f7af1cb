/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup.
///
/// `memory_limit` comes from `Config.duckdb_memory_limit`
/// (env `PAGETALLY_DUCKDB_MEMORY`, default `"1GB"`). Always set an explicit
/// limit; the DuckDB default of 80% of system RAM is not acceptable for a
/// server process.
///
/// Ids of `hits` and `exports` come from sequences. The flush writes a whole
/// batch in one transaction, so hits of one flush receive ascending ids in
/// buffer order; exports rely on that ordering for resumption.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- WEBSITES
-- ===========================================
CREATE TABLE IF NOT EXISTS websites (
    id              VARCHAR PRIMARY KEY,           -- 'site_' + 10 random chars
    name            VARCHAR NOT NULL,
    domain          VARCHAR NOT NULL,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ===========================================
-- API TOKENS
-- Raw tokens ('ptk_' + 32 hex) are shown once and never stored.
-- ===========================================
CREATE TABLE IF NOT EXISTS api_tokens (
    id              VARCHAR PRIMARY KEY,           -- 'tok_' + 10 random chars
    website_id      VARCHAR NOT NULL,
    name            VARCHAR NOT NULL,
    token_hash      VARCHAR(64) NOT NULL UNIQUE,   -- sha256(raw_token)
    prefix          VARCHAR(12) NOT NULL,          -- first 12 chars, for display
    perm_count      BOOLEAN NOT NULL DEFAULT false,
    perm_export     BOOLEAN NOT NULL DEFAULT false,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_used_at    TIMESTAMP                      -- NULL until first use
);
CREATE INDEX IF NOT EXISTS idx_api_tokens_hash ON api_tokens(token_hash);

-- ===========================================
-- HITS
-- `session` is an opaque process-allocated number. Neither the client
-- session token nor the IP is ever stored.
-- ===========================================
CREATE SEQUENCE IF NOT EXISTS hits_id_seq START 1;
CREATE TABLE IF NOT EXISTS hits (
    id              BIGINT NOT NULL DEFAULT nextval('hits_id_seq'),
    website_id      VARCHAR NOT NULL,
    path            VARCHAR NOT NULL,
    title           VARCHAR NOT NULL DEFAULT '',
    event           BOOLEAN NOT NULL DEFAULT false,
    referrer        VARCHAR NOT NULL DEFAULT '',
    ref_scheme      VARCHAR(1),                    -- 'h' | 'o' | 'g' | 'c' | NULL
    size            VARCHAR NOT NULL DEFAULT '',   -- 'w,h,scale'
    query           VARCHAR NOT NULL DEFAULT '',
    bot             INTEGER NOT NULL DEFAULT 0,
    browser         VARCHAR NOT NULL DEFAULT '',
    location        VARCHAR NOT NULL DEFAULT '',
    session         BIGINT,
    first_visit     BOOLEAN NOT NULL DEFAULT false,
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hits_website_id ON hits(website_id, id);

-- ===========================================
-- HIT STATS (hourly rollup, updated after each flush)
-- ===========================================
CREATE TABLE IF NOT EXISTS hit_stats (
    website_id      VARCHAR NOT NULL,
    path            VARCHAR NOT NULL,
    event           BOOLEAN NOT NULL,
    hour            TIMESTAMP NOT NULL,
    total           BIGINT NOT NULL DEFAULT 0,
    uniq            BIGINT NOT NULL DEFAULT 0,     -- first visits
    PRIMARY KEY (website_id, path, event, hour)
);

-- ===========================================
-- EXPORTS
-- state: 'pending' -> 'running' -> 'done' | 'failed'
-- ===========================================
CREATE SEQUENCE IF NOT EXISTS exports_id_seq START 1;
CREATE TABLE IF NOT EXISTS exports (
    id                  BIGINT PRIMARY KEY,
    website_id          VARCHAR NOT NULL,
    start_from_hit_id   BIGINT NOT NULL,
    last_hit_id         BIGINT,
    path                VARCHAR NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    num_rows            BIGINT,
    size                BIGINT,
    hash                VARCHAR,                   -- 'sha256-' + hex
    error               VARCHAR,
    state               VARCHAR NOT NULL DEFAULT 'pending'
);
"#
    )
}

/// Timestamp layout used for every `TIMESTAMP` parameter. Values are UTC.
pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse the output of `CAST(<timestamp> AS VARCHAR)`.
pub(crate) fn parse_ts(raw: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| anyhow::anyhow!("invalid timestamp {raw:?}: {e}"))?;
    Ok(naive.and_utc())
}

/// Read a `CAST(... AS VARCHAR)` timestamp column inside a row mapper.
pub(crate) fn ts_column(
    row: &duckdb::Row<'_>,
    idx: usize,
) -> duckdb::Result<chrono::DateTime<chrono::Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, e.into())
    })
}

/// Nullable variant of [`ts_column`].
pub(crate) fn opt_ts_column(
    row: &duckdb::Row<'_>,
    idx: usize,
) -> duckdb::Result<Option<chrono::DateTime<chrono::Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_ts(&raw).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, e.into())
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_round_trip_through_varchar_form() {
        let ts = chrono::Utc
            .with_ymd_and_hms(2020, 1, 18, 14, 42, 0)
            .single()
            .expect("valid date");
        assert_eq!(format_ts(ts), "2020-01-18 14:42:00");
        assert_eq!(parse_ts("2020-01-18 14:42:00").expect("parse"), ts);
        assert_eq!(parse_ts("2020-01-18 14:42:00.000").expect("parse"), ts);
    }
}
