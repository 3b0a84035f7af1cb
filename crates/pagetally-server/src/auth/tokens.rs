use sha2::{Digest, Sha256};

use pagetally_duckdb::auth::{ApiTokenRecord, CreateTokenParams};
use pagetally_duckdb::DuckDbBackend;

/// Length of the displayed prefix of a raw token.
const PREFIX_LEN: usize = 12;

/// Generate a new API token.
///
/// Returns (raw_token, hash, prefix).
/// Raw token format: `ptk_` + 32 random hex chars.
pub fn generate_token() -> (String, String, String) {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);

    let raw = format!("ptk_{}", hex::encode(buf));
    let hash = hash_token(&raw);
    let prefix = raw[..PREFIX_LEN].to_string();
    (raw, hash, prefix)
}

/// Hash a raw token with SHA-256.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Create and store a token for `website_id`. The raw value is returned
/// once and cannot be recovered later.
pub async fn issue_token(
    db: &DuckDbBackend,
    website_id: &str,
    name: &str,
    count: bool,
    export: bool,
) -> anyhow::Result<(String, ApiTokenRecord)> {
    let (raw, hash, prefix) = generate_token();
    let record = db
        .create_api_token(CreateTokenParams {
            website_id,
            name,
            token_hash: &hash,
            prefix: &prefix,
            perm_count: count,
            perm_export: export,
        })
        .await?;
    Ok((raw, record))
}
