//! Load a CSV export back into the store.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::{info, warn};

use pagetally_core::export::{ExportReader, ExportRow};
use pagetally_core::hit::Hit;
use pagetally_core::session::SessionSource;

use crate::state::AppState;

/// Rows appended between two flushes.
pub const IMPORT_FLUSH_EVERY: usize = 5000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows read from the file.
    pub read: usize,
    /// Rows the memstore refused.
    pub rejected: usize,
    /// Rows written to DuckDB, after merging duplicates.
    pub persisted: usize,
}

/// Open an export for reading. `-` is stdin; a `.gz` suffix is decompressed.
pub fn open_input(path: &str) -> anyhow::Result<Box<dyn Read + Send>> {
    let raw: Box<dyn Read + Send> = if path == "-" {
        Box::new(io::stdin())
    } else {
        let file = File::open(path).with_context(|| format!("opening {path}"))?;
        Box::new(BufReader::new(file))
    };
    let gzipped = path != "-"
        && Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    if gzipped {
        Ok(Box::new(GzDecoder::new(raw)))
    } else {
        Ok(raw)
    }
}

/// Rebuild a hit from an exported row.
///
/// The stored referrer and its scheme are kept as they are; re-deriving
/// would mangle referrers that were already stripped of their scheme.
pub fn hit_from_row(website_id: &str, row: &ExportRow) -> Hit {
    let mut hit = Hit {
        website_id: website_id.to_string(),
        path: row.path.clone(),
        title: row.title.clone(),
        event: row.event,
        referrer: row.referrer.clone(),
        ref_scheme: row.ref_scheme,
        size: row.size.clone(),
        query: String::new(),
        bot: row.bot,
        browser: row.browser.clone(),
        location: row.location.clone(),
        created_at: row.created_at,
        session: None,
        first_visit: false,
    };
    hit.defaults();
    hit
}

/// Append every row of `input` to the buffer of `website_id`, flushing every
/// [`IMPORT_FLUSH_EVERY`] rows and once at the end.
///
/// The exported session number is reused as a session token so rows that
/// shared a session keep sharing one.
pub async fn import_export<R: Read>(
    state: &AppState,
    website_id: &str,
    input: R,
) -> anyhow::Result<ImportSummary> {
    let mut reader = ExportReader::new(input).context("reading export header")?;
    let mut summary = ImportSummary::default();

    for (line, row) in reader.rows().enumerate() {
        // Line 1 is the header.
        let row = row.with_context(|| format!("line {}", line + 2))?;
        summary.read += 1;

        let source = if row.session.is_empty() {
            SessionSource::Unsessioned
        } else {
            SessionSource::Token(row.session.clone())
        };
        if let Err(e) = state
            .memstore
            .append(hit_from_row(website_id, &row), source)
            .await
        {
            warn!(line = line + 2, error = %e, "Skipping row");
            summary.rejected += 1;
        }

        if summary.read % IMPORT_FLUSH_EVERY == 0 {
            summary.persisted += flush(state).await?;
            info!(persisted = summary.persisted, "persisted {} hits", summary.persisted);
        }
    }

    summary.persisted += flush(state).await?;
    info!(
        read = summary.read,
        rejected = summary.rejected,
        "persisted {} hits",
        summary.persisted
    );
    Ok(summary)
}

async fn flush(state: &AppState) -> anyhow::Result<usize> {
    let outcome = state.flush_buffer().await;
    if outcome.requeued > 0 {
        anyhow::bail!("writing {} imported hits failed", outcome.requeued);
    }
    Ok(outcome.persisted)
}
