//! Hit exports.
//!
//! An export streams a site's hits with `id > start_from_hit_id` into a
//! gzip-compressed CSV file. The first header field carries
//! [`EXPORT_VERSION`] so importers can refuse files they don't understand.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::hit::{Hit, RefScheme};
use crate::store::{ExportStore, HitStore, StoredHit};

/// Version token of the CSV layout, prefixed to the first header field.
pub const EXPORT_VERSION: &str = "1";

/// Column names, in order. The first is written as `{EXPORT_VERSION}Path`.
pub const EXPORT_COLUMNS: [&str; 12] = [
    "Path",
    "Title",
    "Event",
    "Bot",
    "Session",
    "FirstVisit",
    "Referrer",
    "Referrer scheme",
    "Browser",
    "Screen size",
    "Location",
    "Date",
];

/// Rows fetched from storage per round trip while exporting.
pub const EXPORT_PAGE_SIZE: usize = 5000;

/// Lifecycle of an export. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportState {
    Pending,
    Running,
    Done,
    Failed,
}

impl ExportState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportState::Pending => "pending",
            ExportState::Running => "running",
            ExportState::Done => "done",
            ExportState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ExportState::Pending),
            "running" => Some(ExportState::Running),
            "done" => Some(ExportState::Done),
            "failed" => Some(ExportState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Done | ExportState::Failed)
    }

    pub fn can_transition_to(self, next: ExportState) -> bool {
        matches!(
            (self, next),
            (ExportState::Pending, ExportState::Running)
                | (ExportState::Pending, ExportState::Failed)
                | (ExportState::Running, ExportState::Done)
                | (ExportState::Running, ExportState::Failed)
        )
    }
}

/// Persisted export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub id: i64,
    pub site_id: String,
    pub start_from_hit_id: i64,
    /// Resumption cursor: the last hit id written to the file.
    pub last_hit_id: Option<i64>,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub num_rows: Option<i64>,
    /// Size of the compressed file in bytes.
    pub size: Option<i64>,
    /// `sha256-<hex>` of the compressed file.
    pub hash: Option<String>,
    pub error: Option<String>,
    pub state: ExportState,
}

impl Export {
    /// File name used in `Content-Disposition` on download.
    pub fn file_name(&self) -> String {
        Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("pagetally-export-{}.csv.gz", self.id))
    }
}

/// What a finished export recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub last_hit_id: i64,
    pub num_rows: i64,
    pub size: i64,
    pub hash: String,
}

/// Build the output file name for an export.
pub fn export_file_name(website_id: &str, id: i64, created_at: DateTime<Utc>) -> String {
    format!(
        "pagetally-export-{}-{}-{}.csv.gz",
        website_id,
        created_at.format("%Y%m%dT%H%M%S"),
        id
    )
}

#[derive(Debug, Error)]
pub enum CsvFormatError {
    #[error("empty file: no CSV header")]
    MissingHeader,

    #[error("wrong version of CSV export: {found:?} (expected: {expected})")]
    WrongVersion { found: String, expected: &'static str },

    #[error("wrong number of fields: {0} (want: 12)")]
    FieldCount(usize),

    #[error("invalid {field} value: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("reading hits failed: {0}")]
    Store(anyhow::Error),
}

/// One CSV row of an export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub path: String,
    pub title: String,
    pub event: bool,
    pub bot: i32,
    /// Opaque session grouping value; empty when the hit had none.
    pub session: String,
    pub first_visit: bool,
    pub referrer: String,
    pub ref_scheme: Option<RefScheme>,
    pub browser: String,
    pub size: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl ExportRow {
    pub fn from_hit(hit: &Hit) -> Self {
        Self {
            path: hit.path.clone(),
            title: hit.title.clone(),
            event: hit.event,
            bot: hit.bot,
            session: hit.session.map(|s| s.to_string()).unwrap_or_default(),
            first_visit: hit.first_visit,
            referrer: hit.referrer.clone(),
            ref_scheme: hit.ref_scheme,
            browser: hit.browser.clone(),
            size: hit.size.clone(),
            location: hit.location.clone(),
            created_at: hit.created_at,
        }
    }

    pub fn to_record(&self) -> [String; 12] {
        [
            self.path.clone(),
            self.title.clone(),
            self.event.to_string(),
            self.bot.to_string(),
            self.session.clone(),
            self.first_visit.to_string(),
            self.referrer.clone(),
            self.ref_scheme.map(|s| s.as_str().to_string()).unwrap_or_default(),
            self.browser.clone(),
            self.size.clone(),
            self.location.clone(),
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ]
    }

    pub fn from_record(record: &csv::StringRecord) -> Result<Self, CsvFormatError> {
        if record.len() != EXPORT_COLUMNS.len() {
            return Err(CsvFormatError::FieldCount(record.len()));
        }
        let field = |i: usize| record.get(i).unwrap_or_default();

        let ref_scheme = match field(7) {
            "" => None,
            raw => Some(RefScheme::parse(raw).ok_or_else(|| CsvFormatError::InvalidField {
                field: "referrer scheme",
                value: raw.to_string(),
            })?),
        };
        let created_at = DateTime::parse_from_rfc3339(field(11))
            .map_err(|_| CsvFormatError::InvalidField {
                field: "date",
                value: field(11).to_string(),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            path: field(0).to_string(),
            title: field(1).to_string(),
            event: parse_bool("event", field(2))?,
            bot: field(3).parse().map_err(|_| CsvFormatError::InvalidField {
                field: "bot",
                value: field(3).to_string(),
            })?,
            session: field(4).to_string(),
            first_visit: parse_bool("first visit", field(5))?,
            referrer: field(6).to_string(),
            ref_scheme,
            browser: field(8).to_string(),
            size: field(9).to_string(),
            location: field(10).to_string(),
            created_at,
        })
    }
}

fn parse_bool(field: &'static str, raw: &str) -> Result<bool, CsvFormatError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(CsvFormatError::InvalidField {
            field,
            value: raw.to_string(),
        }),
    }
}

pub fn export_header() -> [String; 12] {
    let mut header = EXPORT_COLUMNS.map(str::to_string);
    header[0] = format!("{EXPORT_VERSION}{}", EXPORT_COLUMNS[0]);
    header
}

/// Reject files whose version token is not [`EXPORT_VERSION`].
pub fn check_header(header: &csv::StringRecord) -> Result<(), CsvFormatError> {
    let first = header.get(0).ok_or(CsvFormatError::MissingHeader)?;
    if first.strip_prefix(EXPORT_VERSION) == Some(EXPORT_COLUMNS[0]) {
        Ok(())
    } else {
        Err(CsvFormatError::WrongVersion {
            found: first.chars().take_while(|c| c.is_ascii_digit()).collect(),
            expected: EXPORT_VERSION,
        })
    }
}

/// Reader over an uncompressed export CSV stream.
pub struct ExportReader<R: Read> {
    inner: csv::Reader<R>,
}

impl<R: Read> ExportReader<R> {
    /// Read and check the header.
    pub fn new(reader: R) -> Result<Self, CsvFormatError> {
        let mut inner = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut header = csv::StringRecord::new();
        if !inner.read_record(&mut header)? {
            return Err(CsvFormatError::MissingHeader);
        }
        check_header(&header)?;
        Ok(Self { inner })
    }

    pub fn rows(&mut self) -> impl Iterator<Item = Result<ExportRow, CsvFormatError>> + '_ {
        self.inner
            .records()
            .map(|record| ExportRow::from_record(&record?))
    }
}

/// Passes bytes through while hashing and counting them.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes a compressed export file, hashing the compressed bytes.
pub struct ExportWriter {
    csv: csv::Writer<GzEncoder<HashingWriter<BufWriter<File>>>>,
}

impl ExportWriter {
    /// Create `path` (truncating) and write the versioned header.
    pub fn create(path: &Path) -> Result<Self, ExportError> {
        let file = File::create(path)?;
        let hashing = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
            written: 0,
        };
        let gz = GzEncoder::new(hashing, Compression::default());
        let mut csv = csv::Writer::from_writer(gz);
        csv.write_record(export_header())?;
        Ok(Self { csv })
    }

    pub fn write_hit(&mut self, hit: &Hit) -> Result<(), ExportError> {
        self.csv.write_record(ExportRow::from_hit(hit).to_record())?;
        Ok(())
    }

    /// Finish the gzip stream and sync the file.
    /// Returns `(compressed size, "sha256-<hex>")`.
    pub fn finish(self) -> Result<(u64, String), ExportError> {
        let gz = self.csv.into_inner().map_err(|e| e.into_error())?;
        let mut hashing = gz.finish()?;
        hashing.flush()?;
        let HashingWriter {
            inner,
            hasher,
            written,
        } = hashing;
        let file = inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((written, format!("sha256-{}", hex::encode(hasher.finalize()))))
    }
}

/// Run file work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ExportError>
where
    F: FnOnce() -> Result<T, ExportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ExportError::Io(io::Error::other(e)))?
}

/// Stream every hit after the export's cursor into its file.
///
/// Pages are read on the async side; all file and gzip work runs on the
/// blocking pool.
pub async fn write_export(hits: &dyn HitStore, export: &Export) -> Result<ExportSummary, ExportError> {
    let path = PathBuf::from(&export.path);
    let mut writer = blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        ExportWriter::create(&path)
    })
    .await?;

    let mut cursor = export.start_from_hit_id;
    let mut num_rows: i64 = 0;
    loop {
        let page: Vec<StoredHit> = hits
            .hits_after(&export.site_id, cursor, EXPORT_PAGE_SIZE)
            .await
            .map_err(ExportError::Store)?;
        let page_len = page.len();
        if let Some(last) = page.last() {
            cursor = last.id;
        }
        num_rows += page_len as i64;
        writer = blocking(move || {
            for stored in &page {
                writer.write_hit(&stored.hit)?;
            }
            Ok(writer)
        })
        .await?;
        if page_len < EXPORT_PAGE_SIZE {
            break;
        }
    }

    let (size, hash) = blocking(move || writer.finish()).await?;
    Ok(ExportSummary {
        last_hit_id: cursor,
        num_rows,
        size: i64::try_from(size).unwrap_or(i64::MAX),
        hash,
    })
}

/// Run one export to a terminal state.
///
/// Errors never escape: an I/O or encoding failure is recorded on the export
/// as `failed` with its message.
pub async fn run_export(
    exports: &dyn ExportStore,
    hits: &dyn HitStore,
    clock: &dyn Clock,
    export: &Export,
) -> ExportState {
    match exports.mark_export_running(export.id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(export_id = export.id, "Export is no longer pending, not running it");
            return export.state;
        }
        Err(e) => {
            error!(export_id = export.id, error = %e, "Could not mark export as running");
            record_failure(exports, clock, export.id, "export failed: could not start").await;
            return ExportState::Failed;
        }
    }

    match write_export(hits, export).await {
        Ok(summary) => match exports.finish_export(export.id, &summary, clock.now()).await {
            Ok(()) => {
                info!(
                    export_id = export.id,
                    rows = summary.num_rows,
                    size = summary.size,
                    last_hit_id = summary.last_hit_id,
                    "Export finished"
                );
                ExportState::Done
            }
            Err(e) => {
                error!(export_id = export.id, error = %e, "Could not record finished export");
                record_failure(exports, clock, export.id, "export failed: could not record result")
                    .await;
                ExportState::Failed
            }
        },
        Err(e) => {
            error!(export_id = export.id, error = %e, "Export failed");
            if let Err(rm) = tokio::fs::remove_file(&export.path).await {
                if rm.kind() != io::ErrorKind::NotFound {
                    warn!(export_id = export.id, error = %rm, "Could not remove partial export file");
                }
            }
            record_failure(exports, clock, export.id, &e.to_string()).await;
            ExportState::Failed
        }
    }
}

/// Record a `failed` state, logging if even that is impossible.
pub async fn record_failure(exports: &dyn ExportStore, clock: &dyn Clock, id: i64, message: &str) {
    if let Err(e) = exports.fail_export(id, message, clock.now()).await {
        error!(export_id = id, error = %e, "Could not record export failure");
    }
}
