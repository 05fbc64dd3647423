//! Append-only, de-duplicating report sinks + retry policy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use drr_core::NormalizedRow;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span};

pub const CRATE_NAME: &str = "drr-storage";

/// Trailing column every sink persists so `read_fingerprints` is a plain
/// column scan on any backend.
pub const FINGERPRINT_COLUMN: &str = "Fingerprint";

/// Full header schema for a report: display columns plus the fingerprint.
pub fn sheet_header(display_columns: &[&str]) -> Vec<String> {
    let mut header: Vec<String> = display_columns.iter().map(|c| c.to_string()).collect();
    header.push(FINGERPRINT_COLUMN.to_string());
    header
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff shared by every external collaborator.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("header mismatch: expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("sink i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("sink http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("sink response could not be decoded: {0}")]
    Decode(String),
    #[error("appended {appended} of {attempted} rows before failure: {message}")]
    PartialAppend {
        appended: usize,
        attempted: usize,
        message: String,
    },
}

impl SinkError {
    /// Header and decode problems are fatal; everything else may be retried —
    /// the fingerprint check makes a repeated `append_new` idempotent.
    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            SinkError::HeaderMismatch { .. } | SinkError::Decode(_) => {
                RetryDisposition::NonRetryable
            }
            SinkError::Io(_) | SinkError::PartialAppend { .. } => RetryDisposition::Retryable,
            SinkError::Request(err) => classify_reqwest_error(err),
            SinkError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    pub appended: usize,
    pub skipped: usize,
}

/// Append-only persistent report log.
///
/// `append_new` is the correctness boundary of the whole system: calling it
/// twice with the same input appends zero rows the second time, which is what
/// makes retried and overlapping runs safe without any cross-run locking.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Expected header schema, display columns plus [`FINGERPRINT_COLUMN`].
    fn header(&self) -> &[String];

    /// Write the header if the store is empty; verify it otherwise.
    async fn ensure_header(&self) -> Result<(), SinkError>;

    /// Every fingerprint already present in the store.
    async fn read_fingerprints(&self) -> Result<HashSet<String>, SinkError>;

    /// Unconditionally append rows at the end of the store, returning how
    /// many were durably written.
    async fn append_rows(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError>;

    /// Append only rows whose fingerprint is absent from the store (and not
    /// repeated earlier in the same batch).
    async fn append_new(&self, rows: &[NormalizedRow]) -> Result<AppendOutcome, SinkError> {
        let seen = self.read_fingerprints().await?;
        let mut batch_seen: HashSet<&str> = HashSet::new();
        let mut fresh: Vec<NormalizedRow> = Vec::with_capacity(rows.len());
        for row in rows {
            if seen.contains(&row.fingerprint) || !batch_seen.insert(&row.fingerprint) {
                continue;
            }
            fresh.push(row.clone());
        }
        let skipped = rows.len() - fresh.len();
        if fresh.is_empty() {
            return Ok(AppendOutcome {
                appended: 0,
                skipped,
            });
        }
        let appended = self.append_rows(&fresh).await?;
        Ok(AppendOutcome { appended, skipped })
    }
}

// ---------------------------------------------------------------------------
// In-memory sink

/// Sink kept entirely in memory. Used for tests and dry runs.
#[derive(Debug)]
pub struct MemorySink {
    header: Vec<String>,
    state: Mutex<MemorySinkState>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    header_written: bool,
    rows: Vec<NormalizedRow>,
}

impl MemorySink {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            state: Mutex::new(MemorySinkState::default()),
        }
    }

    pub async fn rows(&self) -> Vec<NormalizedRow> {
        self.state.lock().await.rows.clone()
    }

    pub async fn header_written(&self) -> bool {
        self.state.lock().await.header_written
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn header(&self) -> &[String] {
        &self.header
    }

    async fn ensure_header(&self) -> Result<(), SinkError> {
        self.state.lock().await.header_written = true;
        Ok(())
    }

    async fn read_fingerprints(&self) -> Result<HashSet<String>, SinkError> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect())
    }

    async fn append_rows(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError> {
        let mut state = self.state.lock().await;
        state.rows.extend(rows.iter().cloned());
        Ok(rows.len())
    }
}

// ---------------------------------------------------------------------------
// CSV file sink

/// Append-only CSV log on the local filesystem. One file per report; the
/// first line is the header, the last column the fingerprint.
#[derive(Debug, Clone)]
pub struct CsvFileSink {
    path: PathBuf,
    header: Vec<String>,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        Self {
            path: path.into(),
            header,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<String>, SinkError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Sink for CsvFileSink {
    fn header(&self) -> &[String] {
        &self.header
    }

    async fn ensure_header(&self) -> Result<(), SinkError> {
        let lines = self.read_lines().await?;
        match lines.first() {
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let mut line = csv_join(&self.header);
                line.push('\n');
                fs::write(&self.path, line).await?;
                debug!(path = %self.path.display(), "wrote sink header");
                Ok(())
            }
            Some(first) => {
                let found = csv_split(first);
                if found == self.header {
                    Ok(())
                } else {
                    Err(SinkError::HeaderMismatch {
                        expected: self.header.clone(),
                        found,
                    })
                }
            }
        }
    }

    async fn read_fingerprints(&self) -> Result<HashSet<String>, SinkError> {
        let lines = self.read_lines().await?;
        Ok(lines
            .iter()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| csv_split(line).pop())
            .collect())
    }

    async fn append_rows(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut appended = 0usize;
        for row in rows {
            let mut fields = row.values.clone();
            fields.push(row.fingerprint.clone());
            let mut line = csv_join(&fields);
            line.push('\n');

            let write = async {
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            };
            if let Err(err) = write.await {
                return Err(SinkError::PartialAppend {
                    appended,
                    attempted: rows.len(),
                    message: err.to_string(),
                });
            }
            appended += 1;
        }
        Ok(appended)
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_join(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_split(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

// ---------------------------------------------------------------------------
// REST spreadsheet sink

/// Connection parameters for a values-style spreadsheet API
/// (`GET .../values/{range}`, `POST .../values/{range}:append`).
#[derive(Debug, Clone)]
pub struct RestSheetConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    /// Opaque credential; never logged, never echoed into errors.
    pub bearer_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Sink backed by a remote spreadsheet over its values REST API.
#[derive(Debug)]
pub struct RestSheetSink {
    config: RestSheetConfig,
    client: reqwest::Client,
    header: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl RestSheetSink {
    pub fn new(config: RestSheetConfig, header: Vec<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            header,
        })
    }

    fn values_url(&self, range: &str, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.spreadsheet_id,
            range,
            suffix
        )
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SinkError> {
        let span = info_span!("sheet_request", spreadsheet_id = %self.config.spreadsheet_id);
        let _guard = span.enter();

        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let result = build()
                .bearer_auth(&self.config.bearer_token)
                .send()
                .await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SinkError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }

        Err(SinkError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }

    async fn fetch_values(&self, range: &str) -> Result<Vec<Vec<String>>, SinkError> {
        let url = self.values_url(range, "");
        let resp = self.send_with_retry(|| self.client.get(&url)).await?;
        let body: ValueRange = resp
            .json()
            .await
            .map_err(|err| SinkError::Decode(err.to_string()))?;
        Ok(body.values)
    }
}

#[async_trait]
impl Sink for RestSheetSink {
    fn header(&self) -> &[String] {
        &self.header
    }

    async fn ensure_header(&self) -> Result<(), SinkError> {
        let range = format!("{}!1:1", self.config.sheet_name);
        let rows = self.fetch_values(&range).await?;
        match rows.into_iter().next() {
            None => {
                let url = self.values_url(
                    &self.config.sheet_name,
                    ":append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
                );
                let body = serde_json::json!({ "values": [self.header] });
                self.send_with_retry(|| self.client.post(&url).json(&body))
                    .await?;
                Ok(())
            }
            Some(found) => {
                if found == self.header {
                    Ok(())
                } else {
                    Err(SinkError::HeaderMismatch {
                        expected: self.header.clone(),
                        found,
                    })
                }
            }
        }
    }

    async fn read_fingerprints(&self) -> Result<HashSet<String>, SinkError> {
        let rows = self.fetch_values(&self.config.sheet_name).await?;
        Ok(rows
            .into_iter()
            .skip(1)
            .filter_map(|mut row| row.pop())
            .collect())
    }

    async fn append_rows(&self, rows: &[NormalizedRow]) -> Result<usize, SinkError> {
        let values: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut fields = row.values.clone();
                fields.push(row.fingerprint.clone());
                fields
            })
            .collect();
        let url = self.values_url(
            &self.config.sheet_name,
            ":append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
        );
        let body = serde_json::json!({ "values": values });
        self.send_with_retry(|| self.client.post(&url).json(&body))
            .await?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(values: &[&str], fingerprint: &str) -> NormalizedRow {
        NormalizedRow {
            values: values.iter().map(|v| v.to_string()).collect(),
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn backoff_starts_at_base_and_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(3));
    }

    #[test]
    fn csv_escaping_round_trips_awkward_fields() {
        let fields = vec![
            "plain".to_string(),
            "with,comma".to_string(),
            "with \"quotes\"".to_string(),
            String::new(),
        ];
        assert_eq!(csv_split(&csv_join(&fields)), fields);
    }

    #[tokio::test]
    async fn memory_sink_append_new_is_idempotent() {
        let sink = MemorySink::new(sheet_header(&["Date", "Username"]));
        sink.ensure_header().await.unwrap();
        let rows = vec![row(&["2024-01-14", "alice"], "fp-a"), row(&["2024-01-14", "bob"], "fp-b")];

        let first = sink.append_new(&rows).await.unwrap();
        assert_eq!(first, AppendOutcome { appended: 2, skipped: 0 });

        let second = sink.append_new(&rows).await.unwrap();
        assert_eq!(second, AppendOutcome { appended: 0, skipped: 2 });
        assert_eq!(sink.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn batch_internal_duplicates_are_skipped() {
        let sink = MemorySink::new(sheet_header(&["Date", "Username"]));
        let rows = vec![
            row(&["2024-01-14", "alice"], "fp-a"),
            row(&["2024-01-14", "alice"], "fp-a"),
        ];
        let outcome = sink.append_new(&rows).await.unwrap();
        assert_eq!(outcome, AppendOutcome { appended: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn sink_never_accumulates_duplicate_fingerprints() {
        let sink = MemorySink::new(sheet_header(&["Date", "Username"]));
        let monday = vec![row(&["2024-01-14", "alice"], "fp-a")];
        let overlap = vec![
            row(&["2024-01-14", "alice"], "fp-a"),
            row(&["2024-01-15", "carol"], "fp-c"),
        ];
        sink.append_new(&monday).await.unwrap();
        sink.append_new(&overlap).await.unwrap();
        sink.append_new(&overlap).await.unwrap();

        let fingerprints: Vec<String> = sink
            .rows()
            .await
            .into_iter()
            .map(|r| r.fingerprint)
            .collect();
        let unique: HashSet<&String> = fingerprints.iter().collect();
        assert_eq!(fingerprints.len(), unique.len());
        assert_eq!(fingerprints.len(), 2);
    }

    #[tokio::test]
    async fn csv_sink_creates_header_once_and_verifies_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("new-users.csv");
        let header = sheet_header(&["Date", "Username"]);

        let sink = CsvFileSink::new(&path, header.clone());
        sink.ensure_header().await.unwrap();
        sink.ensure_header().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Date,Username,Fingerprint\n");
    }

    #[tokio::test]
    async fn csv_sink_rejects_a_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "Completely,Different,Columns\n").unwrap();

        let sink = CsvFileSink::new(&path, sheet_header(&["Date", "Username"]));
        let err = sink.ensure_header().await.unwrap_err();
        assert!(matches!(err, SinkError::HeaderMismatch { .. }));
        assert_eq!(err.retry_disposition(), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn csv_sink_deduplicates_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let header = sheet_header(&["Date", "Username"]);
        let rows = vec![
            row(&["2024-01-14", "alice"], "fp-a"),
            row(&["2024-01-14", "b,ob \"jr\""], "fp-b"),
        ];

        let first_run = CsvFileSink::new(&path, header.clone());
        first_run.ensure_header().await.unwrap();
        let outcome = first_run.append_new(&rows).await.unwrap();
        assert_eq!(outcome, AppendOutcome { appended: 2, skipped: 0 });

        // A fresh instance simulates the next scheduled run re-reading state.
        let second_run = CsvFileSink::new(&path, header);
        second_run.ensure_header().await.unwrap();
        let outcome = second_run.append_new(&rows).await.unwrap();
        assert_eq!(outcome, AppendOutcome { appended: 0, skipped: 2 });

        let fingerprints = second_run.read_fingerprints().await.unwrap();
        assert_eq!(
            fingerprints,
            HashSet::from(["fp-a".to_string(), "fp-b".to_string()])
        );
    }

    #[tokio::test]
    async fn empty_append_does_not_touch_the_store() {
        let sink = MemorySink::new(sheet_header(&["Date", "Username"]));
        sink.ensure_header().await.unwrap();
        let outcome = sink.append_new(&[]).await.unwrap();
        assert_eq!(outcome, AppendOutcome::default());
        assert!(sink.rows().await.is_empty());
        assert!(sink.header_written().await);
    }
}
