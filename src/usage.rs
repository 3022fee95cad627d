use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::health::AbortOnDrop;
use crate::observability::Observability;
use crate::store::SqliteStore;
use crate::types::{UsageRecord, UsageStatus};

const MONTH_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]");
const SPOOL_FILE: &str = "usage.spool";
const DLQ_FILE: &str = "usage.dlq";
const DRAIN_BASE_BACKOFF_SECS: u64 = 1;
const DRAIN_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_SPOOL_MAX_ENTRIES: usize = 10_000;

/// Writes one terminal usage record per request into the month partition and
/// maintains the user's cumulative cost.
///
/// Writes are best-effort durable: when the store is unavailable the record
/// goes to a bounded JSONL spool on disk, and a background drainer retries
/// with exponential backoff. Records the spool cannot hold land in the DLQ
/// file; the client already has its response, so nothing upstream blocks.
#[derive(Clone)]
pub struct UsageRecorder {
    store: SqliteStore,
    observability: Arc<Observability>,
    spool: Spool,
}

impl UsageRecorder {
    pub fn new(store: SqliteStore, observability: Arc<Observability>, spool_dir: PathBuf) -> Self {
        Self {
            store,
            observability,
            spool: Spool {
                dir: spool_dir,
                max_entries: DEFAULT_SPOOL_MAX_ENTRIES,
            },
        }
    }

    pub async fn record(&self, record: UsageRecord) {
        match record.status {
            UsageStatus::Completed => self.observability.record_completed(),
            UsageStatus::Failed => self.observability.record_failed(),
            UsageStatus::Cancelled => self.observability.record_cancelled(),
            UsageStatus::Pending => {}
        }

        if record.status == UsageStatus::Completed && record.cost_jpy_micros > 0 {
            if let Err(err) = self
                .store
                .add_user_cost(&record.user_oid, record.cost_jpy_micros)
                .await
            {
                tracing::warn!(error = %err, user_oid = %record.user_oid, "user cost update failed");
            }
        }

        let month = month_of_ms(record.created_at_ms);
        if let Err(err) = self.store.insert_usage_record(&month, &record).await {
            tracing::warn!(
                error = %err,
                request_id = %record.request_id,
                "usage record insert failed, spooling"
            );
            self.observability.record_spooled();
            if let Err(err) = self.spool.append(&record) {
                tracing::error!(error = %err, request_id = %record.request_id, "usage spool write failed");
            }
        }
    }

    /// Background task that drains the spool back into the store.
    pub fn spawn_drainer(self) -> AbortOnDrop {
        let handle = tokio::spawn(async move {
            let mut backoff_secs = DRAIN_BASE_BACKOFF_SECS;
            loop {
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                match self.drain_once().await {
                    DrainOutcome::Clean => backoff_secs = DRAIN_BASE_BACKOFF_SECS,
                    DrainOutcome::Stalled => {
                        backoff_secs = (backoff_secs * 2).min(DRAIN_MAX_BACKOFF_SECS);
                    }
                }
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }

    /// One drain pass. Unparseable lines go to the DLQ; insert failures keep
    /// the remaining lines queued for the next pass.
    pub async fn drain_once(&self) -> DrainOutcome {
        let lines = match self.spool.read_lines() {
            Ok(lines) => lines,
            Err(err) => {
                tracing::warn!(error = %err, "spool read failed");
                return DrainOutcome::Stalled;
            }
        };
        if lines.is_empty() {
            return DrainOutcome::Clean;
        }

        let mut remaining: Vec<String> = Vec::new();
        let mut stalled = false;
        for line in &lines {
            if stalled {
                remaining.push(line.clone());
                continue;
            }
            let record: UsageRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) => {
                    tracing::error!(error = %err, "corrupt spool line moved to DLQ");
                    let _ = self.spool.append_dlq(line);
                    continue;
                }
            };
            let month = month_of_ms(record.created_at_ms);
            if let Err(err) = self.store.insert_usage_record(&month, &record).await {
                tracing::warn!(error = %err, "spool drain insert failed");
                stalled = true;
                remaining.push(line.clone());
            }
        }

        if let Err(err) = self.spool.rewrite(&remaining) {
            tracing::error!(error = %err, "spool rewrite failed");
            return DrainOutcome::Stalled;
        }
        if stalled {
            DrainOutcome::Stalled
        } else {
            DrainOutcome::Clean
        }
    }

    pub fn spooled_entries(&self) -> usize {
        self.spool.read_lines().map(|lines| lines.len()).unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Clean,
    Stalled,
}

#[derive(Clone, Debug)]
struct Spool {
    dir: PathBuf,
    max_entries: usize,
}

impl Spool {
    fn append(&self, record: &UsageRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

        let current = self.read_lines().map(|lines| lines.len()).unwrap_or(0);
        if current >= self.max_entries {
            tracing::error!(request_id = %record.request_id, "spool full, record sent to DLQ");
            return self.append_dlq(&line);
        }
        self.append_line(SPOOL_FILE, &line)
    }

    fn append_dlq(&self, line: &str) -> std::io::Result<()> {
        self.append_line(DLQ_FILE, line)
    }

    fn append_line(&self, file: &str, line: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        handle.write_all(line.as_bytes())?;
        handle.write_all(b"\n")?;
        Ok(())
    }

    fn read_lines(&self) -> std::io::Result<Vec<String>> {
        let path = self.dir.join(SPOOL_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn rewrite(&self, lines: &[String]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(SPOOL_FILE);
        let tmp_path = path.with_extension("tmp");
        let mut payload = lines.join("\n");
        if !payload.is_empty() {
            payload.push('\n');
        }
        std::fs::write(&tmp_path, payload)?;
        match std::fs::rename(&tmp_path, &path) {
            Ok(()) => Ok(()),
            Err(_) => {
                let mut payload = lines.join("\n");
                if !payload.is_empty() {
                    payload.push('\n');
                }
                std::fs::write(&path, payload)?;
                let _ = std::fs::remove_file(&tmp_path);
                Ok(())
            }
        }
    }
}

fn month_of_ms(epoch_ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp((epoch_ms / 1000) as i64)
        .ok()
        .and_then(|dt| dt.date().format(MONTH_FORMAT).ok())
        .unwrap_or_else(crate::types::current_month)
}
