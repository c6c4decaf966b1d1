//! Dead-letter stream for permanently failed jobs.
//!
//! One file per run, named with the run's UTC start time. Each record is a
//! single JSON object on its own line, so the stream is both appendable and
//! lazily readable. Appends buffer in memory and are flushed by a 5 second
//! timer and on disposal; a retry run replays the stream as its job source.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use crate::errors::CopyError;
use crate::job::CopyJob;

const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// One permanently failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source: String,
    pub destination: String,
    pub file_size: Option<u64>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace: Option<String>,
}

impl FailedJobRecord {
    pub fn new(job: &CopyJob, error: &CopyError) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            file_size: job.size,
            error: error.to_string(),
            trace: None,
        }
    }
}

struct Writer {
    buffered: std::io::BufWriter<std::fs::File>,
    records: u64,
}

/// Append-only store of failed jobs for the current run.
pub struct RecoveryStore {
    writer: std::sync::Arc<std::sync::Mutex<Writer>>,
    path: std::path::PathBuf,
    flusher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecoveryStore {
    /// Create the store file in `dir` and start the background flush timer.
    pub fn open(dir: &std::path::Path) -> Result<Self, CopyError> {
        let name = format!(
            "failed-jobs-{}.jsonl",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        );
        let path = dir.join(name);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(CopyError::Io)?;
        let writer = std::sync::Arc::new(std::sync::Mutex::new(Writer {
            buffered: std::io::BufWriter::new(file),
            records: 0,
        }));
        let flusher = {
            let writer = writer.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Ok(mut writer) = writer.lock() {
                        let _ = writer.buffered.flush();
                    }
                }
            })
        };
        Ok(Self {
            writer,
            path,
            flusher: std::sync::Mutex::new(Some(flusher)),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one record. Thread-safe; blocks only to serialize the append.
    /// The timestamp is stamped under the lock so readers observe
    /// non-decreasing timestamps in file order.
    pub fn log_failure(&self, mut record: FailedJobRecord) -> Result<(), CopyError> {
        let mut writer = self.writer.lock().unwrap();
        record.timestamp = chrono::Utc::now();
        let line = serde_json::to_string(&record)
            .map_err(|error| CopyError::Io(std::io::Error::other(error)))?;
        writer.buffered.write_all(line.as_bytes()).map_err(CopyError::Io)?;
        writer.buffered.write_all(b"\n").map_err(CopyError::Io)?;
        writer.records += 1;
        Ok(())
    }

    /// Force buffered records to disk.
    pub fn flush(&self) -> Result<(), CopyError> {
        let mut writer = self.writer.lock().unwrap();
        writer.buffered.flush().map_err(CopyError::Io)?;
        writer.buffered.get_ref().sync_data().map_err(CopyError::Io)
    }

    pub fn record_count(&self) -> u64 {
        self.writer.lock().unwrap().records
    }

    /// Stop the flush timer and flush once more; errors are swallowed.
    pub fn dispose(&self) {
        if let Some(flusher) = self.flusher.lock().unwrap().take() {
            flusher.abort();
        }
        let _ = self.flush();
    }

    /// Lazily read a failed-job stream back as jobs for a retry run.
    pub fn read(
        path: &std::path::Path,
    ) -> Result<impl Iterator<Item = Result<CopyJob, CopyError>>, CopyError> {
        let file = std::fs::File::open(path).map_err(CopyError::Io)?;
        let reader = std::io::BufReader::new(file);
        Ok(reader.lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str::<FailedJobRecord>(&line)
                    .map(|record| CopyJob::new(record.source, record.destination, record.file_size))
                    .map_err(|error| CopyError::Io(std::io::Error::other(error))),
            ),
            Err(error) => Some(Err(CopyError::Io(error))),
        }))
    }
}

impl Drop for RecoveryStore {
    fn drop(&mut self) {
        self.dispose();
    }
}
