//! Shared registry of in-flight transfers.
//!
//! Keyed by source URI. The worker executing a job is the only writer of its
//! entry; the UI takes snapshots. Aggregation is a pure function of a
//! snapshot, so a reader can never observe a half-updated total.

use std::collections::HashMap;

use crate::engine::ProgressSample;
use crate::job::CopyJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Copying,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    pub source: String,
    pub destination: String,
    pub total_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub bytes_per_second: f64,
    pub status: TransferStatus,
}

/// Writer handle for one registry entry, held by the owning worker.
#[derive(Clone)]
pub struct TransferHandle {
    entry: std::sync::Arc<std::sync::Mutex<ActiveTransfer>>,
}

impl TransferHandle {
    /// Record a progress sample; `paused` reflects the gate at sample time.
    pub fn record_progress(&self, sample: ProgressSample, paused: bool) {
        let mut entry = self.entry.lock().unwrap();
        entry.bytes_transferred = sample.total_copied;
        entry.bytes_per_second = sample.bytes_per_second;
        if sample.total_known.is_some() {
            entry.total_bytes = sample.total_known;
        }
        entry.status = if paused {
            TransferStatus::Paused
        } else {
            TransferStatus::Copying
        };
    }

    pub fn set_status(&self, status: TransferStatus) {
        self.entry.lock().unwrap().status = status;
    }

    /// Reset counters before a retry attempt.
    pub fn reset(&self) {
        let mut entry = self.entry.lock().unwrap();
        entry.bytes_transferred = 0;
        entry.bytes_per_second = 0.0;
        entry.status = TransferStatus::Pending;
    }
}

#[derive(Default)]
pub struct ProgressRegistry {
    entries: std::sync::RwLock<HashMap<String, std::sync::Arc<std::sync::Mutex<ActiveTransfer>>>>,
}

impl ProgressRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry for a job a worker just took; returns the writer
    /// handle.
    pub fn insert(&self, job: &CopyJob) -> TransferHandle {
        let entry = std::sync::Arc::new(std::sync::Mutex::new(ActiveTransfer {
            source: job.source.clone(),
            destination: job.destination.clone(),
            total_bytes: job.size,
            bytes_transferred: 0,
            bytes_per_second: 0.0,
            status: TransferStatus::Pending,
        }));
        self.entries
            .write()
            .unwrap()
            .insert(job.source.clone(), entry.clone());
        TransferHandle { entry }
    }

    pub fn remove(&self, source: &str) {
        self.entries.write().unwrap().remove(source);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// A point-in-time copy of every entry, for the UI.
    pub fn snapshot(&self) -> Vec<ActiveTransfer> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|entry| entry.lock().unwrap().clone())
            .collect()
    }
}

/// Aggregated view of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub pending: usize,
    pub copying: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub bytes_per_second: f64,
}

pub fn aggregate(snapshot: &[ActiveTransfer]) -> Totals {
    let mut totals = Totals::default();
    for transfer in snapshot {
        match transfer.status {
            TransferStatus::Pending => totals.pending += 1,
            TransferStatus::Copying => totals.copying += 1,
            TransferStatus::Paused => totals.paused += 1,
            TransferStatus::Completed => totals.completed += 1,
            TransferStatus::Failed => totals.failed += 1,
        }
        totals.total_bytes += transfer.total_bytes.unwrap_or(0);
        totals.bytes_transferred += transfer.bytes_transferred;
        totals.bytes_per_second += transfer.bytes_per_second;
    }
    totals
}

/// Renders periodic progress reports from registry snapshots.
///
/// Tracks the previous observation so each report shows both the average
/// rate since the start of the run and the current rate since the last
/// report.
pub struct ProgressPrinter {
    start_time: std::time::Instant,
    last_bytes: u64,
    last_finished: u64,
    last_update: std::time::Instant,
    finished_bytes: u64,
    finished_files: u64,
}

impl ProgressPrinter {
    #[must_use]
    pub fn new() -> Self {
        let now = std::time::Instant::now();
        Self {
            start_time: now,
            last_bytes: 0,
            last_finished: 0,
            last_update: now,
            finished_bytes: 0,
            finished_files: 0,
        }
    }

    /// Record a finished transfer so rates include work whose registry
    /// entry is already gone.
    pub fn add_finished(&mut self, bytes: u64) {
        self.finished_bytes += bytes;
        self.finished_files += 1;
    }

    pub fn print(&mut self, snapshot: &[ActiveTransfer]) -> String {
        let totals = aggregate(snapshot);
        let time_now = std::time::Instant::now();
        let total_bytes = self.finished_bytes + totals.bytes_transferred;
        let total_finished = self.finished_files + totals.completed as u64;
        let total_duration_secs = (time_now - self.start_time).as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = if total_duration_secs > 0.0 {
            total_bytes as f64 / total_duration_secs
        } else {
            0.0
        };
        // a completed entry leaving the registry can shrink the live totals
        // between reports; a dip must not underflow the deltas
        let current_rate = if curr_duration_secs > 0.0 {
            total_bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs
        } else {
            0.0
        };
        let current_files_rate = if curr_duration_secs > 0.0 {
            total_finished.saturating_sub(self.last_finished) as f64 / curr_duration_secs
        } else {
            0.0
        };
        self.last_bytes = total_bytes;
        self.last_finished = total_finished;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            TRANSFERS:\n\
            pending: {:>10}\n\
            active:  {:>10}\n\
            paused:  {:>10}\n\
            done:    {:>10}\n\
            failed:  {:>10}\n\
            ---------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            files:   {:>10.2} files/s\n\
            total:   {:>10}",
            totals.pending,
            totals.copying,
            totals.paused,
            total_finished,
            totals.failed,
            bytesize::ByteSize(average_rate as u64),
            bytesize::ByteSize(current_rate as u64),
            current_files_rate,
            bytesize::ByteSize(total_bytes),
        )
    }
}

impl Default for ProgressPrinter {
    fn default() -> Self {
        Self::new()
    }
}
