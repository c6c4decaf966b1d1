//! The worker pool: drains the job queue with bounded parallelism.
//!
//! Admission is two-staged: a check against the watchdog's advised ceiling
//! (which moves at runtime) and then a permit from a semaphore sized to the
//! hard maximum. Each job runs a retry loop with classified errors; exhausted
//! or permanent failures go to the recovery store, and with stop-on-error the
//! first such failure cancels every peer.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::CopyError;
use crate::job::CopyJob;
use crate::journal::Journal;
use crate::recovery::{FailedJobRecord, RecoveryStore};
use crate::registry::{ProgressRegistry, TransferHandle, TransferStatus};
use crate::watchdog::ResourceWatchdog;

/// Delay between admission checks while the watchdog ceiling is saturated.
const ADMISSION_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(25);
/// Base delay of the linear retry back-off.
const RETRY_BASE_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_parallelism: usize,
    pub max_retries: u32,
    pub stop_on_error: bool,
}

/// Shared components every worker needs.
pub struct WorkerContext {
    pub registry: std::sync::Arc<ProgressRegistry>,
    pub recovery: std::sync::Arc<RecoveryStore>,
    pub journal: std::sync::Arc<Journal>,
    pub watchdog: std::sync::Arc<ResourceWatchdog>,
    pub cancel: tokio_util::sync::CancellationToken,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolSummary {
    pub completed: u64,
    pub failed: u64,
    pub bytes_copied: u64,
}

impl std::ops::Add for PoolSummary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            completed: self.completed + other.completed,
            failed: self.failed + other.failed,
            bytes_copied: self.bytes_copied + other.bytes_copied,
        }
    }
}

struct JobOutcome {
    bytes: u64,
    error: Option<CopyError>,
}

/// Drain `jobs` until the queue closes or cancellation fires.
///
/// `execute` performs one attempt of one job (transport dispatch lives in the
/// caller); it is invoked once per retry attempt. Returns the summary, or the
/// first permanent failure when `stop_on_error` is set.
pub async fn run<E, Fut>(
    mut jobs: tokio::sync::mpsc::Receiver<CopyJob>,
    settings: PoolSettings,
    ctx: std::sync::Arc<WorkerContext>,
    execute: E,
) -> Result<PoolSummary, CopyError>
where
    E: Fn(CopyJob, TransferHandle) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<u64, CopyError>> + Send + 'static,
{
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(settings.max_parallelism));
    let in_flight = std::sync::Arc::new(AtomicUsize::new(0));
    let mut tasks: tokio::task::JoinSet<JobOutcome> = tokio::task::JoinSet::new();
    let mut summary = PoolSummary::default();
    let mut fatal: Option<CopyError> = None;

    'dispatch: loop {
        while let Some(finished) = tasks.try_join_next() {
            record_outcome(finished, &mut summary, &mut fatal, &settings, &ctx);
        }
        if fatal.is_some() {
            break;
        }
        let job = tokio::select! {
            _ = ctx.cancel.cancelled() => break 'dispatch,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break 'dispatch,
            },
        };
        // stay within the watchdog's advised ceiling before taking a permit
        while in_flight.load(Ordering::Acquire) >= ctx.watchdog.current_ceiling() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break 'dispatch,
                _ = tokio::time::sleep(ADMISSION_RETRY_DELAY) => {}
            }
        }
        let permit = tokio::select! {
            _ = ctx.cancel.cancelled() => break 'dispatch,
            permit = semaphore.clone().acquire_owned() => {
                permit.expect("pool semaphore is never closed")
            }
        };
        in_flight.fetch_add(1, Ordering::AcqRel);
        tracing::debug!("starting {}", job);
        let worker_ctx = ctx.clone();
        let worker_execute = execute.clone();
        let worker_in_flight = in_flight.clone();
        let max_retries = settings.max_retries;
        tasks.spawn(async move {
            let outcome = run_one(job, max_retries, &worker_ctx, worker_execute).await;
            worker_in_flight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            outcome
        });
    }

    while let Some(finished) = tasks.join_next().await {
        record_outcome(finished, &mut summary, &mut fatal, &settings, &ctx);
    }
    match fatal {
        Some(error) => Err(error),
        None => Ok(summary),
    }
}

fn record_outcome(
    finished: Result<JobOutcome, tokio::task::JoinError>,
    summary: &mut PoolSummary,
    fatal: &mut Option<CopyError>,
    settings: &PoolSettings,
    ctx: &WorkerContext,
) {
    let outcome = match finished {
        Ok(outcome) => outcome,
        Err(join_error) => {
            tracing::error!("worker task failed: {}", join_error);
            summary.failed += 1;
            return;
        }
    };
    match outcome.error {
        None => {
            summary.completed += 1;
            summary.bytes_copied += outcome.bytes;
        }
        Some(CopyError::Cancelled) => {
            // aborted in flight; neither completed nor dead-lettered
        }
        Some(error) => {
            summary.failed += 1;
            if settings.stop_on_error && fatal.is_none() {
                ctx.cancel.cancel();
                *fatal = Some(error);
            }
        }
    }
}

/// Execute one job to a terminal state: retry loop, registry lifecycle,
/// journal bookkeeping, dead-letter on permanent failure.
async fn run_one<E, Fut>(
    job: CopyJob,
    max_retries: u32,
    ctx: &WorkerContext,
    execute: E,
) -> JobOutcome
where
    E: Fn(CopyJob, TransferHandle) -> Fut,
    Fut: std::future::Future<Output = Result<u64, CopyError>>,
{
    let handle = ctx.registry.insert(&job);
    if let Err(error) = ctx.journal.update(&job.source, &job.destination, 0) {
        tracing::warn!("journal update failed for {}: {}", job, error);
    }
    let mut bytes = 0;
    let mut last_error: Option<CopyError> = None;
    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = RETRY_BASE_DELAY * attempt;
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    last_error = Some(CopyError::Cancelled);
                    break;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            handle.reset();
        }
        match execute(job.clone(), handle.clone()).await {
            Ok(copied) => {
                bytes = copied;
                last_error = None;
                break;
            }
            Err(error) => {
                let permanent = error.is_cancelled() || !error.is_retryable();
                tracing::warn!(
                    "attempt {}/{} failed for {}: {}",
                    attempt + 1,
                    max_retries + 1,
                    job,
                    error
                );
                last_error = Some(error);
                if permanent {
                    break;
                }
            }
        }
    }
    match &last_error {
        None => {
            handle.set_status(TransferStatus::Completed);
            if let Err(error) = ctx.journal.complete(&job.source) {
                tracing::warn!("journal completion failed for {}: {}", job, error);
            }
            ctx.registry.remove(&job.source);
            tracing::debug!("completed {}", job);
            JobOutcome { bytes, error: None }
        }
        Some(CopyError::Cancelled) => {
            // leave the journal entry: the transfer was genuinely in flight
            ctx.registry.remove(&job.source);
            JobOutcome {
                bytes: 0,
                error: Some(CopyError::Cancelled),
            }
        }
        Some(error) => {
            if let Err(log_error) = ctx
                .recovery
                .log_failure(FailedJobRecord::new(&job, error))
            {
                tracing::error!("failed writing dead-letter record for {}: {}", job, log_error);
            }
            handle.set_status(TransferStatus::Failed);
            // failed jobs are owned by the recovery store from here on
            if let Err(journal_error) = ctx.journal.complete(&job.source) {
                tracing::warn!("journal completion failed for {}: {}", job, journal_error);
            }
            ctx.registry.remove(&job.source);
            JobOutcome {
                bytes: 0,
                error: last_error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::aggregate;
    use test_log::test;

    struct Fixture {
        ctx: std::sync::Arc<WorkerContext>,
        _dir: tempfile::TempDir,
    }

    fn fixture(initial_ceiling: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let journal =
            Journal::open(&dir.path().join(crate::journal::JOURNAL_FILENAME)).unwrap();
        let recovery = RecoveryStore::open(dir.path()).unwrap();
        Fixture {
            ctx: std::sync::Arc::new(WorkerContext {
                registry: std::sync::Arc::new(ProgressRegistry::new()),
                recovery: std::sync::Arc::new(recovery),
                journal: std::sync::Arc::new(journal),
                watchdog: ResourceWatchdog::new(initial_ceiling, None),
                cancel: tokio_util::sync::CancellationToken::new(),
            }),
            _dir: dir,
        }
    }

    fn settings(max_parallelism: usize, max_retries: u32, stop_on_error: bool) -> PoolSettings {
        PoolSettings {
            max_parallelism,
            max_retries,
            stop_on_error,
        }
    }

    fn queue_of(count: usize) -> tokio::sync::mpsc::Receiver<CopyJob> {
        let (tx, rx) = tokio::sync::mpsc::channel(count.max(1));
        for i in 0..count {
            tx.try_send(CopyJob::new(
                format!("/src/{i}"),
                format!("/dst/{i}"),
                Some(100),
            ))
            .unwrap();
        }
        rx
    }

    #[test(tokio::test)]
    async fn drains_queue_and_counts_completions() {
        let fixture = fixture(8);
        let summary = run(
            queue_of(10),
            settings(4, 0, false),
            fixture.ctx.clone(),
            |_job, _handle| async move { Ok(100u64) },
        )
        .await
        .unwrap();
        assert_eq!(summary.completed, 10);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.bytes_copied, 1000);
        assert!(fixture.ctx.registry.is_empty());
        assert_eq!(fixture.ctx.journal.live_records(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn retry_exhaustion_dead_letters_once() {
        let fixture = fixture(8);
        let attempts = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let summary = run(
            queue_of(1),
            settings(2, 2, false),
            fixture.ctx.clone(),
            move |_job, _handle| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CopyError::Connection("connection reset".into()))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(fixture.ctx.recovery.record_count(), 1);
        assert!(fixture.ctx.registry.is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn transient_failure_then_success_is_not_dead_lettered() {
        let fixture = fixture(8);
        let attempts = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let summary = run(
            queue_of(1),
            settings(2, 3, false),
            fixture.ctx.clone(),
            move |_job, _handle| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(CopyError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "slow disk",
                        )))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(fixture.ctx.recovery.record_count(), 0);
    }

    #[test(tokio::test)]
    async fn non_retryable_error_fails_in_one_attempt() {
        let fixture = fixture(8);
        let attempts = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let summary = run(
            queue_of(1),
            settings(2, 5, false),
            fixture.ctx.clone(),
            move |_job, _handle| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CopyError::Auth("permission denied".into()))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(fixture.ctx.recovery.record_count(), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn in_flight_never_exceeds_watchdog_ceiling() {
        let fixture = fixture(2);
        let concurrent = std::sync::Arc::new(AtomicUsize::new(0));
        let peak = std::sync::Arc::new(AtomicUsize::new(0));
        let summary = {
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            run(
                queue_of(12),
                settings(4, 0, false),
                fixture.ctx.clone(),
                move |_job, _handle| {
                    let concurrent = concurrent.clone();
                    let peak = peak.clone();
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(1)
                    }
                },
            )
            .await
            .unwrap()
        };
        assert_eq!(summary.completed, 12);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "peak concurrency {} exceeded the watchdog ceiling",
            peak.load(Ordering::SeqCst)
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancellation_mid_retry_writes_no_dead_letter() {
        let fixture = fixture(8);
        let cancel = fixture.ctx.cancel.clone();
        let summary = run(
            queue_of(1),
            settings(2, 5, false),
            fixture.ctx.clone(),
            move |_job, _handle| {
                let cancel = cancel.clone();
                async move {
                    // fail transiently, then cancel the whole run during the
                    // retry back-off
                    cancel.cancel();
                    Err(CopyError::Connection("gone".into()))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(fixture.ctx.recovery.record_count(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn stop_on_error_cancels_peers_and_propagates() {
        let fixture = fixture(8);
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.try_send(CopyJob::new("/src/bad", "/dst/bad", None)).unwrap();
        tx.try_send(CopyJob::new("/src/slow", "/dst/slow", None)).unwrap();
        drop(tx);
        let result = run(
            rx,
            settings(2, 0, true),
            fixture.ctx.clone(),
            move |job, _handle| async move {
                if job.source.ends_with("bad") {
                    Err(CopyError::Auth("rejected".into()))
                } else {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(1)
                }
            },
        )
        .await;
        match result {
            Err(CopyError::Auth(_)) => {}
            other => panic!("expected the auth failure to propagate, got {other:?}"),
        }
        assert!(fixture.ctx.cancel.is_cancelled());
    }

    #[test(tokio::test(start_paused = true))]
    async fn paused_run_stops_aggregate_progress() {
        let fixture = fixture(4);
        let gate = std::sync::Arc::new(throttle::PauseGate::new());
        let worker_gate = gate.clone();
        let pool_cancel = fixture.ctx.cancel.clone();
        let pool = tokio::spawn(run(
            queue_of(2),
            settings(2, 0, false),
            fixture.ctx.clone(),
            move |_job, handle| {
                let gate = worker_gate.clone();
                let cancel = pool_cancel.clone();
                async move {
                    for step in 1..=20u64 {
                        gate.wait_while_paused(&cancel).await?;
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        handle.record_progress(
                            crate::engine::ProgressSample {
                                total_copied: step * 1000,
                                total_known: Some(20_000),
                                bytes_per_second: 0.0,
                            },
                            gate.is_paused(),
                        );
                    }
                    Ok(20_000)
                }
            },
        ));
        tokio::time::sleep(std::time::Duration::from_millis(110)).await;
        gate.pause();
        // let in-flight segments settle, then verify no further movement
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let frozen = aggregate(&fixture.ctx.registry.snapshot()).bytes_transferred;
        assert!(frozen > 0);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let still = aggregate(&fixture.ctx.registry.snapshot()).bytes_transferred;
        assert_eq!(frozen, still);
        gate.resume();
        let summary = pool.await.unwrap().unwrap();
        assert_eq!(summary.completed, 2);
    }
}
