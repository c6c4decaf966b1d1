//! Top-level composition of one copy run.
//!
//! Builds the journal, recovery store, rate limiter, pause gate, watchdog,
//! registry and transports, wires the interactive control channel, runs the
//! producer and the worker pool to drain, then finalizes: optional completion
//! command, optional source deletion, and a flush of the persistent stores.

use anyhow::{Context, Result};
use tracing::{event, instrument, Level};

use common::config::CopyOptions;
use common::engine::{CopyContext, ProgressSample};
use common::journal::{Journal, JOURNAL_FILENAME};
use common::pool::{self, PoolSettings, WorkerContext};
use common::producer::{self, SourceSpec};
use common::recovery::RecoveryStore;
use common::registry::ProgressRegistry;
use common::watchdog::ResourceWatchdog;
use transport::{SftpOptions, Transports};

/// Signals from the interactive control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    TogglePause,
    /// Bytes per second; 0 means unlimited.
    SetRateLimit(u64),
    /// Parallelism ceiling delta (usually +1 / -1).
    AdjustParallelism(isize),
}

#[derive(Debug)]
pub struct RunSummary {
    pub jobs_enumerated: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_copied: u64,
    pub elapsed: std::time::Duration,
    pub recovery_path: Option<std::path::PathBuf>,
    pub cancelled: bool,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files copied:  {}\n\
             files failed:  {}\n\
             bytes copied:  {}\n\
             duration:      {:.1?}",
            self.completed,
            self.failed,
            bytesize::ByteSize(self.bytes_copied),
            self.elapsed,
        )?;
        if let Some(path) = &self.recovery_path {
            write!(f, "\nfailed jobs:   {:?} (re-run with --retry-failed)", path)?;
        }
        if self.cancelled {
            write!(f, "\nrun was cancelled before completion")?;
        }
        Ok(())
    }
}

/// Run one copy to completion.
#[instrument(skip_all, fields(destination = %destination))]
pub async fn execute(
    spec: SourceSpec,
    destination: String,
    options: CopyOptions,
    sftp_options: SftpOptions,
    control: Option<tokio::sync::mpsc::Receiver<ControlSignal>>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<RunSummary> {
    options.validate()?;
    let started = std::time::Instant::now();

    let journal = std::sync::Arc::new(
        Journal::open(&options.state_dir.join(JOURNAL_FILENAME))
            .context("cannot open the transfer journal")?,
    );
    let interrupted = journal.resume();
    if !interrupted.is_empty() {
        event!(
            Level::INFO,
            "journal lists {} transfer(s) interrupted by a previous run; they will restart from scratch",
            interrupted.len()
        );
    }
    let recovery = std::sync::Arc::new(
        RecoveryStore::open(&options.state_dir).context("cannot open the failed-job stream")?,
    );
    let limiter = std::sync::Arc::new(throttle::RateLimiter::new(options.rate_limit));
    let gate = std::sync::Arc::new(throttle::PauseGate::new());
    let watchdog = ResourceWatchdog::new(options.max_parallelism, options.max_memory);
    let registry = std::sync::Arc::new(ProgressRegistry::new());
    let transports = std::sync::Arc::new(Transports::new(sftp_options));

    let watchdog_task = watchdog.clone().run(cancel.child_token());
    let control_task = control.map(|control_rx| {
        spawn_control_listener(control_rx, gate.clone(), limiter.clone(), watchdog.clone())
    });
    let reporter_task = options.progress.then(|| {
        spawn_progress_reporter(registry.clone(), options.progress_delay, cancel.child_token())
    });

    let (job_tx, job_rx) = tokio::sync::mpsc::channel(1024);
    let producer_task = {
        let spec = spec.clone();
        let destination = destination.clone();
        tokio::spawn(async move { producer::produce(&spec, &destination, &job_tx).await })
    };

    let outcome = if options.dry_run {
        dry_run(job_rx).await
    } else {
        let worker_ctx = std::sync::Arc::new(WorkerContext {
            registry: registry.clone(),
            recovery: recovery.clone(),
            journal: journal.clone(),
            watchdog: watchdog.clone(),
            cancel: cancel.clone(),
        });
        let settings = PoolSettings {
            max_parallelism: options.max_parallelism,
            max_retries: options.max_retries,
            stop_on_error: options.stop_on_error,
        };
        let executor = {
            let transports = transports.clone();
            let limiter = limiter.clone();
            let gate = gate.clone();
            let journal = journal.clone();
            let cancel = cancel.clone();
            move |job: common::CopyJob, handle: common::registry::TransferHandle| {
                let transports = transports.clone();
                let limiter = limiter.clone();
                let gate = gate.clone();
                let journal = journal.clone();
                let cancel = cancel.clone();
                async move {
                    let progress_gate = gate.clone();
                    let progress_journal = journal.clone();
                    let source = job.source.clone();
                    let target = job.destination.clone();
                    let on_progress = move |sample: ProgressSample| {
                        handle.record_progress(sample, progress_gate.is_paused());
                        if let Err(error) =
                            progress_journal.update(&source, &target, sample.total_copied)
                        {
                            tracing::warn!("journal update failed for {}: {}", source, error);
                        }
                    };
                    let ctx = CopyContext {
                        limiter: Some(limiter.as_ref()),
                        gate: Some(gate.as_ref()),
                        cancel,
                        on_progress: Some(&on_progress),
                    };
                    transports.copy_job(&job, &ctx).await
                }
            }
        };
        pool::run(job_rx, settings, worker_ctx, executor)
            .await
            .map(|summary| (summary.completed, summary.failed, summary.bytes_copied))
    };

    let producer_result = producer_task.await;
    watchdog_task.abort();
    if let Some(control_task) = control_task {
        control_task.abort();
    }
    if let Some(reporter_task) = reporter_task {
        reporter_task.abort();
    }

    // a pool failure (stop-on-error) outranks the producer's queue-closed
    // error that it causes
    let (completed, failed, bytes_copied) = outcome?;
    let produced = match producer_result {
        Ok(Ok(produced)) => produced,
        Ok(Err(error)) => {
            if cancel.is_cancelled() {
                // enumeration was cut short by the cancellation
                completed + failed
            } else {
                return Err(error).context("job enumeration failed");
            }
        }
        Err(join_error) => anyhow::bail!("job producer task failed: {join_error}"),
    };
    let cancelled = cancel.is_cancelled();
    let fully_successful = !cancelled && failed == 0 && completed == produced;

    if fully_successful {
        finalize(&spec, &options).await?;
    } else if options.delete_source || options.on_completion.is_some() {
        event!(
            Level::WARN,
            "skipping finalization: run was not fully successful"
        );
    }

    recovery.dispose();
    journal
        .flush()
        .unwrap_or_else(|error| tracing::warn!("journal flush failed: {}", error));

    Ok(RunSummary {
        jobs_enumerated: produced,
        completed,
        failed,
        bytes_copied,
        elapsed: started.elapsed(),
        recovery_path: (recovery.record_count() > 0).then(|| recovery.path().to_path_buf()),
        cancelled,
    })
}

fn spawn_control_listener(
    mut control_rx: tokio::sync::mpsc::Receiver<ControlSignal>,
    gate: std::sync::Arc<throttle::PauseGate>,
    limiter: std::sync::Arc<throttle::RateLimiter>,
    watchdog: std::sync::Arc<ResourceWatchdog>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = control_rx.recv().await {
            match signal {
                ControlSignal::TogglePause => {
                    let paused = gate.toggle();
                    event!(Level::INFO, "transfers {}", if paused { "paused" } else { "resumed" });
                }
                ControlSignal::SetRateLimit(bytes_per_sec) => {
                    limiter.set_limit(bytes_per_sec);
                    event!(
                        Level::INFO,
                        "rate limit set to {}",
                        if bytes_per_sec == 0 {
                            "unlimited".to_string()
                        } else {
                            format!("{}/s", bytesize::ByteSize(bytes_per_sec))
                        }
                    );
                }
                ControlSignal::AdjustParallelism(delta) => {
                    let ceiling = watchdog.adjust_ceiling(delta);
                    event!(Level::INFO, "parallelism ceiling now {}", ceiling);
                }
            }
        }
    })
}

fn spawn_progress_reporter(
    registry: std::sync::Arc<ProgressRegistry>,
    delay: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut printer = common::registry::ProgressPrinter::new();
        let mut ticker = tokio::time::interval(delay.max(std::time::Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            eprintln!("{}", printer.print(&registry.snapshot()));
        }
    })
}

async fn dry_run(
    mut job_rx: tokio::sync::mpsc::Receiver<common::CopyJob>,
) -> Result<(u64, u64, u64), common::CopyError> {
    let mut listed = 0u64;
    while let Some(job) = job_rx.recv().await {
        event!(
            Level::INFO,
            "dry-run: would copy {} ({})",
            job,
            job.size
                .map(|size| bytesize::ByteSize(size).to_string())
                .unwrap_or_else(|| "size unknown".to_string())
        );
        listed += 1;
    }
    event!(Level::INFO, "dry-run: {} job(s) enumerated", listed);
    Ok((0, 0, 0))
}

/// Post-drain work for a fully successful run: the completion command, then
/// source deletion.
async fn finalize(spec: &SourceSpec, options: &CopyOptions) -> Result<()> {
    if let Some(command) = &options.on_completion {
        event!(Level::INFO, "running completion command: {}", command);
        let status = tokio::process::Command::new("sh")
            .args(["-c", command])
            .status()
            .await
            .with_context(|| format!("failed to launch completion command {command:?}"))?;
        if !status.success() {
            anyhow::bail!("completion command {command:?} exited with {status}");
        }
    }
    if options.delete_source {
        match spec {
            SourceSpec::File(path) => {
                tokio::fs::remove_file(path)
                    .await
                    .with_context(|| format!("failed removing source file {path:?}"))?;
                event!(Level::INFO, "removed source file {:?}", path);
            }
            SourceSpec::Directory(path) => {
                tokio::fs::remove_dir_all(path)
                    .await
                    .with_context(|| format!("failed removing source tree {path:?}"))?;
                event!(Level::INFO, "removed source tree {:?}", path);
            }
            SourceSpec::JobList(_) | SourceSpec::RetryList(_) => {
                event!(
                    Level::WARN,
                    "--delete-source is ignored for list-driven runs"
                );
            }
        }
    }
    Ok(())
}
