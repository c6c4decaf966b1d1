//! The streaming copy engine.
//!
//! One transfer is a producer task reading the source into the bounded pipe
//! and a consumer loop draining it into the sink. The consumer observes the
//! pause gate and the rate limiter at every segment boundary and publishes
//! progress after each acknowledged write, so pause, retarget, and
//! cancellation all take effect within one segment.

use tokio::io::AsyncWriteExt;

use crate::errors::CopyError;
use crate::pipe;

/// A progress observation for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    /// Bytes acknowledged by the sink so far; non-decreasing.
    pub total_copied: u64,
    /// Declared source size when known.
    pub total_known: Option<u64>,
    /// `total_copied / elapsed`, averaged over the whole transfer.
    pub bytes_per_second: f64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(ProgressSample) + Send + Sync);

/// Shared controls threaded through every suspension point of a transfer.
pub struct CopyContext<'a> {
    pub limiter: Option<&'a throttle::RateLimiter>,
    pub gate: Option<&'a throttle::PauseGate>,
    pub cancel: tokio_util::sync::CancellationToken,
    pub on_progress: Option<ProgressFn<'a>>,
}

impl<'a> CopyContext<'a> {
    /// A context with no throttling, no gate, and no progress reporting.
    pub fn unthrottled(cancel: tokio_util::sync::CancellationToken) -> Self {
        Self {
            limiter: None,
            gate: None,
            cancel,
            on_progress: None,
        }
    }
}

/// Stream every byte of `source` into `sink` through the bounded pipe.
///
/// Returns the number of bytes acknowledged by the sink. On error both pipe
/// halves shut down and all segments return to the pool.
pub async fn copy_stream<R, W>(
    source: R,
    sink: &mut W,
    total_known: Option<u64>,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin,
{
    let (tx, mut rx) = pipe::bounded();
    let producer = pipe::spawn_producer(source, tx, ctx.cancel.clone());
    let started = std::time::Instant::now();
    let mut total_copied: u64 = 0;

    let result = loop {
        let segment = match rx.recv().await {
            Some(Ok(segment)) => segment,
            Some(Err(error)) => break Err(error),
            None => break Ok(total_copied),
        };
        if let Some(gate) = ctx.gate {
            if let Err(cancelled) = gate.wait_while_paused(&ctx.cancel).await {
                pipe::pool().give_back(segment);
                break Err(cancelled.into());
            }
        }
        if let Some(limiter) = ctx.limiter {
            if let Err(cancelled) = limiter.consume(segment.len() as u64, &ctx.cancel).await {
                pipe::pool().give_back(segment);
                break Err(cancelled.into());
            }
        }
        if let Err(error) = sink.write_all(&segment).await {
            pipe::pool().give_back(segment);
            break Err(CopyError::Io(error));
        }
        total_copied += segment.len() as u64;
        pipe::pool().give_back(segment);
        if let Some(on_progress) = ctx.on_progress {
            let elapsed = started.elapsed().as_secs_f64();
            on_progress(ProgressSample {
                total_copied,
                total_known,
                bytes_per_second: if elapsed > 0.0 {
                    total_copied as f64 / elapsed
                } else {
                    0.0
                },
            });
        }
    };

    match result {
        Ok(total) => {
            sink.flush().await.map_err(CopyError::Io)?;
            // producer is done once the channel closed
            let _ = producer.await;
            Ok(total)
        }
        Err(error) => {
            // drop the receiver so a parked producer unblocks and returns
            // its segments to the pool
            drop(rx);
            let _ = producer.await;
            Err(error)
        }
    }
}

/// Copy a local file to a local destination path: opens the source, creates
/// parent directories, preallocates the destination when the size is known,
/// then delegates to [`copy_stream`].
pub async fn copy_file(
    src: &std::path::Path,
    dst: &std::path::Path,
    ctx: &CopyContext<'_>,
) -> Result<u64, CopyError> {
    let source = tokio::fs::File::open(src).await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            CopyError::SourceNotFound(src.display().to_string())
        } else {
            CopyError::Io(error)
        }
    })?;
    let size = source.metadata().await.map_err(CopyError::Io)?.len();
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(CopyError::Io)?;
        }
    }
    let mut sink = create_preallocated(dst, size).await?;
    copy_stream(source, &mut sink, Some(size), ctx).await
}

/// Create the destination in create/truncate mode, reserving `size` bytes
/// up-front so large writes do not fragment.
pub async fn create_preallocated(
    dst: &std::path::Path,
    size: u64,
) -> Result<tokio::fs::File, CopyError> {
    let file = tokio::fs::File::create(dst).await.map_err(CopyError::Io)?;
    if size == 0 {
        return Ok(file);
    }
    let std_file = file.into_std().await;
    let std_file = tokio::task::spawn_blocking(move || {
        use std::os::fd::AsRawFd;
        // best effort: not all filesystems support it
        let _ = nix::fcntl::posix_fallocate(std_file.as_raw_fd(), 0, size as i64);
        std_file
    })
    .await
    .map_err(|error| CopyError::Io(std::io::Error::other(error)))?;
    Ok(tokio::fs::File::from_std(std_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use test_log::test;

    fn ctx(cancel: &tokio_util::sync::CancellationToken) -> CopyContext<'static> {
        CopyContext::unthrottled(cancel.clone())
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut payload);
        payload
    }

    #[test(tokio::test)]
    async fn stream_copies_bytes_exactly() {
        let payload = random_payload(1_000_000);
        let cancel = tokio_util::sync::CancellationToken::new();
        let mut sink = Vec::new();
        let copied = copy_stream(
            std::io::Cursor::new(payload.clone()),
            &mut sink,
            Some(payload.len() as u64),
            &ctx(&cancel),
        )
        .await
        .unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[test(tokio::test)]
    async fn empty_stream_completes_with_zero() {
        let cancel = tokio_util::sync::CancellationToken::new();
        let mut sink = Vec::new();
        let copied = copy_stream(
            std::io::Cursor::new(Vec::<u8>::new()),
            &mut sink,
            Some(0),
            &ctx(&cancel),
        )
        .await
        .unwrap();
        assert_eq!(copied, 0);
        assert!(sink.is_empty());
    }

    #[test(tokio::test)]
    async fn progress_is_monotonic_and_reaches_total() {
        let payload = random_payload(300_000);
        let cancel = tokio_util::sync::CancellationToken::new();
        let samples = std::sync::Mutex::new(Vec::<ProgressSample>::new());
        let record = |sample: ProgressSample| samples.lock().unwrap().push(sample);
        let mut sink = Vec::new();
        let context = CopyContext {
            limiter: None,
            gate: None,
            cancel: cancel.clone(),
            on_progress: Some(&record),
        };
        copy_stream(
            std::io::Cursor::new(payload.clone()),
            &mut sink,
            Some(payload.len() as u64),
            &context,
        )
        .await
        .unwrap();
        let samples = samples.into_inner().unwrap();
        assert!(!samples.is_empty());
        let mut previous = 0;
        for sample in &samples {
            assert!(sample.total_copied >= previous);
            assert_eq!(sample.total_known, Some(payload.len() as u64));
            previous = sample.total_copied;
        }
        assert_eq!(samples.last().unwrap().total_copied, payload.len() as u64);
    }

    #[test(tokio::test)]
    async fn cancellation_aborts_the_transfer() {
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let mut sink = Vec::new();
        let result = copy_stream(
            std::io::Cursor::new(vec![0u8; 1 << 20]),
            &mut sink,
            None,
            &ctx(&cancel),
        )
        .await;
        assert!(matches!(result, Err(CopyError::Cancelled)));
    }

    #[test(tokio::test(start_paused = true))]
    async fn rate_limited_copy_takes_proportional_time() {
        let payload = vec![7u8; 2 * 1024 * 1024];
        let limiter = throttle::RateLimiter::new(1024 * 1024);
        let cancel = tokio_util::sync::CancellationToken::new();
        let context = CopyContext {
            limiter: Some(&limiter),
            gate: None,
            cancel: cancel.clone(),
            on_progress: None,
        };
        let started = tokio::time::Instant::now();
        let mut sink = Vec::new();
        copy_stream(
            std::io::Cursor::new(payload.clone()),
            &mut sink,
            None,
            &context,
        )
        .await
        .unwrap();
        // 2 MiB at 1 MiB/s with a 1 MiB burst: about a second
        assert!(started.elapsed() >= std::time::Duration::from_millis(900));
        assert_eq!(sink.len(), payload.len());
    }

    #[test(tokio::test(start_paused = true))]
    async fn pause_freezes_the_stream_until_resume() {
        let payload = vec![5u8; 1024 * 1024];
        let limiter = std::sync::Arc::new(throttle::RateLimiter::new(256 * 1024));
        let gate = std::sync::Arc::new(throttle::PauseGate::new());
        let cancel = tokio_util::sync::CancellationToken::new();
        let copied = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let transfer = {
            let limiter = limiter.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            let copied = copied.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let observe = move |sample: ProgressSample| {
                    copied.store(sample.total_copied, std::sync::atomic::Ordering::SeqCst);
                };
                let context = CopyContext {
                    limiter: Some(limiter.as_ref()),
                    gate: Some(gate.as_ref()),
                    cancel,
                    on_progress: Some(&observe),
                };
                let mut sink = Vec::new();
                let total = copy_stream(
                    std::io::Cursor::new(payload),
                    &mut sink,
                    None,
                    &context,
                )
                .await
                .unwrap();
                (total, sink)
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        gate.pause();
        // allow the segment already past the gate to land
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let frozen = copied.load(std::sync::atomic::Ordering::SeqCst);
        assert!(frozen > 0);
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(copied.load(std::sync::atomic::Ordering::SeqCst), frozen);
        gate.resume();
        let (total, sink) = transfer.await.unwrap();
        assert_eq!(total, payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[test(tokio::test)]
    async fn file_copy_round_trips_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.bin");
        let dst = dir.path().join("nested").join("deeper").join("output.bin");
        let payload = random_payload(150_000);
        tokio::fs::write(&src, &payload).await.unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let copied = copy_file(&src, &dst, &ctx(&cancel)).await.unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), payload);
    }

    #[test(tokio::test)]
    async fn missing_source_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = copy_file(
            &dir.path().join("absent.bin"),
            &dir.path().join("out.bin"),
            &ctx(&cancel),
        )
        .await;
        match result {
            Err(CopyError::SourceNotFound(_)) => {}
            other => panic!("expected SourceNotFound, got {other:?}"),
        }
    }
}
