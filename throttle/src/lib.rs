//! Process-wide transfer throttling primitives.
//!
//! The [`RateLimiter`] is a token bucket shared by every concurrent transfer;
//! callers debit it before writing each segment and are suspended until the
//! bucket refills. The [`PauseGate`] is an observable paused/running latch
//! that transfer loops consult at every segment boundary.

mod gate;

pub use gate::PauseGate;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Returned when a cancellation token fires while a caller is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Fixed-point scale: tokens are thousandths of a byte so fractional refill
/// amounts are not lost between samples.
const SCALE: i64 = 1000;

/// Upper bound on a single park so live retargets become visible quickly.
const MAX_PARK: std::time::Duration = std::time::Duration::from_millis(50);

/// Global token-bucket rate limiter.
///
/// All state lives in atomics; `consume` never takes a lock. The bucket
/// capacity is one second's worth of tokens, so sustained throughput over any
/// window of a few seconds stays within the configured limit while short
/// bursts after idle periods are absorbed.
pub struct RateLimiter {
    /// Scaled tokens currently available. May transiently go negative while
    /// two consumers race a debit; the loser restores its debit and retries.
    tokens: AtomicI64,
    /// Scaled bucket capacity (one second at the configured rate).
    max: AtomicI64,
    /// Scaled tokens added per second.
    refill_per_sec: AtomicU64,
    /// Microseconds since `start` at which the bucket was last refilled.
    last_refill_micros: AtomicU64,
    /// When set, `consume` returns immediately without debiting.
    bypass: AtomicBool,
    start: tokio::time::Instant,
}

impl RateLimiter {
    /// Create a limiter targeting `bytes_per_sec`; `0` means unlimited.
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Self {
        let limiter = Self {
            tokens: AtomicI64::new(0),
            max: AtomicI64::new(0),
            refill_per_sec: AtomicU64::new(0),
            last_refill_micros: AtomicU64::new(0),
            bypass: AtomicBool::new(true),
            start: tokio::time::Instant::now(),
        };
        limiter.set_limit(bytes_per_sec);
        if bytes_per_sec > 0 {
            // start with a full second of credit banked
            limiter
                .tokens
                .store(limiter.max.load(Ordering::Acquire), Ordering::Release);
        }
        limiter
    }

    /// Retarget the limiter. `0` enables bypass mode; any parked consumer
    /// observes the change within one park interval.
    pub fn set_limit(&self, bytes_per_sec: u64) {
        if bytes_per_sec == 0 {
            self.bypass.store(true, Ordering::Release);
            return;
        }
        let scaled_rate = (bytes_per_sec as i64).saturating_mul(SCALE);
        self.refill_per_sec
            .store(scaled_rate as u64, Ordering::Release);
        self.max.store(scaled_rate, Ordering::Release);
        self.last_refill_micros
            .store(self.now_micros(), Ordering::Release);
        // a shrink must also cap whatever is already banked
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = current.min(scaled_rate);
            if next == current {
                break;
            }
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.bypass.store(false, Ordering::Release);
    }

    /// The currently configured limit in bytes per second; `0` when bypassed.
    pub fn get_limit(&self) -> u64 {
        if self.bypass.load(Ordering::Acquire) {
            return 0;
        }
        self.refill_per_sec.load(Ordering::Acquire) / SCALE as u64
    }

    /// Block the caller until `bytes` tokens can be debited.
    ///
    /// Safe to call from any number of tasks concurrently. Returns promptly
    /// in bypass mode; exits with [`Cancelled`] before the next debit attempt
    /// once `cancel` fires.
    pub async fn consume(
        &self,
        bytes: u64,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), Cancelled> {
        if bytes == 0 || self.bypass.load(Ordering::Acquire) {
            return Ok(());
        }
        let need = (bytes as i64).saturating_mul(SCALE);
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if self.bypass.load(Ordering::Acquire) {
                return Ok(());
            }
            self.refill();
            if self.tokens.load(Ordering::Acquire) >= need {
                let before = self.tokens.fetch_sub(need, Ordering::AcqRel);
                if before >= need {
                    return Ok(());
                }
                // lost the race, restore and retry
                self.tokens.fetch_add(need, Ordering::AcqRel);
            }
            let park = self.park_duration(need);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(park) => {}
            }
        }
    }

    /// Credit the bucket with tokens for the elapsed interval. The interval
    /// is claimed with a CAS on the timestamp so concurrent callers never
    /// double-credit it.
    fn refill(&self) {
        let now = self.now_micros();
        let last = self.last_refill_micros.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        let elapsed = now - last;
        let rate = self.refill_per_sec.load(Ordering::Acquire);
        let add = (rate as u128 * elapsed as u128 / 1_000_000) as i64;
        if add == 0 {
            // too soon to credit a whole scaled token; leave the interval
            // unclaimed so it keeps accumulating
            return;
        }
        if self
            .last_refill_micros
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let max = self.max.load(Ordering::Acquire);
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(add).min(max);
            if next == current {
                break;
            }
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Park long enough for a meaningful fraction of the deficit to refill,
    /// escalating with the size of the deficit but never past [`MAX_PARK`].
    fn park_duration(&self, need: i64) -> std::time::Duration {
        let available = self.tokens.load(Ordering::Acquire).max(0);
        let deficit = (need - available).max(SCALE) as u64;
        let rate = self.refill_per_sec.load(Ordering::Acquire).max(1);
        let wait_ms = (deficit.saturating_mul(1000) / rate).max(1);
        std::time::Duration::from_millis(wait_ms).min(MAX_PARK)
    }

    fn now_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit_bytes_per_sec", &self.get_limit())
            .finish()
    }
}
