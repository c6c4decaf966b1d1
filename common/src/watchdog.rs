//! Resource watchdog advising a parallelism ceiling.
//!
//! Samples the process working set and CPU time every 500 ms. When a memory
//! cap is configured and the working set exceeds it, the advised ceiling
//! shrinks multiplicatively (floor 1); once usage drops below 85% of the cap
//! the ceiling creeps back up one slot per sample. The worker pool checks the
//! ceiling before admitting each job.

use std::sync::atomic::{AtomicUsize, Ordering};

const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
const RECOVERY_THRESHOLD_PERCENT: u64 = 85;

#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub memory_bytes: u64,
    pub cpu_fraction: f64,
    pub parallelism_ceiling: usize,
    pub throttled: bool,
}

pub struct ResourceWatchdog {
    ceiling: AtomicUsize,
    initial: usize,
    max_memory: Option<u64>,
    latest: std::sync::Mutex<ResourceSnapshot>,
}

impl ResourceWatchdog {
    pub fn new(initial_parallelism: usize, max_memory: Option<u64>) -> std::sync::Arc<Self> {
        let initial = initial_parallelism.max(1);
        std::sync::Arc::new(Self {
            ceiling: AtomicUsize::new(initial),
            initial,
            max_memory,
            latest: std::sync::Mutex::new(ResourceSnapshot {
                memory_bytes: 0,
                cpu_fraction: 0.0,
                parallelism_ceiling: initial,
                throttled: false,
            }),
        })
    }

    /// The currently advised upper bound on simultaneous transfers.
    pub fn current_ceiling(&self) -> usize {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Externally adjust the ceiling (interactive ±1), clamped to
    /// `[1, initial]`.
    pub fn adjust_ceiling(&self, delta: isize) -> usize {
        let mut current = self.ceiling.load(Ordering::Acquire);
        loop {
            let target = (current as isize + delta).clamp(1, self.initial as isize) as usize;
            match self.ceiling.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return target,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        *self.latest.lock().unwrap()
    }

    /// Run the sampling loop until cancelled.
    pub fn run(
        self: std::sync::Arc<Self>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut previous_cpu = process_cpu_time();
            let mut previous_at = std::time::Instant::now();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let memory = current_rss_bytes();
                let cpu = process_cpu_time();
                let now = std::time::Instant::now();
                let wall = now.duration_since(previous_at).as_secs_f64();
                let cpu_fraction = if wall > 0.0 {
                    (cpu.saturating_sub(previous_cpu)).as_secs_f64() / wall
                } else {
                    0.0
                };
                previous_cpu = cpu;
                previous_at = now;
                self.observe(memory, cpu_fraction);
            }
        })
    }

    /// Apply one sample to the ceiling. Split out so the policy is testable
    /// without a timer.
    pub fn observe(&self, memory_bytes: u64, cpu_fraction: f64) {
        let mut throttled = false;
        if let Some(cap) = self.max_memory {
            let ceiling = self.ceiling.load(Ordering::Acquire);
            if memory_bytes > cap {
                let reduced = (ceiling * 3 / 4).max(1);
                self.ceiling.store(reduced, Ordering::Release);
                throttled = true;
                if reduced < ceiling {
                    tracing::warn!(
                        "memory {} over cap {}, parallelism ceiling {} -> {}",
                        bytesize::ByteSize(memory_bytes),
                        bytesize::ByteSize(cap),
                        ceiling,
                        reduced
                    );
                }
            } else if memory_bytes < cap * RECOVERY_THRESHOLD_PERCENT / 100
                && ceiling < self.initial
            {
                self.ceiling.store(ceiling + 1, Ordering::Release);
                tracing::debug!("parallelism ceiling restored to {}", ceiling + 1);
            }
        }
        let mut latest = self.latest.lock().unwrap();
        *latest = ResourceSnapshot {
            memory_bytes,
            cpu_fraction,
            parallelism_ceiling: self.ceiling.load(Ordering::Acquire),
            throttled,
        };
    }
}

/// Current resident set size. Prefers `/proc/self/statm` (current RSS);
/// falls back to the getrusage high-water mark elsewhere.
pub fn current_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|field| field.parse::<u64>().ok())
            {
                let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if page_size > 0 {
                    return resident_pages * page_size as u64;
                }
            }
        }
    }
    max_rss_bytes()
}

/// Peak resident set size from getrusage.
fn max_rss_bytes() -> u64 {
    // SAFETY: zeroed rusage is a valid out-parameter
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        // ru_maxrss is KiB on Linux, bytes on macOS
        #[cfg(target_os = "macos")]
        {
            usage.ru_maxrss as u64
        }
        #[cfg(not(target_os = "macos"))]
        {
            usage.ru_maxrss as u64 * 1024
        }
    }
}

/// Total user + system CPU time consumed by the process.
fn process_cpu_time() -> std::time::Duration {
    // SAFETY: zeroed rusage is a valid out-parameter
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return std::time::Duration::ZERO;
        }
        timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)
    }
}

fn timeval_to_duration(tv: libc::timeval) -> std::time::Duration {
    std::time::Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn sampling_reports_nonzero_memory() {
        assert!(current_rss_bytes() > 0);
    }

    #[test]
    fn over_cap_shrinks_multiplicatively_with_floor_one() {
        let watchdog = ResourceWatchdog::new(8, Some(1000));
        watchdog.observe(2000, 0.0);
        assert_eq!(watchdog.current_ceiling(), 6);
        watchdog.observe(2000, 0.0);
        assert_eq!(watchdog.current_ceiling(), 4);
        for _ in 0..20 {
            watchdog.observe(2000, 0.0);
        }
        assert_eq!(watchdog.current_ceiling(), 1);
        assert!(watchdog.snapshot().throttled);
    }

    #[test]
    fn recovery_steps_back_up_below_threshold() {
        let watchdog = ResourceWatchdog::new(8, Some(1000));
        watchdog.observe(2000, 0.0);
        watchdog.observe(2000, 0.0);
        assert_eq!(watchdog.current_ceiling(), 4);
        // 900 is between 85% and 100% of the cap: hold steady
        watchdog.observe(900, 0.0);
        assert_eq!(watchdog.current_ceiling(), 4);
        watchdog.observe(100, 0.0);
        watchdog.observe(100, 0.0);
        assert_eq!(watchdog.current_ceiling(), 6);
        for _ in 0..10 {
            watchdog.observe(100, 0.0);
        }
        assert_eq!(watchdog.current_ceiling(), 8);
    }

    #[test]
    fn no_cap_means_no_throttling() {
        let watchdog = ResourceWatchdog::new(4, None);
        watchdog.observe(u64::MAX, 0.0);
        assert_eq!(watchdog.current_ceiling(), 4);
        assert!(!watchdog.snapshot().throttled);
    }

    #[test]
    fn interactive_adjustment_is_clamped() {
        let watchdog = ResourceWatchdog::new(4, None);
        assert_eq!(watchdog.adjust_ceiling(-1), 3);
        assert_eq!(watchdog.adjust_ceiling(-10), 1);
        assert_eq!(watchdog.adjust_ceiling(1), 2);
        assert_eq!(watchdog.adjust_ceiling(10), 4);
    }

    #[test(tokio::test(start_paused = true))]
    async fn run_loop_stops_on_cancel() {
        let watchdog = ResourceWatchdog::new(2, None);
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = watchdog.clone().run(cancel.clone());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert!(watchdog.snapshot().memory_bytes > 0);
        cancel.cancel();
        task.await.unwrap();
    }
}
