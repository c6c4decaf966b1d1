//! Configuration types for runtime and execution settings.

use crate::errors::CopyError;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Effective options for a single copy run.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Global bandwidth cap in bytes per second, 0 = unlimited
    pub rate_limit: u64,
    /// Working-set cap that triggers parallelism throttling
    pub max_memory: Option<u64>,
    /// Hard upper bound on concurrent transfers
    pub max_parallelism: usize,
    /// Re-attempts after the first failure of a retryable job
    pub max_retries: u32,
    /// Abort the whole run on the first permanently failed job
    pub stop_on_error: bool,
    /// Enumerate and log jobs without copying
    pub dry_run: bool,
    /// Recursively delete the source after a fully successful run
    pub delete_source: bool,
    /// Shell command executed after a fully successful run
    pub on_completion: Option<String>,
    /// Directory receiving the journal and the failed-job stream
    pub state_dir: std::path::PathBuf,
    /// Emit periodic progress reports
    pub progress: bool,
    /// Delay between progress reports
    pub progress_delay: std::time::Duration,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            rate_limit: 0,
            max_memory: None,
            max_parallelism: 4,
            max_retries: 3,
            stop_on_error: false,
            dry_run: false,
            delete_source: false,
            on_completion: None,
            state_dir: std::path::PathBuf::from("."),
            progress: false,
            progress_delay: std::time::Duration::from_secs(10),
        }
    }
}

impl CopyOptions {
    pub fn validate(&self) -> Result<(), CopyError> {
        if self.max_parallelism == 0 {
            return Err(CopyError::BadArgument(
                "max parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a human-readable size such as `100`, `512K` or `1.5GB`.
///
/// Units are binary (1 KB = 1024 B) and case-insensitive; decimals are
/// accepted; negative or malformed input is rejected.
pub fn parse_size(input: &str) -> Result<u64, CopyError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CopyError::BadArgument("empty size".to_string()));
    }
    if trimmed.starts_with('-') {
        return Err(CopyError::BadArgument(format!(
            "negative size not allowed: {trimmed:?}"
        )));
    }
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| CopyError::BadArgument(format!("invalid size: {trimmed:?}")))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        "T" | "TB" => 1 << 40,
        other => {
            return Err(CopyError::BadArgument(format!(
                "unknown size unit {other:?} in {trimmed:?}"
            )))
        }
    };
    Ok((value * multiplier as f64).round() as u64)
}

/// Parse a human-readable duration such as `200ms`, `10s` or `5min`.
pub fn parse_duration(input: &str) -> Result<std::time::Duration, CopyError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| CopyError::BadArgument(format!("invalid duration: {trimmed:?}")))?;
    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" | "min" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(CopyError::BadArgument(format!(
                "unknown duration unit {other:?} in {trimmed:?}"
            )))
        }
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CopyError::BadArgument(format!(
            "invalid duration: {trimmed:?}"
        )));
    }
    Ok(std::time::Duration::from_secs_f64(seconds))
}
