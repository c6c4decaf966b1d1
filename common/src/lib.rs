//! Core primitives of the fastcopy transfer engine: the streaming copy
//! engine, the crash-resumable journal, the dead-letter store, the worker
//! pool, the resource watchdog, job production, and the shared progress
//! registry. Destination transports live in the `transport` crate; the `fcp`
//! binary composes everything.

pub mod config;
pub mod engine;
pub mod errors;
pub mod job;
pub mod journal;
pub mod pipe;
pub mod pool;
pub mod producer;
pub mod recovery;
pub mod registry;
pub mod testutils;
pub mod watchdog;

pub use errors::CopyError;
pub use job::CopyJob;

/// Build the runtime, install tracing, and execute `func` to completion.
///
/// Returns `None` when the run failed (the error has been reported unless
/// quiet); the binary maps that to its exit code.
pub fn run<MainFn, MainFut, Summary>(
    runtime: &config::RuntimeConfig,
    output: &config::OutputConfig,
    func: MainFn,
) -> Option<Summary>
where
    MainFn: FnOnce() -> MainFut,
    MainFut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: std::fmt::Display,
{
    init_tracing(output.verbose);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the async runtime: {error}");
            }
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
            }
            None
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // ignore the error when a subscriber is already installed (tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
