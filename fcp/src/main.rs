use anyhow::{anyhow, Context, Result};
use structopt::StructOpt;
use tracing::{event, instrument, Level};

mod controller;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "fcp",
    about = "`fcp` is a high-throughput file replication tool: it streams large numbers of files \
    from a local source to a local path, an SFTP server, a Docker container or a Kubernetes pod, \
    with a global bandwidth cap, pause/resume, automatic retry and a crash-resumable journal."
)]
struct Args {
    /// Source path (file or directory); omit when using --job-list or --retry-failed
    #[structopt()]
    source: Option<String>,

    /// Destination URI: a bare path, file://, ssh://, sftp://, docker://<id>/<path> or
    /// k8s://<namespace>/<pod>/<path>
    #[structopt()]
    destination: Option<String>,

    /// Global bandwidth limit per second (e.g. "10MB", binary units), 0 means unlimited
    #[structopt(long, default_value = "0")]
    rate_limit: String,

    /// Maximum number of concurrent transfers
    #[structopt(long, default_value = "4")]
    max_parallelism: usize,

    /// Retries per job after a transient failure
    #[structopt(long, default_value = "3")]
    max_retries: u32,

    /// Exit on first permanently failed job
    #[structopt(short = "-e", long = "fail-early")]
    fail_early: bool,

    /// Working-set cap (e.g. "2GB"); exceeding it throttles parallelism
    #[structopt(long)]
    max_memory: Option<String>,

    /// Read `source|destination` pairs from this file instead of the positionals
    #[structopt(long)]
    job_list: Option<std::path::PathBuf>,

    /// Re-run the jobs recorded in a failed-job stream from a previous run
    #[structopt(long)]
    retry_failed: Option<std::path::PathBuf>,

    /// Enumerate what would be copied without copying anything
    #[structopt(long)]
    dry_run: bool,

    /// Recursively delete the source after a fully successful run
    #[structopt(long)]
    delete_source: bool,

    /// Shell command executed after a fully successful run
    #[structopt(long)]
    on_completion: Option<String>,

    /// Emit a progress report to stderr while copying.
    #[structopt(long)]
    progress: bool,

    /// Delay between progress reports, e.g. "200ms", "10s" (implies --progress)
    #[structopt(long)]
    progress_delay: Option<String>,

    /// Directory for the journal and the failed-job stream
    #[structopt(long, default_value = ".")]
    state_dir: std::path::PathBuf,

    /// Validate SFTP server host keys against ~/.ssh/known_hosts
    #[structopt(long)]
    verify_host_keys: bool,

    /// SSH identity file tried before auto-discovered keys
    #[structopt(long)]
    identity_file: Option<std::path::PathBuf>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR))
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,

    /// Print summary at the end
    #[structopt(long)]
    summary: bool,

    /// Number of worker threads, 0 means number of cores
    #[structopt(long, default_value = "0")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[structopt(long, default_value = "0")]
    max_blocking_threads: usize,
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<controller::RunSummary> {
    let rate_limit = common::config::parse_size(&args.rate_limit)
        .map_err(|error| anyhow!("--rate-limit: {error}"))?;
    let max_memory = args
        .max_memory
        .as_deref()
        .map(common::config::parse_size)
        .transpose()
        .map_err(|error| anyhow!("--max-memory: {error}"))?;

    let (spec, destination) = if let Some(recovery_file) = &args.retry_failed {
        (
            common::producer::SourceSpec::RetryList(recovery_file.clone()),
            String::new(),
        )
    } else if let Some(job_list) = &args.job_list {
        (
            common::producer::SourceSpec::JobList(job_list.clone()),
            String::new(),
        )
    } else {
        let source = args
            .source
            .as_deref()
            .ok_or_else(|| anyhow!("a source path is required (or use --job-list / --retry-failed)"))?;
        let destination = args
            .destination
            .as_deref()
            .ok_or_else(|| anyhow!("a destination is required"))?;
        let spec = common::producer::SourceSpec::for_path(std::path::Path::new(source)).await?;
        (spec, destination.to_string())
    };

    let progress_delay = match &args.progress_delay {
        Some(delay) => common::config::parse_duration(delay)
            .map_err(|error| anyhow!("--progress-delay: {error}"))?,
        None => common::config::CopyOptions::default().progress_delay,
    };
    let options = common::config::CopyOptions {
        rate_limit,
        max_memory,
        max_parallelism: args.max_parallelism,
        max_retries: args.max_retries,
        stop_on_error: args.fail_early,
        dry_run: args.dry_run,
        delete_source: args.delete_source,
        on_completion: args.on_completion.clone(),
        state_dir: args.state_dir.clone(),
        progress: args.progress || args.progress_delay.is_some(),
        progress_delay,
    };
    let sftp_options = transport::SftpOptions {
        verify_host_keys: args.verify_host_keys,
        identity_file: args.identity_file.clone(),
        ..transport::SftpOptions::default()
    };

    let cancel = tokio_util::sync::CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                event!(Level::WARN, "interrupt received, stopping transfers");
                cancel.cancel();
            }
        });
    }

    controller::execute(spec, destination, options, sftp_options, None, cancel)
        .await
        .context("copy run failed")
}

fn main() {
    let args = Args::from_args();
    let output = common::config::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::config::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    match common::run(&runtime, &output, func) {
        None => std::process::exit(1),
        Some(summary) => {
            if summary.cancelled {
                std::process::exit(130);
            }
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
    }
}
