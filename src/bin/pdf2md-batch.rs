//! CLI binary for edgequake-batch.
//!
//! A thin shim over the library crate that maps CLI flags to `BatchConfig`,
//! opens the source and destination stores, and prints the outcome.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_batch::progress::{self, batch_id_from, progress_path};
use edgequake_batch::report::{self, Report};
use edgequake_batch::{
    BatchConfig, BatchProgressCallback, Dispatcher, DispatcherState, HttpBackend, Location,
    ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per finished
/// job. Jobs finish out of order, so start times are tracked per key.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    retries: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Listing source objects…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            retries: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>5}/{len} files  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, key: &str) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_jobs: usize, resumed: bool) {
        self.activate_bar(total_jobs);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "{} {total_jobs} file(s)…",
                if resumed { "Resuming with" } else { "Starting" }
            ))
        ));
    }

    fn on_state_change(&self, state: DispatcherState) {
        if state == DispatcherState::Draining {
            self.bar.set_message("waiting for in-flight jobs");
        }
    }

    fn on_job_start(&self, key: &str, _endpoint: &str) {
        // Keep the first attempt's start time so retries count toward elapsed.
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(key.to_string())
            .or_insert_with(Instant::now);
        self.bar.set_message(key.to_string());
    }

    fn on_job_retry(&self, key: &str, attempt: u32, error: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}  {}",
            yellow("↻"),
            key,
            dim(&format!("attempt {attempt} failed: {}", truncate(error, 80))),
        ));
    }

    fn on_job_complete(&self, key: &str, chars_extracted: usize) {
        let elapsed = self.elapsed_secs(key);
        self.bar.println(format!(
            "  {} {}  {}  {}",
            green("✓"),
            key,
            dim(&format!("{chars_extracted:>7} chars")),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_job_error(&self, key: &str, error: &str) {
        let elapsed = self.elapsed_secs(key);
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            key,
            red(&truncate(error, 80)),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        self.bar.finish_and_clear();
        let retries = self.retries.load(Ordering::SeqCst);
        let total = succeeded + failed;
        if failed == 0 {
            eprintln!(
                "{} {} file(s) extracted  {}",
                green("✔"),
                bold(&succeeded.to_string()),
                dim(&format!("{retries} retries"))
            );
        } else {
            eprintln!(
                "{} {}/{} file(s) extracted  ({} failed, {})",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total,
                red(&failed.to_string()),
                dim(&format!("{retries} retries"))
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Two local conversion servers, bucket to bucket
  pdf2md-batch run s3://llm4eo/MS2/sample/pdfs/ s3://llm4eo/raw_data_extractions \
      --server http://127.0.0.1:8002/predict/ --server http://127.0.0.1:8003/predict/

  # Local directories, HTML sources, 8 workers
  pdf2md-batch run ./pages ./markdown --ext html --workers 8 \
      --server http://gpu-1:8002/predict/

  # Show what a (resumed) run would do without sending anything
  pdf2md-batch run s3://llm4eo/MS2/pdfs/ s3://llm4eo/md --server http://127.0.0.1:8002/predict/ --dry-run

  # Second pass over the failures of a finished batch
  pdf2md-batch run s3://llm4eo/MS2/pdfs/ s3://llm4eo/md --server http://127.0.0.1:8002/predict/ --retry-failed

  # Same, but keep re-run output apart from the first pass
  pdf2md-batch run s3://llm4eo/MS2/pdfs/ s3://llm4eo/md --server http://127.0.0.1:8002/predict/ \
      --retry-failed --retry-destination s3://llm4eo/md_retry

  # Regenerate the report of an existing batch
  pdf2md-batch report s3://llm4eo/MS2/pdfs/

RESUMING:
  Progress is saved to extraction_progress_<batch>.json after every file.
  Re-running the same command picks up the pending files; completed files
  are never converted twice. Failed files are only retried with --retry-failed.

ENVIRONMENT VARIABLES:
  PDF2MD_BATCH_SERVERS      Comma-separated conversion endpoints
  PDF2MD_BATCH_WORKERS      Concurrent workers
  PDF2MD_BATCH_TIMEOUT      Per-call timeout in seconds
  PDF2MD_BATCH_S3_ENDPOINT  S3-compatible endpoint URL (MinIO, Ceph)
  AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY / AWS_REGION
                            Bucket credentials (standard AWS chain)
  RUST_LOG                  Log filter, overrides --verbose/--quiet
"#;

/// Resumable batch extraction of PDF/HTML documents to Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-batch",
    version,
    about = "Resumable batch PDF/HTML-to-Markdown extraction across conversion servers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2MD_BATCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2MD_BATCH_QUIET")]
    quiet: bool,

    /// Also append logs to this file (always at INFO or above).
    #[arg(long, global = true, env = "PDF2MD_BATCH_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract every document under SOURCE into DESTINATION.
    Run(RunArgs),
    /// Print the report of an existing batch.
    Report(ReportArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source location: s3://bucket/prefix or a local directory.
    source: String,

    /// Destination location: s3://bucket/prefix or a local directory.
    destination: String,

    /// Conversion endpoint URL; repeat for several servers.
    #[arg(
        short,
        long = "server",
        env = "PDF2MD_BATCH_SERVERS",
        value_delimiter = ',',
        required = true
    )]
    servers: Vec<String>,

    /// Number of concurrent workers.
    #[arg(short, long, env = "PDF2MD_BATCH_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Per-call backend timeout in seconds.
    #[arg(long, env = "PDF2MD_BATCH_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Retries after the first attempt on unreachable/timeout.
    #[arg(long, env = "PDF2MD_BATCH_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial retry delay in milliseconds (doubles each retry).
    #[arg(long, env = "PDF2MD_BATCH_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,

    /// Minimum characters for an extraction to count as a success.
    #[arg(long, env = "PDF2MD_BATCH_MIN_CHARS", default_value_t = 50)]
    min_chars: usize,

    /// Accepted source extension; repeat for several.
    #[arg(long = "ext", env = "PDF2MD_BATCH_EXTENSIONS", value_delimiter = ',', default_value = "pdf")]
    extensions: Vec<String>,

    /// Directory for progress and report files.
    #[arg(long, env = "PDF2MD_BATCH_PROGRESS_DIR", default_value = ".")]
    progress_dir: PathBuf,

    /// Explicit batch id (default: derived from SOURCE).
    #[arg(long, env = "PDF2MD_BATCH_ID")]
    batch_id: Option<String>,

    /// On resume, also re-run files recorded as failed.
    #[arg(long, env = "PDF2MD_BATCH_RETRY_FAILED")]
    retry_failed: bool,

    /// Destination for re-run failures (with --retry-failed): a prefix in the
    /// same bucket as DESTINATION, or a subdirectory of a local DESTINATION.
    #[arg(long, env = "PDF2MD_BATCH_RETRY_DESTINATION", requires = "retry_failed")]
    retry_destination: Option<String>,

    /// Do not upload the report next to the Markdown output.
    #[arg(long, env = "PDF2MD_BATCH_NO_PUBLISH_REPORT")]
    no_publish_report: bool,

    /// S3-compatible endpoint URL for bucket locations.
    #[arg(long, env = "PDF2MD_BATCH_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// Print the job set and exit without converting anything.
    #[arg(long)]
    dry_run: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2MD_BATCH_NO_PROGRESS")]
    no_progress: bool,

    /// Print the final report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Source location the batch was run on (used to derive the batch id).
    source: Option<String>,

    /// Explicit batch id instead of SOURCE.
    #[arg(long, env = "PDF2MD_BATCH_ID")]
    batch_id: Option<String>,

    /// Directory holding the progress file.
    #[arg(long, env = "PDF2MD_BATCH_PROGRESS_DIR", default_value = ".")]
    progress_dir: PathBuf,

    /// Also write processing_report_<batch>.json next to the progress file.
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs on the terminal while the progress
    // bar is active; the bar provides all the feedback that matters.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress && !args.json && !args.dry_run,
        Command::Report(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    init_logging(filter, cli.log_file.as_deref(), cli.verbose)?;

    match cli.command {
        Command::Run(args) => run(args, cli.quiet, show_progress).await,
        Command::Report(args) => print_report(args).await,
    }
}

/// stderr at `filter` (or `RUST_LOG`), plus an optional plain-text log file.
fn init_logging(filter: &str, log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_filter(stderr_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let file_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

async fn run(args: RunArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let source = Location::parse(&args.source).context("Invalid source location")?;
    let destination = Location::parse(&args.destination).context("Invalid destination location")?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };
    let config = build_config(&args, &source, &destination, progress_cb)?;

    let source_store = source
        .open(args.s3_endpoint.as_deref())
        .await
        .context("Failed to open source store")?;
    let destination_store = destination
        .open(args.s3_endpoint.as_deref())
        .await
        .context("Failed to open destination store")?;

    let dispatcher = Dispatcher::new(
        config,
        source_store,
        destination_store,
        Arc::new(HttpBackend::new()),
    );

    // ── Dry run ──────────────────────────────────────────────────────────
    if args.dry_run {
        let plan = dispatcher.plan().await.context("Failed to plan batch")?;
        println!("Batch:     {}", plan.batch_id);
        println!("Progress:  {}", plan.progress_path.display());
        println!(
            "Mode:      {}",
            if plan.resumed { "resume" } else { "fresh" }
        );
        println!(
            "Jobs:      {} to run ({} processed, {} failed already recorded)",
            plan.jobs.len(),
            plan.record.processed.len(),
            plan.record.failed.len()
        );
        for job in &plan.jobs {
            println!("  {}  →  {}", job.source_key, job.destination_key);
        }
        return Ok(());
    }

    // ── Run batch ────────────────────────────────────────────────────────
    let summary = dispatcher.run().await.context("Batch failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary.report).context("Failed to serialise report")?
        );
    } else if !quiet {
        if !show_progress {
            eprintln!(
                "Processed {} file(s) this run: {} succeeded, {} failed",
                summary.succeeded + summary.failed,
                summary.succeeded,
                summary.failed
            );
        }
        print_report_summary(&summary.report);
        eprintln!("   progress  {}", dim(&summary.progress_path.display().to_string()));
        if let Some(path) = &summary.report_path {
            eprintln!("   report    {}", dim(&path.display().to_string()));
        }
    }
    Ok(())
}

/// Map CLI args to `BatchConfig`.
fn build_config(
    args: &RunArgs,
    source: &Location,
    destination: &Location,
    progress: Option<ProgressCallback>,
) -> Result<BatchConfig> {
    let mut builder = BatchConfig::builder()
        .source_prefix(source.prefix())
        .destination_prefix(destination.prefix())
        .endpoints(args.servers.iter().map(|s| s.trim()).filter(|s| !s.is_empty()))
        .max_workers(args.workers)
        .timeout_secs(args.timeout)
        .max_retries(args.max_retries)
        .retry_backoff_ms(args.backoff_ms)
        .min_output_chars(args.min_chars)
        .extensions(&args.extensions)
        .progress_dir(args.progress_dir.clone())
        .retry_failed(args.retry_failed)
        .publish_report(!args.no_publish_report);

    // Name the batch after what the user typed, so local and bucket
    // sources get ids like `llm4eo_MS2_pdfs` rather than absolute paths.
    let batch_id = args
        .batch_id
        .clone()
        .unwrap_or_else(|| batch_id_from(&args.source));
    builder = builder.batch_id(batch_id);

    if let Some(retry) = &args.retry_destination {
        builder = builder.retry_destination_prefix(retry_prefix(retry, destination)?);
    }

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Key prefix of the retry destination inside the destination store: a
/// prefix of the same bucket, or a subdirectory of a local destination.
fn retry_prefix(retry: &str, destination: &Location) -> Result<String> {
    let retry_location = Location::parse(retry).context("Invalid retry destination")?;
    match (&retry_location, destination) {
        (Location::Bucket { bucket: a, prefix }, Location::Bucket { bucket: b, .. }) if a == b => {
            Ok(prefix.clone())
        }
        (Location::Local(r), Location::Local(d)) => {
            let relative = r.strip_prefix(d).with_context(|| {
                format!(
                    "--retry-destination {} must be inside {}",
                    r.display(),
                    d.display()
                )
            })?;
            Ok(relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"))
        }
        _ => anyhow::bail!("--retry-destination must be in the same bucket as DESTINATION"),
    }
}

async fn print_report(args: ReportArgs) -> Result<()> {
    let batch_id = match (&args.batch_id, &args.source) {
        (Some(id), _) => id.clone(),
        (None, Some(source)) => batch_id_from(source),
        (None, None) => anyhow::bail!("Pass either SOURCE or --batch-id"),
    };
    let path = progress_path(&args.progress_dir, &batch_id);
    let record = progress::load(&path)
        .await
        .context("Failed to load progress file")?
        .with_context(|| format!("No progress file at {}", path.display()))?;

    let report = report::generate(&record, &batch_id);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialise report")?
    );
    if args.save {
        report::save(&report, &args.progress_dir)
            .await
            .context("Failed to save report")?;
    }
    Ok(())
}

fn print_report_summary(report: &Report) {
    let m = &report.metadata;
    eprintln!(
        "{}  {}/{} succeeded ({})  {} pending",
        if m.error_count == 0 { green("✔") } else { cyan("⚠") },
        m.success_count,
        m.total_files,
        m.success_rate,
        m.pending_count
    );
    eprintln!(
        "   {} chars  /  {:.2}s avg  /  {:.2} files/min",
        dim(&report.processing_stats.total_characters_extracted.to_string()),
        report.processing_stats.average_processing_time_seconds,
        report.performance_metrics.files_per_minute
    );
    for class in report.error_details.error_taxonomy.iter().take(5) {
        eprintln!("   {} ×{}  {}", red("✗"), class.count, truncate(&class.message, 100));
    }
}
