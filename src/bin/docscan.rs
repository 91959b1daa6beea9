//! CLI binary for docscan.
//!
//! A thin shim over the library crate: loads the YAML configuration, applies
//! flag overrides, and runs one job inline or one of the diagnostic
//! subcommands.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use docscan::pipeline::device::DeviceController;
use docscan::pipeline::filter;
use docscan::{
    ColorMode, HttpDeliveryAgent, ImageFormat, JobCoordinator, JobOverrides,
    JobProgressCallback, JobSummary, LogicalSource, ProgressCallback, SaneDevice, ScanConfig,
    ScanConfigBuilder,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

// ── CLI progress callback using indicatif ────────────────────────────────

/// Spinner while the scanner runs, one line per classified page.
struct CliProgressCallback {
    bar: ProgressBar,
    blank: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Scanning");
        bar.set_message("Waiting for the scanner…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            blank: AtomicUsize::new(0),
        })
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job_id: &str) {
        self.bar
            .println(format!("{} {}", cyan("◆"), bold(&format!("Job {job_id}"))));
    }

    fn on_capture_complete(&self, pages: usize) {
        self.bar.set_prefix("Filtering");
        self.bar.set_message(format!("{pages} pages captured"));
    }

    fn on_page_classified(&self, index: usize, total: usize, kept: bool) {
        if kept {
            self.bar
                .println(format!("  {} Page {:>3}/{:<3}", green("✓"), index, total));
        } else {
            self.blank.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} Page {:>3}/{:<3}  {}",
                dim("○"),
                index,
                total,
                dim("blank, dropped")
            ));
        }
    }

    fn on_delivery_start(&self, pages: usize) {
        self.bar.set_prefix("Uploading");
        self.bar.set_message(format!("{pages} pages"));
    }

    fn on_job_complete(&self, _summary: &JobSummary) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Scan from the feeder with the configured defaults
  docscan scan

  # Flatbed, grayscale, keep blank pages
  docscan scan --source flatbed --mode gray --no-skip-blank

  # Append pages to an existing document
  docscan scan --doc-id 6f1c2a --document-type invoice

  # Capture and filter only; pages stay in the job directory
  docscan scan --no-upload

  # Is the document API reachable with this token?
  docscan check-api

  # Which concrete source does "ADF" map to on this device?
  docscan sources

  # Tune the blank threshold on sample pages
  docscan classify samples/*.png --blank-threshold 0.02

CONFIGURATION:
  Searched in order: --config, $DOCSCAN_CONFIG, ./config/config.yaml,
  /etc/docscan/config.yaml. Print the effective values with `docscan config`.

ENVIRONMENT VARIABLES:
  DOCSCAN_CONFIG     Path to the YAML configuration file
  DOCSCAN_DEVICE     SANE device identifier (scanimage -L)
  DOCSCAN_API_URL    Document API base URL
  DOCSCAN_TOKEN      Bearer token for the document API
  RUST_LOG           Log filter, e.g. docscan=debug
"#;

/// Scan documents from a SANE scanner and upload them.
#[derive(Parser, Debug)]
#[command(
    name = "docscan",
    version,
    about = "Scan documents from a SANE scanner, drop blank pages, and upload them",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, global = true, env = "DOCSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Errors only; no progress output.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scan job and upload the result.
    Scan(ScanArgs),
    /// Show the device's sources and how logical names resolve.
    Sources(DeviceArgs),
    /// Run the blank-page filter on existing images.
    Classify(ClassifyArgs),
    /// Check that the document API answers for the configured workspace.
    CheckApi(ApiArgs),
    /// Print the effective configuration (token redacted).
    Config,
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// SANE device identifier.
    #[arg(long, env = "DOCSCAN_DEVICE")]
    device: Option<String>,
}

#[derive(Args, Debug)]
struct ApiArgs {
    /// Document API base URL.
    #[arg(long, env = "DOCSCAN_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the document API.
    #[arg(long, env = "DOCSCAN_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    device: DeviceArgs,

    /// auto, adf, flatbed, or a device-specific source name.
    #[arg(short, long)]
    source: Option<String>,

    /// Resolution in DPI.
    #[arg(short, long)]
    resolution: Option<u32>,

    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Keep blank pages.
    #[arg(long)]
    no_skip_blank: bool,

    /// Keep the job directory after a successful upload.
    #[arg(long)]
    keep_files: bool,

    /// Capture and filter, but do not upload. Implies --keep-files.
    #[arg(long)]
    no_upload: bool,

    /// Append to an existing document.
    #[arg(long)]
    doc_id: Option<String>,

    #[arg(long)]
    document_type: Option<String>,

    /// JSON object sent as the `meta` field.
    #[arg(long)]
    meta: Option<String>,

    /// JSON object sent as the `properties` field.
    #[arg(long)]
    properties: Option<String>,

    #[command(flatten)]
    api: ApiArgs,

    /// Print the job summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Image files to analyse.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Luma below this counts as non-white.
    #[arg(long)]
    white_threshold: Option<u8>,

    /// A page is kept when its non-white fraction exceeds this.
    #[arg(long)]
    blank_threshold: Option<f64>,

    #[arg(long)]
    json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Color,
    Gray,
    Lineart,
}

impl From<ModeArg> for ColorMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Color => ColorMode::Color,
            ModeArg::Gray => ColorMode::Gray,
            ModeArg::Lineart => ColorMode::Lineart,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Jpeg,
    Tiff,
}

impl From<FormatArg> for ImageFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Png => ImageFormat::Png,
            FormatArg::Jpeg => ImageFormat::Jpeg,
            FormatArg::Tiff => ImageFormat::Tiff,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner already reports progress; library INFO lines would
    // interleave with it.
    let spinner = matches!(cli.command, Command::Scan(ref a) if !a.json) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || spinner {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = ScanConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Scan(args) => run_scan(config, args, spinner && !cli.verbose).await,
        Command::Sources(args) => run_sources(config, args).await,
        Command::Classify(args) => run_classify(&config, args),
        Command::CheckApi(args) => run_check_api(config, args).await,
        Command::Config => {
            let yaml = serde_yaml::to_string(&config.redacted())
                .context("Failed to serialise configuration")?;
            print!("{yaml}");
            Ok(())
        }
    }
}

fn with_device(config: ScanConfig, device: &DeviceArgs) -> ScanConfigBuilder {
    let builder = ScanConfigBuilder::from_config(config);
    match device.device {
        Some(ref d) => builder.device(d.clone()),
        None => builder,
    }
}

fn with_api(builder: ScanConfigBuilder, api: &ApiArgs) -> ScanConfigBuilder {
    let mut builder = builder;
    if let Some(ref url) = api.api_url {
        builder = builder.api_url(url.clone());
    }
    if let Some(ref token) = api.token {
        builder = builder.token(token.clone());
    }
    builder
}

fn parse_json_arg(name: &str, value: Option<&str>) -> Result<Option<serde_json::Value>> {
    value
        .map(|v| serde_json::from_str(v).with_context(|| format!("--{name} is not valid JSON")))
        .transpose()
}

async fn run_scan(config: ScanConfig, args: ScanArgs, show_progress: bool) -> Result<()> {
    // ── Build config ─────────────────────────────────────────────────────
    let config = with_api(with_device(config, &args.device), &args.api)
        .build()
        .context("Invalid configuration")?;
    let temp_dir = config.storage.temp_dir.clone();

    let overrides = JobOverrides {
        source: args.source.map(LogicalSource::from),
        resolution: args.resolution,
        mode: args.mode.map(Into::into),
        format: args.format.map(Into::into),
        skip_blank: args.no_skip_blank.then_some(false),
        keep_files: args.keep_files.then_some(true),
        upload: args.no_upload.then_some(false),
        doc_id: args.doc_id,
        meta: parse_json_arg("meta", args.meta.as_deref())?,
        document_type: args.document_type,
        properties: parse_json_arg("properties", args.properties.as_deref())?,
    };

    let mut coordinator =
        JobCoordinator::from_config(config).context("Failed to set up the scan pipeline")?;
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        coordinator = coordinator.with_progress(cb);
    }

    // ── Run job ──────────────────────────────────────────────────────────
    let summary = coordinator
        .run_job(overrides)
        .await
        .context("Scan job could not start")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else {
        print_summary(&summary);
        if args.no_upload && summary.succeeded() && summary.pages_captured > 0 {
            eprintln!(
                "  Kept in:    {}",
                temp_dir.join(&summary.job_id).display()
            );
        }
    }

    if !summary.succeeded() {
        bail!(
            "scan job {} failed: {}",
            summary.job_id,
            summary.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_summary(s: &JobSummary) {
    let mark = if s.succeeded() { green("✔") } else { red("✘") };
    eprintln!(
        "{} Job {}  {}  {}",
        mark,
        bold(&s.job_id),
        format!("{:?}", s.state).to_lowercase(),
        dim(&format!("{:.1}s", s.duration_ms as f64 / 1000.0))
    );
    if let Some(ref source) = s.source {
        eprintln!("  Source:     {source}");
    }
    eprintln!(
        "  Pages:      {} captured, {} kept{}",
        s.pages_captured,
        s.pages_kept,
        if s.dropped_pages.is_empty() {
            String::new()
        } else {
            format!("  (blank: {:?})", s.dropped_pages)
        }
    );
    if let Some(ref upload) = s.upload {
        if let Some(ref doc) = upload.doc_id {
            eprintln!("  Document:   {doc}");
        }
        if upload.error.is_none() {
            eprintln!("  Uploaded:   {} pages", upload.pages_added);
        }
    }
    if let Some(ref error) = s.error {
        eprintln!("  Error:      {}", red(error));
    }
    if let Some(ref q) = s.quarantine_path {
        eprintln!("  Quarantine: {}", q.display());
    }
}

async fn run_sources(config: ScanConfig, args: DeviceArgs) -> Result<()> {
    let config = with_device(config, &args)
        .build()
        .context("Invalid configuration")?;
    let device = SaneDevice::from_config(&config)?;
    let controller = DeviceController::new(Arc::new(device));

    let description = controller
        .describe_device()
        .await
        .context("Failed to query the scanner")?;

    println!("Device:  {}", description.device);
    if description.sources.is_empty() {
        println!("Sources: {}", dim("(none reported; the device default is used)"));
    } else {
        println!("Sources: {}", description.sources.join(" | "));
    }
    println!();
    for logical in [LogicalSource::Auto, LogicalSource::Adf, LogicalSource::Flatbed] {
        match description.resolve(&logical) {
            Ok(Some(concrete)) => println!("  {:<8} → {}", logical.to_string(), green(&concrete)),
            Ok(None) => println!("  {:<8} → {}", logical.to_string(), dim("device default")),
            Err(_) => println!("  {:<8} → {}", logical.to_string(), red("unsupported")),
        }
    }
    Ok(())
}

async fn run_check_api(config: ScanConfig, args: ApiArgs) -> Result<()> {
    let config = with_api(ScanConfigBuilder::from_config(config), &args)
        .build()
        .context("Invalid configuration")?;
    let agent = HttpDeliveryAgent::new(&config.api, &config.upload)?;

    match agent.check_connection().await {
        Ok(check) => {
            println!(
                "{} {}  {}",
                green("✔"),
                check.url,
                dim(&format!("HTTP {}", check.status))
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", red("✘"), agent.api_root_url());
            bail!("document API check failed: {e}")
        }
    }
}

fn run_classify(config: &ScanConfig, args: ClassifyArgs) -> Result<()> {
    let mut settings = config.processing.clone();
    if let Some(t) = args.white_threshold {
        settings.white_threshold = t;
    }
    if let Some(t) = args.blank_threshold {
        settings.blank_threshold = t;
    }

    let mut reports = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match filter::inspect_page(path, &settings) {
            Ok(report) => reports.push(report),
            Err(e) => eprintln!("{} {}", red("✗"), e),
        }
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise results")?
        );
        return Ok(());
    }

    println!(
        "{}",
        dim(&format!(
            "white < {}, blank ≤ {:.3}",
            settings.white_threshold, settings.blank_threshold
        ))
    );
    for r in &reports {
        println!(
            "{} {:<40} {:>5}×{:<5} mean {:>6.1}  non-white {:.4}",
            if r.kept { green("keep ") } else { dim("blank") },
            r.path.display(),
            r.width,
            r.height,
            r.mean_luma,
            r.non_white_fraction
        );
    }
    Ok(())
}
