//! CLI binary for mdwb-capture.
//!
//! A thin shim over the library crate: `mdwb replay` feeds a recorded
//! full-page screenshot through the whole pipeline, `mdwb policies` prints
//! the OCR policy table in effect.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_llm::ProviderFactory;
use indicatif::{ProgressBar, ProgressStyle};
use mdwb_capture::{
    cancel_pair, CaptureConfig, FsStore, HttpRecognizer, JobState, ManifestWarning, MemoryStore, OcrSettings,
    Pipeline, PipelineSettings, PolicyName, PolicyTable, ProgressSink, RecognitionService, StaticPageDriver,
    VisionRecognizer,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Spinner while capturing, then a per-tile bar while OCR runs.
struct CliProgress {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Pending");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl ProgressSink for CliProgress {
    fn on_stage(&self, state: JobState) {
        self.bar.set_prefix(state.to_string());
    }

    fn on_frames_captured(&self, frames: usize) {
        self.bar.println(format!("  {} {} viewport frames", green("✓"), frames));
    }

    fn on_tiles_ready(&self, tiles: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} tiles  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(tiles as u64);
        self.bar.reset_eta();
    }

    fn on_tile_recognized(&self, tile: usize, _total: usize, policy: PolicyName, attempts: u32) {
        if attempts > 1 {
            self.bar.println(format!(
                "  {} tile_{:04}  {}",
                yellow("↻"),
                tile,
                dim(&format!("{policy}, {attempts} attempts"))
            ));
        }
        self.bar.inc(1);
    }

    fn on_tile_failed(&self, tile: usize, _total: usize, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg = if error.len() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!("  {} tile_{:04}  {}", red("✗"), tile, red(&msg)));
        self.bar.inc(1);
    }

    fn on_warning(&self, warning: &ManifestWarning) {
        if warning.code.degrades() {
            self.bar.println(format!("  {} {}", yellow("⚠"), warning));
        }
    }

    fn on_job_finished(&self, state: JobState, degraded: bool) {
        self.bar.finish_and_clear();
        let mark = match state {
            JobState::Complete if !degraded => green("✔"),
            JobState::Failed => red("✘"),
            _ => yellow("⚠"),
        };
        let failed = self.failed.load(Ordering::SeqCst);
        if failed > 0 {
            eprintln!("{} {}  ({} tiles failed)", mark, bold(state.as_str()), failed);
        } else {
            eprintln!("{} {}", mark, bold(state.as_str()));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Replay a recorded full-page screenshot through an olmOCR server
  mdwb replay page.png -o page.md

  # Same, with the DOM snapshot for links and heading levels
  mdwb replay page.png --dom page.html --url https://example.com/docs

  # Keep artifacts (manifest, tiles, frames) and reuse them on the next run
  mdwb replay page.png --store ./artifacts --manifest manifest.json

  # Use a vision LLM through edgequake-llm instead of an OCR server
  mdwb replay page.png --provider openai --model gpt-4.1-mini

ENVIRONMENT VARIABLES:
  MDWB_OCR_API_KEY               Bearer key for OCR servers
  MDWB_OCR_OLMOCR_FP8_URL        Endpoint for the olmocr-fp8 policy
  MDWB_OCR_OLMOCR_BF16_URL       Endpoint for the olmocr-bf16 policy
  MDWB_OCR_GLM_URL               Endpoint for the glm-ocr policy
  MDWB_OCR_GLOBAL_CONCURRENCY    Process-wide in-flight OCR ceiling (default 16)
  RUST_LOG                       Log filter (e.g. mdwb_capture=debug)
"#;

/// Capture web pages to provenance-annotated Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "mdwb",
    version,
    about = "Capture web pages to provenance-annotated Markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "MDWB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "MDWB_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recorded full-page screenshot through the pipeline.
    Replay(ReplayArgs),
    /// Print the OCR policy table (after environment overrides).
    Policies,
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Full-page PNG/JPEG screenshot (device pixels).
    page: PathBuf,

    /// Serialised DOM captured alongside the screenshot.
    #[arg(long)]
    dom: Option<PathBuf>,

    /// URL the page was captured from (defaults to the screenshot's file URL).
    #[arg(long, env = "MDWB_URL")]
    url: Option<String>,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "MDWB_OUTPUT")]
    output: Option<PathBuf>,

    /// Write the job manifest (JSON) to this file.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Artifact store directory; omitted means an in-memory store.
    #[arg(long, env = "MDWB_STORE")]
    store: Option<PathBuf>,

    /// Viewport width in CSS px.
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Viewport height in CSS px.
    #[arg(long, default_value_t = 2000)]
    height: u32,

    /// Device pixel ratio the screenshot was taken at.
    #[arg(long, default_value_t = 1.0)]
    dpr: f32,

    /// Rows shared between consecutive viewports, CSS px.
    #[arg(long, default_value_t = 120)]
    overlap: u32,

    /// Primary OCR policy: olmocr-fp8, olmocr-bf16, glm-ocr.
    #[arg(long, env = "MDWB_OCR_POLICY", default_value = "olmocr-fp8")]
    policy: PolicyName,

    /// Smallest AIMD window.
    #[arg(long, default_value_t = 2)]
    min_concurrency: usize,

    /// Largest AIMD window.
    #[arg(long, default_value_t = 8)]
    max_concurrency: usize,

    /// Per-request OCR timeout in seconds.
    #[arg(long, default_value_t = 60)]
    ocr_timeout: u64,

    /// Whole-job timeout in seconds.
    #[arg(long, default_value_t = 600)]
    job_timeout: u64,

    /// edgequake-llm provider; switches OCR to a vision LLM.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model for `--provider`.
    #[arg(long, env = "EDGEQUAKE_MODEL", default_value = "gpt-4.1-mini")]
    model: String,

    /// Skip the links appendix.
    #[arg(long)]
    no_links: bool,

    /// Disable progress bar.
    #[arg(long, env = "MDWB_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet
        && match &cli.command {
            Command::Replay(args) => !args.no_progress,
            Command::Policies => false,
        };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Policies => print_policies(),
        Command::Replay(args) => replay(args, show_progress, cli.quiet).await,
    }
}

fn print_policies() -> Result<()> {
    let table = PolicyTable::from_env();
    for name in PolicyName::ALL {
        if let Some(p) = table.get(name) {
            println!(
                "{:<12} {:<36} max {:>4}px  ceiling {:>2}  fallback {}",
                bold(name.as_str()),
                p.model,
                p.max_tile_dimension,
                p.concurrency_ceiling,
                p.fallback.map(|f| f.as_str()).unwrap_or("-"),
            );
            println!("{:<12} {}", "", dim(&p.endpoint));
        }
    }
    Ok(())
}

fn default_url(page: &Path) -> Result<String> {
    let abs = std::fs::canonicalize(page).with_context(|| format!("Cannot resolve {:?}", page))?;
    url::Url::from_file_path(&abs)
        .map(|u| u.to_string())
        .map_err(|_| anyhow::anyhow!("Cannot build a file URL for {:?}", abs))
}

async fn replay(args: ReplayArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let dom = match &args.dom {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read DOM snapshot from {:?}", path))?,
        None => String::new(),
    };
    let url = match &args.url {
        Some(u) => u.clone(),
        None => default_url(&args.page)?,
    };

    let config = CaptureConfig::builder(url)
        .viewport(args.width, args.height)
        .device_scale_factor(args.dpr)
        .overlap_px(args.overlap)
        .settle_delay_ms(0)
        .build()
        .context("Invalid capture configuration")?;

    let settings = PipelineSettings {
        ocr: OcrSettings {
            policy: args.policy,
            min_concurrency: args.min_concurrency,
            max_concurrency: args.max_concurrency,
            request_timeout_ms: args.ocr_timeout * 1000,
            ..OcrSettings::default()
        },
        job_timeout_ms: args.job_timeout * 1000,
        links_appendix: !args.no_links,
        ..PipelineSettings::default()
    };

    let timeout = Duration::from_secs(args.ocr_timeout);
    let recognizer: Arc<dyn RecognitionService> = match &args.provider {
        Some(provider) => {
            let llm = ProviderFactory::create_llm_provider(provider, &args.model)
                .map_err(|e| anyhow::anyhow!("Provider '{}' not configured: {}", provider, e))?;
            Arc::new(VisionRecognizer::new(llm))
        }
        None => Arc::new(HttpRecognizer::from_env(timeout).context("Failed to build OCR client")?),
    };

    let mut pipeline = Pipeline::new(recognizer)
        .with_settings(settings)
        .with_policies(PolicyTable::from_env());
    pipeline = match &args.store {
        Some(dir) => pipeline.with_store(Arc::new(FsStore::new(dir))),
        None => pipeline.with_store(Arc::new(MemoryStore::new())),
    };
    if show_progress {
        pipeline = pipeline.with_progress(CliProgress::new());
    }

    let mut driver = StaticPageDriver::from_file(&args.page, dom).context("Failed to load page image")?;

    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let report = pipeline
        .run(&config, &mut driver, &cancel)
        .await
        .context("Capture failed")?;

    if let Some(path) = &args.manifest {
        let json = serde_json::to_string_pretty(&report.manifest).context("Failed to serialise manifest")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write manifest to {:?}", path))?;
    }

    match &args.output {
        Some(path) => tokio::fs::write(path, report.markdown())
            .await
            .with_context(|| format!("Failed to write Markdown to {:?}", path))?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(report.markdown().as_bytes())
                .context("Failed to write to stdout")?;
        }
    }

    if !quiet {
        let m = &report.manifest;
        eprintln!(
            "   {} frames  /  {} tiles  /  {} blocks  /  {} warnings{}",
            m.frames.len(),
            m.tiles.len(),
            m.blocks.len(),
            m.warnings.len(),
            if report.cache_hit { dim("  (cache hit)") } else { String::new() },
        );
        if !show_progress {
            for w in &m.warnings {
                eprintln!("   {} {}", yellow("⚠"), w);
            }
        }
        eprintln!("   key {}", dim(report.cache_key.as_str()));
    }
    Ok(())
}
