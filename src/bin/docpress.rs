//! CLI binary for docpress.
//!
//! A thin shim over the library crate: `convert` turns HTML into a JSON
//! bundle (AST + manifest), `upload` re-hosts a bundle's images for one
//! destination, `inspect` summarises a bundle.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docpress::transform::{self, Pass};
use docpress::{
    convert_html, AssetStatus, ConversionOutput, ConvertOptions, CsrfTokenSource,
    StaticCsrfTokens, StrategyTable, UploadOptions, UploadPipeline, UploadProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

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

/// Terminal progress: a bar at the bottom and one log line per asset.
/// Assets complete out of order, so start times are keyed by asset id.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} assets  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Uploading");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, asset_id: &str) -> String {
        let ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(asset_id))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }
}

impl UploadProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_assets: usize) {
        self.bar.set_length(total_assets as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Uploading {total_assets} assets…"))
        ));
    }

    fn on_asset_start(&self, asset_id: &str, _original_url: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(asset_id.to_string(), Instant::now());
        }
        self.bar.set_message(asset_id.to_string());
    }

    fn on_asset_complete(&self, asset_id: &str, new_url: &str) {
        self.bar.println(format!(
            "  {} {:<10} {}  {}",
            green("✓"),
            asset_id,
            dim(new_url),
            self.elapsed(asset_id),
        ));
        self.bar.inc(1);
    }

    fn on_asset_error(&self, asset_id: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<10} {}  {}",
            red("✗"),
            asset_id,
            red(&msg),
            self.elapsed(asset_id),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_assets: usize, success_count: usize) {
        let failed = total_assets.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} assets uploaded",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} assets uploaded  ({} failed)",
                if failed == total_assets {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_assets,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a saved page into a bundle (AST + asset manifest)
  docpress convert page.html --base-url https://blog.example.com/post -o bundle.json

  # Re-host the bundle's images on a destination
  docpress upload bundle.json --strategies strategies.json --destination cms -o published.json

  # Retry only what failed last time (already uploaded entries are skipped)
  docpress upload published.json --strategies strategies.json --destination cms -o published.json

  # Summarise a bundle
  docpress inspect published.json

STRATEGY TABLE (strategies.json):
  {
    "cms":    { "mode": "binaryUpload", "uploadUrl": "https://cms.example.com/upload",
                "responseUrlPath": "data.url",
                "constraints": { "acceptedMimeTypes": ["image/jpeg", "image/png"], "maxSizeMB": 2 } },
    "wiki":   { "mode": "urlFetch", "fetchUrl": "https://wiki.example.com/api/fetch" },
    "mirror": { "mode": "externalUrlOnly" }
  }

ENVIRONMENT VARIABLES:
  DOCPRESS_BASE_URL       Base URL for relative links (convert)
  DOCPRESS_STRATEGIES     Strategy table path (upload)
  DOCPRESS_DESTINATION    Destination id (upload)
  DOCPRESS_CONCURRENCY    Assets in flight (upload, default 3)
  RUST_LOG                Overrides the log filter
"#;

/// Convert rendered documents to a canonical AST and publish their images.
#[derive(Parser, Debug)]
#[command(
    name = "docpress",
    version,
    about = "Convert rendered documents to a canonical AST and publish their images",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCPRESS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCPRESS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an HTML file (or `-` for stdin) into a JSON bundle.
    Convert {
        input: String,

        /// Base URL for resolving relative links and image sources.
        #[arg(long, env = "DOCPRESS_BASE_URL")]
        base_url: Option<String>,

        /// Keep unrecognised elements as raw HTML nodes.
        #[arg(long, env = "DOCPRESS_PRESERVE_HTML")]
        preserve_html: bool,

        /// Cleanup passes to run after conversion.
        #[arg(long, value_enum, default_value = "standard")]
        pipeline: PipelineArg,

        /// Mark tables with row/column spans as needing raw HTML.
        #[arg(long)]
        flag_tables: bool,

        /// JSON object mapping TeX source to a rendered image URL.
        #[arg(long)]
        tex_images: Option<PathBuf>,

        /// Write the bundle here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a bundle's images to one destination.
    Upload {
        bundle: PathBuf,

        /// Strategy table (JSON object keyed by destination id).
        #[arg(long, env = "DOCPRESS_STRATEGIES")]
        strategies: PathBuf,

        #[arg(long, env = "DOCPRESS_DESTINATION")]
        destination: String,

        /// Assets processed at once.
        #[arg(short, long, env = "DOCPRESS_CONCURRENCY", default_value_t = 3)]
        concurrency: usize,

        /// Per-request timeout in seconds.
        #[arg(long, env = "DOCPRESS_TIMEOUT", default_value_t = 30)]
        timeout: u64,

        /// Retries of a single request on timeouts and 5xx.
        #[arg(long, env = "DOCPRESS_MAX_RETRIES", default_value_t = 0)]
        max_retries: u32,

        /// Re-upload entries already uploaded to this destination.
        #[arg(long)]
        no_skip_uploaded: bool,

        /// CSRF cookie as `name=value` (repeatable).
        #[arg(long, value_parser = parse_key_value)]
        csrf_cookie: Vec<(String, String)>,

        /// CSRF meta tag as `name=value` (repeatable).
        #[arg(long, value_parser = parse_key_value)]
        csrf_meta: Vec<(String, String)>,

        /// Write the updated bundle here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the upload report (mapping + outcomes) as JSON.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Disable progress bar.
        #[arg(long, env = "DOCPRESS_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Summarise a bundle.
    Inspect {
        bundle: PathBuf,

        /// Print the manifest as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Debug)]
enum PipelineArg {
    Standard,
    None,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would fight with the progress bar; the bar is the
    // feedback that matters during uploads.
    let bar_active = matches!(
        cli.command,
        Command::Upload {
            no_progress: false,
            ..
        }
    ) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
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

    match cli.command {
        Command::Convert {
            input,
            base_url,
            preserve_html,
            pipeline,
            flag_tables,
            tex_images,
            output,
        } => {
            let html = read_input(&input)?;
            let mut builder = ConvertOptions::builder().preserve_unknown_html(preserve_html);
            if let Some(base) = base_url {
                builder = builder.base_url(base);
            }
            let options = builder.build().context("Invalid configuration")?;

            let out = convert_html(&html, &options);
            let mut passes: Vec<Pass> = Vec::new();
            if let PipelineArg::Standard = pipeline {
                passes.push(transform::standard());
            }
            if flag_tables {
                passes.push(Box::new(transform::flag_complex_tables));
            }
            if let Some(path) = tex_images {
                let map: HashMap<String, String> = serde_json::from_str(
                    &std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                )
                .with_context(|| format!("Invalid TeX image map {}", path.display()))?;
                passes.push(transform::math_to_image(map));
            }
            let mut root = transform::compose(passes)(out.root);
            let mut manifest = out.manifest;
            manifest.sync(&mut root);

            if !cli.quiet {
                eprintln!(
                    "{} {} blocks, {} images, {} formulas, {} embeds",
                    green("✔"),
                    root.children.len(),
                    manifest.images.len(),
                    manifest.formulas.len(),
                    manifest.embeds.len()
                );
            }
            write_json(&ConversionOutput { root, manifest }, output.as_deref())?;
        }

        Command::Upload {
            bundle,
            strategies,
            destination,
            concurrency,
            timeout,
            max_retries,
            no_skip_uploaded,
            csrf_cookie,
            csrf_meta,
            output,
            report,
            no_progress,
        } => {
            let mut doc = ConversionOutput::from_path(&bundle).context("Failed to load bundle")?;
            let table = StrategyTable::from_path(&strategies).context("Failed to load strategies")?;
            let strategy = table.get(&destination)?;

            let mut builder = UploadOptions::builder()
                .concurrency(concurrency)
                .timeout_secs(timeout)
                .max_retries(max_retries)
                .skip_uploaded(!no_skip_uploaded);
            if bar_active {
                builder = builder.progress_callback(
                    CliProgressCallback::new() as Arc<dyn UploadProgressCallback>
                );
            }
            let options = builder.build().context("Invalid configuration")?;

            let mut tokens = StaticCsrfTokens::new();
            for (k, v) in csrf_cookie {
                tokens = tokens.cookie(k, v);
            }
            for (k, v) in csrf_meta {
                tokens = tokens.meta(k, v);
            }
            let pipeline = UploadPipeline::new()?.csrf(Arc::new(tokens) as Arc<dyn CsrfTokenSource>);

            let result = pipeline
                .process(&mut doc.manifest, strategy, &destination, &options)
                .await
                .context("Upload failed")?;
            let rewritten = result.rewrite(&mut doc.root);

            if let Some(path) = report {
                write_json(&result, Some(&path))?;
            }
            write_json(&doc, output.as_deref())?;

            if !cli.quiet {
                let s = &result.stats;
                eprintln!(
                    "{}  {} uploaded, {} failed, {} skipped  {}ms  ({} image nodes rewritten)",
                    if s.failed == 0 { green("✔") } else { cyan("⚠") },
                    s.uploaded,
                    s.failed,
                    s.skipped,
                    s.duration_ms,
                    rewritten
                );
                for failure in result.failures() {
                    if let Some(ref e) = failure.error {
                        eprintln!("   {} {}  {}", red("✗"), failure.original_url, dim(&e.to_string()));
                    }
                }
            }
        }

        Command::Inspect { bundle, json } => {
            let doc = ConversionOutput::from_path(&bundle).context("Failed to load bundle")?;
            if json {
                write_json(&doc.manifest, None)?;
                return Ok(());
            }
            let m = &doc.manifest;
            println!("Bundle:     {}", bundle.display());
            println!("Blocks:     {}", doc.root.children.len());
            println!("Formulas:   {}", m.formulas.len());
            println!("Embeds:     {}", m.embeds.len());
            println!("Images:     {}", m.images.len());
            for status in [
                AssetStatus::Pending,
                AssetStatus::Uploaded,
                AssetStatus::Failed,
            ] {
                let n = m.images.iter().filter(|e| e.status == status).count();
                if n > 0 {
                    println!("  {:<10} {}", format!("{status:?}"), n);
                }
            }
            for entry in &m.images {
                let dest: Vec<&str> = entry.uploaded_to.iter().map(String::as_str).collect();
                println!(
                    "  {:<8} {:<9} {}{}",
                    entry.id,
                    format!("{:?}", entry.status).to_lowercase(),
                    entry.original_url,
                    if dest.is_empty() {
                        String::new()
                    } else {
                        format!("  → {}", dest.join(", "))
                    }
                );
            }
        }
    }

    Ok(())
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))
    }
}

/// Pretty JSON to `path`, or stdout.
fn write_json<T: serde::Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))
        }
        None => {
            let mut out = io::stdout().lock();
            writeln!(out, "{json}").context("Failed to write to stdout")
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{s}'"))
}
