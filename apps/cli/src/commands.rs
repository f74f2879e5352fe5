//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tenderscout_core::{
    ItemResult, JobProgress, JobRunner, Pipeline, StorageIdentityCache, render_markdown, ttl_days,
};
use tenderscout_providers::{MarketplaceSession, ScraperBridge};
use tenderscout_shared::{
    AppConfig, TenderItem, expand_home, init_config, load_config, load_config_from,
    validate_api_keys,
};
use tenderscout_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// TenderScout: find and defend the right marketplace offer for a tender item.
#[derive(Parser)]
#[command(
    name = "tenderscout",
    version,
    about = "Identify the exact product behind a tender item and rank marketplace offers for it.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.tenderscout/tenderscout.toml.
    #[arg(long, global = true, env = "TENDERSCOUT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Options shared by `run` and `batch`.
#[derive(clap::Args)]
pub(crate) struct RunOptions {
    /// Skip the identity cache for this job.
    #[arg(long)]
    pub no_cache: bool,

    /// Postal code used for shipping quotes.
    #[arg(long)]
    pub destination: Option<String>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline for a single item.
    Run {
        /// Item description as written in the tender.
        #[arg(short, long)]
        description: String,

        /// Maximum unit price accepted by the tender.
        #[arg(short, long)]
        max_price: f64,

        /// Item identifier.
        #[arg(long, default_value = "1")]
        id: String,

        #[arg(long, default_value_t = 1)]
        quantity: u32,

        /// Print the defense report as markdown instead of the JSON outcome.
        #[arg(long)]
        markdown: bool,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Run the pipeline for every item of a JSON file.
    Batch {
        /// JSON array of `{id, description, max_price, quantity}`.
        file: PathBuf,

        /// Items processed at once (defaults to the configured concurrency).
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Write the results here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Show recorded pipeline runs.
    Runs {
        /// Number of runs to list.
        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// Print the trace of one run instead.
        #[arg(long)]
        trace: Option<String>,
    },

    /// Identity cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Count cached identities.
    Stats,
    /// Remove entries older than the freshness window.
    Purge,
    /// Remove every entry.
    Clear,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tenderscout=info",
        1 => "tenderscout=debug",
        _ => "tenderscout=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so stdout carries only results.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            description,
            max_price,
            id,
            quantity,
            markdown,
            options,
        } => {
            let item = TenderItem {
                id,
                description,
                max_price,
                quantity,
            };
            cmd_run(config_path, item, markdown, &options).await
        }
        Command::Batch {
            file,
            concurrency,
            out,
            options,
        } => cmd_batch(config_path, &file, concurrency, out.as_deref(), &options).await,
        Command::Runs { limit, trace } => cmd_runs(config_path, limit, trace.as_deref()).await,
        Command::Cache { action } => cmd_cache(config_path, action).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    Ok(match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.defaults.database_path);
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Run `items` through a freshly spawned scraper bridge. Ctrl-C stops
/// items that have not started yet.
async fn execute(
    config: &AppConfig,
    items: Vec<TenderItem>,
    concurrency: usize,
    options: &RunOptions,
) -> Result<Vec<ItemResult>> {
    if let Err(e) = validate_api_keys(config) {
        warn!("{e}");
    }

    let storage = open_storage(config).await?;
    let mut pipeline = Pipeline::from_config(config, None)?;
    if let Some(destination) = &options.destination {
        pipeline = pipeline.with_destination(Some(destination.clone()));
    }
    if !options.no_cache {
        pipeline = pipeline.with_cache(Arc::new(StorageIdentityCache::new(
            Arc::clone(&storage),
            ttl_days(config.defaults.cache_ttl_days),
        )));
    }

    let bridge = Arc::new(ScraperBridge::spawn(&config.scraper).await?);
    let runner = JobRunner::new(Arc::new(pipeline), bridge.clone(), concurrency).with_storage(storage);

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, waiting for running items");
                cancel.cancel();
            }
        })
    };

    info!(items = items.len(), concurrency, "starting job");
    let progress = CliProgress::new(items.len());
    let results = runner.run(items, cancel, &progress).await;
    progress.finish();
    watcher.abort();

    if let Err(e) = bridge.shutdown().await {
        warn!(error = %e, "scraper bridge shutdown failed");
    }
    Ok(results)
}

fn result_json(result: &ItemResult) -> serde_json::Value {
    match &result.outcome {
        Ok(outcome) => serde_json::json!({
            "item_id": result.item_id,
            "run_id": result.run_id,
            "status": result.status(),
            "outcome": outcome,
        }),
        Err(e) => serde_json::json!({
            "item_id": result.item_id,
            "run_id": result.run_id,
            "status": result.status(),
            "error": e.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&Path>,
    item: TenderItem,
    markdown: bool,
    options: &RunOptions,
) -> Result<()> {
    let config = load(config_path)?;
    info!(item_id = %item.id, max_price = item.max_price, "running single item");

    let mut results = execute(&config, vec![item], 1, options).await?;
    let result = results
        .pop()
        .ok_or_else(|| eyre!("job returned no result"))?;
    let outcome = result.outcome?;

    if markdown {
        println!("{}", render_markdown(&outcome.defense_report));
    } else {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}

async fn cmd_batch(
    config_path: Option<&Path>,
    file: &Path,
    concurrency: Option<usize>,
    out: Option<&Path>,
    options: &RunOptions,
) -> Result<()> {
    let config = load(config_path)?;
    let content = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let items: Vec<TenderItem> = serde_json::from_str(&content)
        .map_err(|e| eyre!("'{}' is not a JSON array of items: {e}", file.display()))?;
    if items.is_empty() {
        return Err(eyre!("'{}' contains no items", file.display()));
    }

    let concurrency = concurrency.unwrap_or(config.defaults.concurrency);
    let results = execute(&config, items, concurrency, options).await?;

    let json = serde_json::Value::Array(results.iter().map(result_json).collect());
    let rendered = serde_json::to_string_pretty(&json)?;
    match out {
        Some(path) => {
            std::fs::write(path, rendered)
                .map_err(|e| eyre!("cannot write '{}': {e}", path.display()))?;
            println!("Results written to {}", path.display());
        }
        None => println!("{rendered}"),
    }

    let completed = results.iter().filter(|r| r.status() == "completed").count();
    eprintln!();
    eprintln!("  Items:     {}", results.len());
    eprintln!("  Winners:   {completed}");
    eprintln!(
        "  Failed:    {}",
        results.iter().filter(|r| r.outcome.is_err()).count()
    );
    eprintln!();
    Ok(())
}

async fn cmd_runs(config_path: Option<&Path>, limit: u32, trace: Option<&str>) -> Result<()> {
    let config = load(config_path)?;
    let path = expand_home(&config.defaults.database_path);
    if !path.exists() {
        println!("No runs recorded.");
        return Ok(());
    }
    let storage = Storage::open_readonly(&path).await?;

    if let Some(run_id) = trace {
        let events = storage.list_trace_events(run_id).await?;
        if events.is_empty() {
            return Err(eyre!("no trace recorded for run '{run_id}'"));
        }
        for event in events {
            println!("{:>4}  {:<12} {}", event.seq, event.kind, event.payload_json);
        }
        return Ok(());
    }

    let runs = storage.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs {
        let took = run
            .finished_at
            .map(|end| format!("{}s", end - run.started_at))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<10} {:<10} {:>6}  {}",
            run.id,
            run.item_id,
            run.status,
            took,
            run.error.unwrap_or_default()
        );
    }
    Ok(())
}

async fn cmd_cache(config_path: Option<&Path>, action: CacheAction) -> Result<()> {
    let config = load(config_path)?;
    let storage = open_storage(&config).await?;
    let ttl = ttl_days(config.defaults.cache_ttl_days);

    match action {
        CacheAction::Stats => {
            let count = storage.count_identities().await?;
            println!("  Cached identities: {count}");
            println!("  Freshness window:  {} days", config.defaults.cache_ttl_days);
            println!(
                "  Database:          {}",
                expand_home(&config.defaults.database_path).display()
            );
        }
        CacheAction::Purge => {
            let removed = storage.purge_expired_identities(ttl).await?;
            println!("Removed {removed} expired entries.");
        }
        CacheAction::Clear => {
            let removed = storage.clear_identities().await?;
            println!("Removed {removed} entries.");
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Item progress bar using indicatif.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl JobProgress for CliProgress {
    fn item_started(&self, item: &TenderItem) {
        self.bar.set_message(format!("item {}", item.id));
    }

    fn item_finished(&self, result: &ItemResult, _done: usize, _total: usize) {
        self.bar.inc(1);
        let line = match &result.outcome {
            Ok(outcome) => match outcome.winner() {
                Some(w) => format!(
                    "  ✔ {}  R$ {:.2}  risk {}/10  {}",
                    result.item_id,
                    w.total_price,
                    w.risk_score,
                    w.raw().title
                ),
                None => format!("  · {}  no winner", result.item_id),
            },
            Err(e) => format!("  ✘ {}  {e}", result.item_id),
        };
        self.bar.println(line);
    }
}
