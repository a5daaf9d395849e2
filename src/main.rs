//! tx-cache: fetch, validate and cache ledger transactions by signature

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ledger_tx_cache::config::{Config, LoggingConfig};
use ledger_tx_cache::metrics::PipelineMetrics;
use ledger_tx_cache::pipeline::{self, LoadedAddressResolver, Pipeline, TransactionCache};
use ledger_tx_cache::rpc::RpcTransactionFetcher;
use ledger_tx_cache::structured_logging::PipelineLogger;

type RpcPipeline = Pipeline<RpcTransactionFetcher, LoadedAddressResolver>;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the canonical cache text of one transaction
    Get {
        signature: String,

        /// Single-line output instead of the pretty cache layout
        #[arg(long)]
        compact: bool,
    },

    /// Process a newline separated list of signatures
    Batch {
        file: PathBuf,

        /// Append the metrics in Prometheus text format to the report
        #[arg(long)]
        metrics: bool,
    },

    /// Print the number of cached transactions
    Count,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, config_found) = load_config(&args.config)?;
    init_logging(&config.logging, args.verbose)?;
    if !config_found {
        warn!("Config file '{}' not found, using defaults", args.config.display());
    }

    match args.command {
        Command::Count => {
            let cache = open_cache(&config)?;
            println!("{}", cache.len().await?);
        }
        Command::Get { signature, compact } => {
            let metrics = Arc::new(PipelineMetrics::new()?);
            let pipeline = build_pipeline(&config, metrics)?;
            let tx = pipeline
                .get_transaction(&signature)
                .await
                .with_context(|| format!("Fatal cache fault for {signature}"))??;
            println!("{}", pipeline::serialize(&tx, !compact)?);
        }
        Command::Batch { file, metrics: print_metrics } => {
            let signatures = read_signatures(&file)?;
            let metrics = Arc::new(PipelineMetrics::new()?);
            let pipeline = build_pipeline(&config, metrics.clone())?;

            info!(
                signatures = signatures.len(),
                concurrency = config.batch.concurrency,
                "Starting batch"
            );
            let outcomes = run_batch(&pipeline, signatures, config.batch.concurrency).await?;
            for (outcome, count) in &outcomes {
                println!("{outcome}\t{count}");
            }
            println!("cached\t{}", pipeline.cache().len().await?);
            if print_metrics {
                print!("{}", metrics.export_text()?);
            }
        }
    }

    Ok(())
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "ledger_tx_cache=debug,tx_cache=debug,info"
    } else {
        config.filter.as_str()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .with_context(|| format!("Invalid log filter '{default_filter}'"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(config.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Load configuration from file with fallback to defaults
///
/// Environment overrides apply either way. The flag reports whether the
/// file existed, so the warning can be logged once logging is up.
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        let config = Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        return Ok((config, true));
    }
    dotenvy::dotenv().ok();
    let mut config = Config::default();
    config.apply_env()?;
    config.validate()?;
    Ok((config, false))
}

fn open_cache(config: &Config) -> Result<TransactionCache> {
    TransactionCache::open(&config.cache.root)
        .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))
}

fn build_pipeline(config: &Config, metrics: Arc<PipelineMetrics>) -> Result<RpcPipeline> {
    let logger = PipelineLogger::generate();
    let cache = open_cache(config)?
        .with_metrics(metrics.clone())
        .with_logger(logger.clone());

    Ok(Pipeline::new(
        cache,
        RpcTransactionFetcher::from_config(&config.rpc),
        LoadedAddressResolver,
        config.parse_options(),
    )
    .with_metrics(metrics)
    .with_logger(logger))
}

/// One signature per line; blank lines and `#` comments are skipped
fn read_signatures(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signature list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Run every signature through the pipeline and count outcomes by category
///
/// A cache fault aborts the whole batch.
async fn run_batch(
    pipeline: &RpcPipeline,
    signatures: Vec<String>,
    concurrency: usize,
) -> Result<BTreeMap<&'static str, usize>> {
    let mut outcomes = BTreeMap::new();
    let mut results = stream::iter(signatures)
        .map(|signature| async move {
            let result = pipeline.get_transaction(&signature).await;
            (signature, result)
        })
        .buffer_unordered(concurrency);

    while let Some((signature, result)) = results.next().await {
        let outcome = match result.with_context(|| format!("Fatal cache fault for {signature}"))? {
            Ok(_) => "ok",
            Err(err) => err.category(),
        };
        *outcomes.entry(outcome).or_insert(0) += 1;
    }
    Ok(outcomes)
}
