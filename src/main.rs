//! piazza-harvest CLI - download every post of a Piazza course, resumably.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_service::CheckpointStore;
use piazza_core::search::{self, DEFAULT_TOP_K};
use piazza_core::{CoreError, ErrorReporter, HarvestConfig};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "piazza-harvest.toml";

#[derive(Parser)]
#[command(name = "piazza-harvest")]
#[command(version)]
#[command(about = "Harvest Piazza course posts into a JSON file, resuming from a checkpoint")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (optional unless given explicitly)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every post not yet saved (the default)
    Harvest,

    /// Rank harvested posts against a question
    Search {
        /// Free-text question
        query: String,

        /// Number of posts to show
        #[arg(short, long, default_value_t = DEFAULT_TOP_K)]
        top: usize,

        /// Harvested posts file (defaults to the configured output path)
        #[arg(short, long)]
        data: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        "piazza_harvest=debug,harvest_service=debug,piazza_client=debug,piazza_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<HarvestConfig> {
    let (path, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };
    HarvestConfig::load(path, required)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

async fn harvest(config: HarvestConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after saving progress");
            ctrl_c.cancel();
        }
    });

    info!("Harvesting course {}", config.course_id);
    match harvest_service::run(&config, cancel).await {
        Ok(report) => {
            report.log_summary();
            Ok(())
        }
        Err(error) => {
            ErrorReporter::new().report_error(&error);
            if matches!(error, CoreError::Cancelled) {
                info!(
                    "Progress kept in {}; run again to resume",
                    config.partial_path.display()
                );
            }
            Err(error).context("Harvest failed")
        }
    }
}

async fn search(
    config: &HarvestConfig,
    query: &str,
    top: usize,
    data: Option<PathBuf>,
) -> Result<()> {
    let data = data.unwrap_or_else(|| config.output_path.clone());
    let store = CheckpointStore::new(&config.partial_path, &data);
    let posts = store
        .load_output()
        .await
        .with_context(|| format!("Failed to read harvested posts from {}", data.display()))?;

    let ranked = search::pick_top(&posts, query, top);
    info!("{} of {} posts matched", ranked.len(), posts.len());

    for (index, post) in ranked.iter().enumerate() {
        println!("{}\n", search::context_block(index + 1, post));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => harvest(config).await,
        Commands::Search { query, top, data } => search(&config, &query, top, data).await,
    }
}
