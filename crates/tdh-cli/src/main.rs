use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tdh_api::ApiConfig;
use tdh_ingest::{find_strategy, registry, StrategyContext};

#[derive(Debug, Parser)]
#[command(name = "tdh-cli")]
#[command(about = "Torn data harvester command-line interface")]
struct Cli {
    /// Directory holding the document store collections.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incrementally ingest the faction attack log.
    FactionAttacks {
        /// API key, passed through to the remote API unmodified.
        #[arg(long)]
        key: String,
        #[arg(long)]
        faction_id: i64,
        /// Start timestamp in epoch seconds; omit to start from the oldest
        /// records the API still serves.
        #[arg(long)]
        from: Option<i64>,
    },
    /// Record one user status snapshot and refresh the profile projection.
    UserBasic {
        #[arg(long)]
        key: String,
        /// Omit to fetch the key owner's own profile.
        #[arg(long)]
        user_id: Option<i64>,
    },
    /// List the registered (primary entity, subtable) ingestion strategies.
    ListStrategies,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::FactionAttacks {
            key,
            faction_id,
            from,
        } => {
            run_strategy("faction", "attacks", key, cli.data_dir, Some(faction_id), from).await
        }
        Commands::UserBasic { key, user_id } => {
            run_strategy("user", "basic", key, cli.data_dir, user_id, None).await
        }
        Commands::ListStrategies => {
            for strategy in registry() {
                println!("{} / {}", strategy.primary_entity(), strategy.subtable());
            }
            Ok(())
        }
    }
}

async fn run_strategy(
    primary: &str,
    subtable: &str,
    key: String,
    data_dir: PathBuf,
    entity_id: Option<i64>,
    from: Option<i64>,
) -> Result<()> {
    let Some(strategy) = find_strategy(primary, subtable) else {
        bail!("no ingestion strategy registered for {primary}/{subtable}");
    };
    strategy
        .run(StrategyContext {
            api: ApiConfig::new(key),
            data_dir,
            entity_id,
            from,
        })
        .await
}
