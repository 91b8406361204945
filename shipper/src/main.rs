mod app;
mod fetcher;
mod metrics;
mod model;
mod publish;
mod reader;
mod scheduler;
mod selector;
mod state;
mod status;
mod storage;

use clap::{Parser, Subcommand};
use shipper_core::{telemetry, Config};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "shipper")]
#[clap(about = "Ships log objects from storage buckets as events", version)]
struct Cli {
    /// Configuration file (defaults to ./shipper.toml when present)
    #[clap(long, short, env = "SHIPPER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured bucket until interrupted
    Run,

    /// Run a single cycle per bucket and exit
    Once,

    /// Print the persisted cursor state as JSON
    State {
        /// Only show this bucket
        #[clap(long)]
        bucket: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    telemetry::init(&config.telemetry)?;

    match cli.command {
        Commands::Run => {
            let app = app::App::new(config).await?;
            app.run(false).await?;
        }

        Commands::Once => {
            let app = app::App::new(config).await?;
            app.run(true).await?;
        }

        Commands::State { bucket } => {
            let state = state::StateFile::load(&config.state.path).await;
            let mut snapshots = state.snapshots().await;
            if let Some(bucket) = bucket {
                snapshots.retain(|name, _| *name == bucket);
            }
            info!(path = %state.path().display(), buckets = snapshots.len(), "Loaded cursor state");
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
    }

    telemetry::shutdown();
    Ok(())
}
