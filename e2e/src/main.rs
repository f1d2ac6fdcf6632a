use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::*;
use tracing_subscriber::EnvFilter;

use local_volume_e2e::config::HarnessConfig;
use local_volume_e2e::local_volume_e2e::local_volume_e2e_test;
use local_volume_e2e::Error;

#[derive(Parser)]
#[command(name = "local-volume-e2e", about = "End-to-end tests for the local volume controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local volume lifecycle scenario
    LocalVolume {
        /// YAML harness configuration; built-in defaults when omitted
        #[arg(long, env = "LOCAL_VOLUME_E2E_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kube=warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::LocalVolume { config } => {
            let cfg = match config {
                Some(path) => HarnessConfig::from_file(&path)?,
                None => HarnessConfig::default(),
            };
            info!("Running local volume end-to-end test");
            local_volume_e2e_test(cfg).await
        }
    }
}
