use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use flowsentry::capture::{FileCapture, LiveCapture, PacketSource};
use flowsentry::config::Config;
use flowsentry::engine::Engine;
use flowsentry::model::ModelEnsemble;

#[derive(Parser)]
#[command(name = "flowsentry", version, about = "ML-driven network intrusion detection")]
pub struct Cli {
    /// Configuration file (default: /etc/flowsentry/config.toml,
    /// $XDG_CONFIG_HOME/flowsentry/config.toml, ./config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Force debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Capture live traffic and detect threats
    Run,
    /// Validate the configuration and model artifacts, then exit
    CheckConfig,
    /// Score a pcap file offline
    Replay {
        /// Capture file to score
        #[arg(long)]
        pcap: PathBuf,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default_locations()?,
    };

    match cli.command {
        Command::CheckConfig => {
            ModelEnsemble::load(&config.models)?;
            println!("configuration ok");
            Ok(())
        }
        Command::Run => {
            let ensemble = Arc::new(ModelEnsemble::load(&config.models)?);
            // Capture opens before any storage is touched: a privilege
            // failure must leave no files behind.
            let source = LiveCapture::open(&config.network.interface)?;
            info!(interface = %config.network.interface, "capture open");
            run_engine(config, ensemble, Box::new(source)).await
        }
        Command::Replay { pcap } => {
            let ensemble = Arc::new(ModelEnsemble::load(&config.models)?);
            let source = FileCapture::open(&pcap)?;
            info!(file = %pcap.display(), "replaying capture");
            run_engine(config, ensemble, Box::new(source)).await
        }
    }
}

async fn run_engine(
    config: Config,
    ensemble: Arc<ModelEnsemble>,
    source: Box<dyn PacketSource>,
) -> Result<()> {
    let mut engine = Engine::start(config, ensemble, source).await?;
    let shutdown = engine.shutdown_handle();

    // Run until interrupted; a finite source (replay) ends on its own
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            shutdown.trigger();
        }
        _ = engine.done() => {}
    }

    engine.join().await
}
