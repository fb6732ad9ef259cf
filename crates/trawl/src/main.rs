//! Trawl gateway daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use trawl::classify::CapabilityRegistry;
use trawl::config::Config;
use trawl::error::Result;
use trawl::server::{AppState, TrawlServer};
use trawl::store::TcpDialer;
use trawl::store::bootstrap::{STARTUP_POLL_INTERVAL, configure, wait_for_store};

/// Trawl - query, stream and replay captured network traffic
#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Query and live-streaming gateway for captured network traffic")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default command)
    #[command(name = "serve")]
    Serve,

    /// Wait for the entry store and apply startup configuration, then exit
    #[command(name = "configure")]
    Configure,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Configure) => {
            prepare_store(&config, &CapabilityRegistry::with_defaults()).await?;
            Ok(())
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,trawl=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn prepare_store(config: &Config, registry: &CapabilityRegistry) -> Result<TcpDialer> {
    let dialer = TcpDialer::new(config.store.host.clone(), config.store.port);
    tracing::info!("Waiting for entry store at {}", dialer.addr());

    wait_for_store(
        &dialer.addr(),
        STARTUP_POLL_INTERVAL,
        config.store.startup_deadline(),
    )
    .await?;
    configure(&dialer, registry, &config.store).await?;
    Ok(dialer)
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Trawl gateway");

    let registry = Arc::new(CapabilityRegistry::with_defaults());
    for capability in registry.capabilities() {
        tracing::info!(
            "Loaded protocol capability: {} ({} protocols)",
            capability.name(),
            capability.protocols().len()
        );
    }

    let dialer = prepare_store(&config, &registry).await?;
    let state = AppState::new(config, Arc::new(dialer), registry);

    TrawlServer::new(state).serve().await
}
