use std::time::Duration;

use clap::{Parser, Subcommand};
use trawl_cli::client::GatewayClient;
use trawl_cli::commands::{EntriesCommand, EntryCommand, ReplayCommand, ValidateCommand};
use trawl_cli::error::CliResult;
use trawl_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "trawl-cli")]
#[command(about = "Trawl CLI - query, inspect and replay captured traffic")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(
        long,
        short = 'g',
        global = true,
        default_value = "http://127.0.0.1:8898",
        help = "Gateway base URL"
    )]
    pub gateway: String,

    #[clap(
        long,
        global = true,
        default_value = "30",
        help = "Request timeout in seconds"
    )]
    pub timeout: u64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "List a page of entries")]
    Entries(EntriesCommand),

    #[clap(about = "Show one entry in full")]
    Entry(EntryCommand),

    #[clap(about = "Check a filter expression")]
    Validate(ValidateCommand),

    #[clap(about = "Replay an HTTP request through the gateway")]
    Replay(ReplayCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let client = GatewayClient::new(&cli.gateway, Duration::from_secs(cli.timeout))?;

    match &cli.command {
        Command::Entries(cmd) => cmd.execute(&client, format).await,
        Command::Entry(cmd) => cmd.execute(&client, format).await,
        Command::Validate(cmd) => cmd.execute(&client, format).await,
        Command::Replay(cmd) => cmd.execute(&client, format).await,
    }
}
