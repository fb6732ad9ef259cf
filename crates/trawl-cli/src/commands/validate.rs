use clap::Parser;

use crate::client::GatewayClient;
use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ValidateCommand {
    #[clap(help = "Filter expression to check")]
    pub query: String,
}

impl ValidateCommand {
    /// Exits with an error when the store rejects the expression
    pub async fn execute(&self, client: &GatewayClient, format: OutputFormat) -> CliResult<()> {
        let verdict = client.validate(&self.query).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "query": self.query,
                    "valid": verdict.valid,
                    "message": verdict.message,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if verdict.valid {
                    println!("✓ Query is valid");
                }
            }
        }

        if verdict.valid {
            Ok(())
        } else {
            Err(CliError(format!("Invalid query: {}", verdict.message)))
        }
    }
}
