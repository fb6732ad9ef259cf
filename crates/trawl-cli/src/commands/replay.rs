use clap::Parser;
use std::collections::BTreeMap;

use trawl::replay::ReplayRequest;

use crate::client::GatewayClient;
use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ReplayCommand {
    #[clap(long, short = 'X', default_value = "GET", help = "HTTP method")]
    pub method: String,

    #[clap(help = "Target URL")]
    pub url: String,

    #[clap(long, short = 'H', help = "Header as `Name: value` (repeatable)")]
    pub header: Vec<String>,

    #[clap(long, short, default_value = "", help = "Request body")]
    pub body: String,
}

/// Parse repeated `Name: value` arguments, joining duplicates with `, `
pub fn parse_headers(raw: &[String]) -> CliResult<BTreeMap<String, String>> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for header in raw {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| CliError(format!("Header must be `Name: value`: {header}")))?;
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(CliError(format!("Header name is empty: {header}")));
        }
        let value = value.trim();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    Ok(headers)
}

impl ReplayCommand {
    pub async fn execute(&self, client: &GatewayClient, format: OutputFormat) -> CliResult<()> {
        let request = ReplayRequest {
            method: self.method.to_uppercase(),
            url: self.url.clone(),
            body: self.body.clone(),
            headers: parse_headers(&self.header)?,
        };
        let response = client.replay(&request).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            OutputFormat::Table => {
                if let Some(wrapper) = &response.data {
                    println!(
                        "✓ {} {} → {} ({} ms)",
                        wrapper.base.method,
                        wrapper.base.summary,
                        wrapper.base.status,
                        wrapper.base.latency
                    );
                    if let Some(body) = wrapper.data.response.get("body").and_then(|b| b.as_str()) {
                        if !body.is_empty() {
                            println!("\n{body}");
                        }
                    }
                }
            }
        }

        if response.success {
            Ok(())
        } else {
            Err(CliError(format!("Replay failed: {}", response.error_message)))
        }
    }
}
