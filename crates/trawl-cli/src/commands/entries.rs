use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use trawl::entries::EntriesRequest;
use trawl::entry::Summary;
use trawl::store::Direction;

use crate::client::GatewayClient;
use crate::error::CliResult;
use crate::output::{OutputFormat, format_millis, truncate_string};

#[derive(Parser)]
pub struct EntriesCommand {
    #[clap(long, short, default_value = "", help = "Filter expression")]
    pub query: String,

    #[clap(
        long,
        short,
        default_value = "20",
        help = "Maximum number of entries to fetch"
    )]
    pub limit: u64,

    #[clap(
        long,
        default_value = "latest",
        help = "Cursor to page from (a leftOff value)"
    )]
    pub left_off: String,

    #[clap(long, help = "Page forward from the cursor instead of backward")]
    pub forward: bool,

    #[clap(long, help = "Store fetch timeout in milliseconds")]
    pub timeout_ms: Option<u64>,
}

#[derive(Parser)]
pub struct EntryCommand {
    #[clap(help = "Entry ID")]
    pub id: String,

    #[clap(long, short, default_value = "", help = "Filter expression to highlight")]
    pub query: String,
}

fn endpoints(summary: &Summary) -> String {
    format!(
        "{}:{} → {}:{}",
        summary.src.ip, summary.src.port, summary.dst.ip, summary.dst.port
    )
}

impl EntriesCommand {
    pub async fn execute(&self, client: &GatewayClient, format: OutputFormat) -> CliResult<()> {
        let request = EntriesRequest {
            left_off: self.left_off.clone(),
            direction: if self.forward {
                Direction::Forward
            } else {
                Direction::Backward
            },
            query: self.query.clone(),
            limit: self.limit,
            timeout_ms: self.timeout_ms,
        };
        let page = client.entries(&request).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&page)?);
            }
            OutputFormat::Table => {
                if page.data.is_empty() {
                    println!("No entries found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header([
                        "ID", "Protocol", "Method", "Summary", "Status", "Endpoints", "Latency",
                        "Time",
                    ]);

                for summary in &page.data {
                    table.add_row([
                        truncate_string(&summary.id, 12),
                        summary.protocol.abbr.clone(),
                        summary.method.clone(),
                        truncate_string(&summary.summary, 40),
                        summary.status.to_string(),
                        endpoints(summary),
                        format!("{} ms", summary.latency),
                        format_millis(summary.timestamp),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} entries", page.data.len());
                if let Some(meta) = &page.meta {
                    println!("Next page: --left-off {}", meta.left_off);
                }
            }
        }

        Ok(())
    }
}

impl EntryCommand {
    pub async fn execute(&self, client: &GatewayClient, format: OutputFormat) -> CliResult<()> {
        let wrapper = client.entry(&self.id, &self.query).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&wrapper)?);
            }
            OutputFormat::Table => {
                let base = &wrapper.base;
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Property", "Value"]);

                table.add_row(["ID", base.id.as_str()]);
                table.add_row(["Protocol", wrapper.protocol.long_name.as_str()]);
                table.add_row(["Method", base.method.as_str()]);
                table.add_row(["Summary", base.summary.as_str()]);
                table.add_row(["Status", &base.status.to_string()]);
                table.add_row(["Endpoints", &endpoints(base)]);
                table.add_row(["Outgoing", &base.outgoing.to_string()]);
                table.add_row(["Latency", &format!("{} ms", base.latency)]);
                table.add_row(["Time", &format_millis(base.timestamp)]);
                table.add_row(["Capture", base.capture.as_str()]);

                println!("{table}");

                match serde_json::from_str::<serde_json::Value>(&wrapper.representation) {
                    Ok(representation) => {
                        println!("{}", serde_json::to_string_pretty(&representation)?)
                    }
                    Err(_) => println!("{}", wrapper.representation),
                }
            }
        }

        Ok(())
    }
}
