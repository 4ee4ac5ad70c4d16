//! Microsoft Graph read commands

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::Value;

use crate::cli::context::AppContext;
use crate::cli::ui::with_spinner;

#[derive(Args)]
pub struct GraphCommands {
    #[command(subcommand)]
    pub command: GraphSubcommands,
}

#[derive(Subcommand)]
pub enum GraphSubcommands {
    /// List all users
    Users,
    /// List all groups
    Groups,
    /// List subscribed license SKUs
    Licenses,
    /// List users that have a mailbox address
    Mailboxes,
    /// Download a usage report as CSV
    Report {
        /// Report function, e.g. getOffice365ActiveUserDetail
        name: String,
        /// D7, D30, D90 or D180
        #[arg(long, default_value = "D7")]
        period: String,
    },
    /// GET any endpoint relative to the Graph base URL
    Get {
        /// e.g. organization or users/{id}/memberOf
        endpoint: String,
        /// Follow @odata.nextLink and print every item
        #[arg(long)]
        all: bool,
    },
}

pub async fn graph_command(ctx: &AppContext, command: GraphCommands) -> Result<()> {
    let method = ctx.method(None)?;
    let client = ctx.api_client(method);

    let output = match command.command {
        GraphSubcommands::Users => Value::Array(with_spinner("Fetching users...", client.list_users()).await?),
        GraphSubcommands::Groups => Value::Array(with_spinner("Fetching groups...", client.list_groups()).await?),
        GraphSubcommands::Licenses => {
            Value::Array(with_spinner("Fetching licenses...", client.list_subscribed_skus()).await?)
        }
        GraphSubcommands::Mailboxes => {
            Value::Array(with_spinner("Fetching mailboxes...", client.list_mailboxes()).await?)
        }
        GraphSubcommands::Report { name, period } => {
            with_spinner("Fetching report...", client.usage_report(&name, &period)).await?
        }
        GraphSubcommands::Get { endpoint, all } => {
            if all {
                Value::Array(with_spinner("Fetching...", client.list_all(&endpoint, &[])).await?)
            } else {
                with_spinner("Fetching...", client.get(&endpoint)).await?
            }
        }
    };

    match output {
        Value::String(text) => print!("{}", text),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}
