//! Exchange Online session commands

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::*;

use crate::cli::context::AppContext;
use crate::cli::ui::with_spinner;
use m365_admin::auth::AuthenticationMethod;

#[derive(Args)]
pub struct ExchangeCommands {
    #[command(subcommand)]
    pub command: ExchangeSubcommands,
}

#[derive(Subcommand)]
pub enum ExchangeSubcommands {
    /// Connect, verify the session and disconnect again
    Check {
        #[arg(long)]
        method: Option<AuthenticationMethod>,
    },
}

pub async fn exchange_command(ctx: &AppContext, command: ExchangeCommands) -> Result<()> {
    match command.command {
        ExchangeSubcommands::Check { method } => check(ctx, method).await,
    }
}

async fn check(ctx: &AppContext, requested: Option<AuthenticationMethod>) -> Result<()> {
    let method = ctx.method(requested)?;
    let (authenticator, bridge) = ctx.exchange();
    let params = ctx.params();

    let connected = if method == AuthenticationMethod::Interactive {
        authenticator.connect(method, &params).await
    } else {
        with_spinner("Connecting to Exchange Online...", authenticator.connect(method, &params)).await
    };

    let outcome: Result<()> = match connected {
        Ok(session) => {
            let organization = session.organization().to_string();
            let disconnected = session.disconnect().await;
            println!(
                "{} {}",
                "✓ Exchange Online session verified for".bright_green().bold(),
                organization.cyan()
            );
            disconnected.map_err(Into::into)
        }
        Err(e) => Err(e.into()),
    };

    bridge.shutdown().await;
    outcome
}
