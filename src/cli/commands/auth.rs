//! Sign-in and token cache commands

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use colored::*;
use dialoguer::Select;
use is_terminal::IsTerminal;

use crate::cli::context::AppContext;
use crate::cli::ui::with_spinner;
use m365_admin::auth::AuthenticationMethod;

#[derive(Args)]
pub struct AuthCommands {
    #[command(subcommand)]
    pub command: AuthSubcommands,
}

#[derive(Subcommand)]
pub enum AuthSubcommands {
    /// Acquire a Graph token and store it in the token cache
    Login {
        /// certificate, client-secret, interactive, device-code, username-password or managed-identity
        #[arg(long)]
        method: Option<AuthenticationMethod>,
    },
    /// Show configured identity and whether a cached token exists
    Status,
    /// Decode the claims of the current Graph token
    TokenInfo,
    /// Remove every cached token
    Clear,
}

pub async fn auth_command(ctx: &AppContext, command: AuthCommands) -> Result<()> {
    match command.command {
        AuthSubcommands::Login { method } => login(ctx, method).await,
        AuthSubcommands::Status => status(ctx),
        AuthSubcommands::TokenInfo => token_info(ctx).await,
        AuthSubcommands::Clear => clear(ctx),
    }
}

/// Ask on a terminal when nothing in the config decides the method.
fn choose_method(ctx: &AppContext, requested: Option<AuthenticationMethod>) -> Result<AuthenticationMethod> {
    if requested.is_some() || ctx.config.identity.resolve_method().is_some() || !std::io::stdin().is_terminal() {
        return ctx.method(requested);
    }

    let choices = [AuthenticationMethod::Interactive, AuthenticationMethod::DeviceCode];
    let labels: Vec<&str> = choices.iter().map(|m| m.as_str()).collect();
    let index = Select::new()
        .with_prompt("Sign-in method")
        .items(&labels)
        .default(0)
        .interact()?;
    ctx.method(Some(choices[index]))
}

async fn login(ctx: &AppContext, requested: Option<AuthenticationMethod>) -> Result<()> {
    let method = choose_method(ctx, requested)?;
    let authenticator = ctx.graph_authenticator();
    let params = ctx.params();

    // Delegated flows print their own prompts; a spinner would draw over them.
    let result = if method.is_delegated() {
        authenticator.authenticate(method, &params).await?
    } else {
        with_spinner("Signing in...", authenticator.authenticate(method, &params)).await?
    };

    if !result.success {
        bail!(result.to_error());
    }

    println!("{} {}", "✓ Signed in using".bright_green().bold(), method.to_string().cyan());
    if let Some(expires_at) = result.expires_at {
        println!("  {}: {}", "Expires".dimmed(), expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

fn status(ctx: &AppContext) -> Result<()> {
    let identity = &ctx.config.identity;
    let show = |value: &str| {
        if value.is_empty() {
            "(not set)".dimmed().to_string()
        } else {
            value.white().to_string()
        }
    };

    println!("{}", "Microsoft 365 identity".bright_blue().bold());
    println!("  {}: {}", "Tenant".dimmed(), show(&identity.tenant_id));
    println!("  {}: {}", "Client ID".dimmed(), show(&identity.client_id));
    println!("  {}: {}", "Authority".dimmed(), identity.authority_host.cyan());

    let method = match ctx.config.validate() {
        Ok(method) => {
            println!("  {}: {}", "Method".dimmed(), method.to_string().cyan());
            method
        }
        Err(e) => {
            println!("  {} {}", "✗".bright_red(), e.to_string().red());
            return Ok(());
        }
    };

    let authenticator = ctx.graph_authenticator();
    let cache = authenticator.authenticator().cache();
    if !cache.is_enabled() {
        println!("  {}: {}", "Token cache".dimmed(), "disabled".yellow());
        return Ok(());
    }
    println!("  {}: {}", "Token cache".dimmed(), cache.path().display());

    match authenticator.authenticator().cache_key(method, &ctx.params()) {
        Ok(key) => match cache.get(&key) {
            Some(cached) => {
                let expires = cached
                    .expires_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_default();
                println!("  {} {} {}", "✓".bright_green(), "cached token valid until".green(), expires);
            }
            None => println!("  {} {}", "○".yellow(), "no usable cached token".yellow()),
        },
        Err(e) => println!("  {} {}", "✗".bright_red(), e.to_string().red()),
    }
    Ok(())
}

async fn token_info(ctx: &AppContext) -> Result<()> {
    let method = ctx.method(None)?;
    let authenticator = ctx.graph_authenticator();
    let result = with_spinner("Acquiring token...", authenticator.authenticate(method, &ctx.params())).await?;
    if !result.success {
        bail!(result.to_error());
    }

    let info = authenticator.get_token_info()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn clear(ctx: &AppContext) -> Result<()> {
    let cache = ctx.config.token_cache.cache(&ctx.app_dir);
    let removed = cache.keys().len();
    cache.clear_all();
    println!("{} {} cached token(s)", "✓ Removed".bright_green().bold(), removed);
    Ok(())
}
