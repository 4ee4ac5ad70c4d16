//! Certificate inspection commands

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use colored::*;
use is_terminal::IsTerminal;
use std::path::{Path, PathBuf};

use m365_admin::auth::CertificateManager;
use m365_admin::auth::certificate::ContainerFormat;

#[derive(Args)]
pub struct CertCommands {
    #[command(subcommand)]
    pub command: CertSubcommands,
}

#[derive(Args)]
pub struct CertSource {
    /// PFX/P12, PEM or DER certificate file
    pub path: PathBuf,
    /// Container password
    #[arg(long, conflicts_with = "ask_password")]
    pub password: Option<String>,
    /// Prompt for the container password without echo
    #[arg(long)]
    pub ask_password: bool,
}

#[derive(Subcommand)]
pub enum CertSubcommands {
    /// Print certificate metadata as JSON
    Info(CertSource),
    /// Check that the certificate loads and is within its validity window
    Validate(CertSource),
}

pub async fn cert_command(command: CertCommands) -> Result<()> {
    let manager = CertificateManager::new();

    match command.command {
        CertSubcommands::Info(source) => {
            let password = resolve_password(&source)?;
            let info = manager.get_info(&source.path, password.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        CertSubcommands::Validate(source) => {
            let password = resolve_password(&source)?;
            let info = manager.get_info(&source.path, password.as_deref()).await?;
            if info.is_valid {
                println!(
                    "{} {} ({} days left)",
                    "✓ Valid:".bright_green().bold(),
                    info.thumbprint.cyan(),
                    info.expires_in_days
                );
            } else {
                println!(
                    "{} {} (valid {} to {})",
                    "✗ Not valid now:".bright_red().bold(),
                    info.thumbprint.cyan(),
                    info.not_valid_before.format("%Y-%m-%d"),
                    info.not_valid_after.format("%Y-%m-%d")
                );
                bail!("certificate {} is outside its validity window", info.thumbprint);
            }
        }
    }
    Ok(())
}

fn resolve_password(source: &CertSource) -> Result<Option<String>> {
    if source.password.is_some() {
        return Ok(source.password.clone());
    }
    if source.ask_password || (is_pkcs12(&source.path) && std::io::stdin().is_terminal()) {
        let password = rpassword::prompt_password(format!("Password for {}: ", source.path.display()))?;
        return Ok(Some(password).filter(|p| !p.is_empty()));
    }
    Ok(None)
}

fn is_pkcs12(path: &Path) -> bool {
    matches!(ContainerFormat::from_path(path), Some(ContainerFormat::Pkcs12))
}
