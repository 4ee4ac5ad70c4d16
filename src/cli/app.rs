use super::commands::{AuthCommands, CertCommands, ExchangeCommands, GraphCommands};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "m365-admin")]
#[command(about = "Authenticate against Microsoft 365 and query Graph and Exchange Online")]
#[command(version)]
pub struct Cli {
    /// Debug logging and full error chains
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and inspect cached tokens
    Auth(AuthCommands),
    /// Inspect client certificates
    Cert(CertCommands),
    /// Read directory data from Microsoft Graph
    Graph(GraphCommands),
    /// Exchange Online session checks
    Exchange(ExchangeCommands),
}
