use anyhow::Result;
use clap::Parser;
use colored::*;
use log::{LevelFilter, info};

mod cli;

use cli::Cli;
use cli::app::Commands;
use cli::context::AppContext;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".bright_red().bold(), e.to_string().red());
        if verbose {
            eprintln!("{:?}", e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Initialize logger to file (truncate on each run)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("m365-admin.log")?;
    let mut logger = env_logger::Builder::new();
    logger.filter_level(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    logger.parse_default_env();
    logger.target(env_logger::Target::Pipe(Box::new(log_file))).init();

    // A missing .env is fine; settings may come from config.toml alone.
    let _ = dotenvy::dotenv();

    info!("Starting m365-admin {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Cert(command) => cli::commands::cert_command(command).await,
        Commands::Auth(command) => cli::commands::auth_command(&AppContext::load()?, command).await,
        Commands::Graph(command) => cli::commands::graph_command(&AppContext::load()?, command).await,
        Commands::Exchange(command) => cli::commands::exchange_command(&AppContext::load()?, command).await,
    }
}
