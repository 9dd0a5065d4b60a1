use anyhow::Result;
use clap::Parser;
use historydb::cli::Cli;
use tracing::{debug, error};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean JSON lines
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = cli.execute().await {
        error!("Command failed: {:?}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    debug!("Command completed");
    Ok(())
}
