//! Main entry point for the pvoutput-backfill CLI

use clap::Parser;
use pvoutput_backfill::cli::{Cli, Commands};
use pvoutput_backfill::metrics;
use pvoutput_backfill::shutdown::{self, ShutdownCoordinator};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pvoutput_backfill=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine; credentials may come from flags or the shell.
    let _ = dotenvy::dotenv();

    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            error!("Failed to start metrics exporter: {}", e);
            std::process::exit(1);
        }
    }

    // Install global shutdown coordinator and Ctrl+C handler
    let shutdown = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(shutdown.clone());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing current unit and saving progress...");
                shutdown.request_shutdown();
            }
        }
    });

    let result = match &cli.command {
        Commands::Download(args) => args
            .execute(&cli, shutdown.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Search(args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
        Commands::Purge(args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
        Commands::Validate(cmd) => cmd.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
