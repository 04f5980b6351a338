//! runhub daemon
//!
//! Loads the YAML configuration, wires the hub to the local Docker daemon and serves
//! the control and binding channels until Ctrl+C, SIGTERM or the console `exit`
//! command. In-flight executions are torn down before the process exits.

mod console;

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use runhub_core::config::{parse_addr, ConfigLoader};
use runhub_core::Hub;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "runhub - build and run uploaded programs in containers")]
struct Cli {
    #[clap(long, short, default_value = "runhub.yaml")]
    config: PathBuf,

    #[clap(long, short, help = "Overrides logging.level from the config file")]
    log_level: Option<String>,

    #[clap(long, help = "Overrides control.bind_addr")]
    control_addr: Option<String>,

    #[clap(long, help = "Overrides binding.bind_addr")]
    binding_addr: Option<String>,

    #[clap(long, help = "Do not read operator commands from stdin")]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let no_console = cli.no_console;

    let mut config = ConfigLoader::from_file_or_default(&cli.config).await?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();
    log::info!("Configuration loaded from {}", cli.config.display());

    if let Some(addr) = cli.control_addr {
        parse_addr("--control-addr", &addr)?;
        config.control.bind_addr = addr;
    }
    if let Some(addr) = cli.binding_addr {
        parse_addr("--binding-addr", &addr)?;
        config.binding.bind_addr = addr;
    }

    let hub = Arc::new(Hub::from_config(config).await?);
    let handle = Arc::clone(&hub).serve().await?;

    let console = async {
        if no_console {
            std::future::pending::<()>().await;
        }
        console::run(Arc::clone(&hub)).await;
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = console => {
            log::info!("Exit requested from console");
        }
        _ = handle.stopped() => {}
    }

    let live = hub.orchestrator().len();
    if live > 0 {
        log::info!("Waiting for {} execution(s) to tear down", live);
    }
    handle.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
