//! IC box command line tool
//!
//! Usage:
//!   icbox ports                      - List serial ports
//!   icbox --port COM3 version        - Print the firmware version
//!   icbox --port COM3 rx-level 5     - Set the RX level
//!   icbox --port COM3 event --follow - Print ring and other events
//!   icbox --simulate hook            - Run against a simulated device
//!
//! Logging is controlled with `RUST_LOG` (default `icbox=info`), or
//! `--verbose` for debug output.

mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use icbox_core::config::DriverConfig;
use icbox_core::protocol::{IcBox, SimulatedBackend, TransportFault};
use std::io::Write;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "icbox=debug,icbox_core=debug"
    } else {
        "icbox=info,icbox_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<DriverConfig> {
    let mut config = match &cli.config {
        Some(path) => DriverConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        config.command_timeout_ms = timeout_ms;
    }
    Ok(config)
}

/// Resolve with the next fatal fault; pends forever if none can arrive
async fn next_fault(faults: &mut broadcast::Receiver<TransportFault>) -> TransportFault {
    loop {
        match faults.recv().await {
            Ok(fault) => return fault,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Open the line, run the subcommand and close again.
///
/// A transport fault ends the session with an error.
async fn run(cli: &Cli, icbox: &mut IcBox, out: &mut impl Write) -> Result<()> {
    // Subscribed before opening so a fault raised during open is seen
    let mut faults = icbox.subscribe_faults();

    if cli.command != Commands::Ports {
        let port = cli.resolve_port()?;
        icbox
            .open(&port)
            .await
            .with_context(|| format!("Failed to open {}", port))?;
    }

    // Transport faults are not recoverable in place: stop and let the caller restart
    let outcome = tokio::select! {
        biased;
        fault = next_fault(&mut faults) => Err(anyhow!("Fatal transport fault on {}", fault)),
        result = cli::execute(icbox, &cli.command, out) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    if let Err(e) = icbox.close().await {
        tracing::warn!(error = %e, "close failed");
    }
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let mut icbox = if cli.simulate {
        IcBox::with_backend(SimulatedBackend::demo())
    } else {
        IcBox::new()
    }
    .with_config(config);

    run(&cli, &mut icbox, &mut std::io::stdout()).await
}
