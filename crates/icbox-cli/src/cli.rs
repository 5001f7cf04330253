//! Command line definition and subcommand execution

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use icbox_core::protocol::IcBox;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Port opened by `--simulate` when none is given
pub const SIMULATED_PORT: &str = "SIM0";

#[derive(Parser, Debug)]
#[command(name = "icbox")]
#[command(about = "Control an IC box telephony interface over serial")]
#[command(version = icbox_core::VERSION)]
pub struct Cli {
    /// Serial port (e.g. /dev/ttyUSB0 or COM3)
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    /// Talk to a simulated device instead of a serial port
    #[arg(long, global = true)]
    pub simulate: bool,

    /// JSON driver configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the command reply timeout
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List serial ports
    Ports,

    /// Print the firmware version
    Version,

    /// Print the hook state
    Hook,

    /// Check the line connection status
    Status,

    /// Dial a number
    Dial {
        /// Number to dial
        number: String,
    },

    /// Wait for device events such as rings
    Event {
        /// How long to wait for each event
        #[arg(long = "wait-ms", default_value_t = 500)]
        wait_ms: u64,

        /// Keep printing events until interrupted
        #[arg(short, long)]
        follow: bool,
    },

    /// Get or set the RX level
    RxLevel {
        /// New level
        #[arg(allow_negative_numbers = true)]
        set: Option<i32>,
    },

    /// Get or set the RX mode
    RxMode {
        /// New mode
        #[arg(allow_negative_numbers = true)]
        set: Option<i32>,
    },

    /// Get or set the device id
    Id {
        /// New id
        set: Option<String>,
    },

    /// Send raw command text and print the reply
    Send {
        /// Command text, without the line ending
        text: String,

        /// How long to wait for a reply
        #[arg(long = "wait-ms", default_value_t = 500)]
        wait_ms: u64,
    },
}

impl Cli {
    /// Port to open for device subcommands
    pub fn resolve_port(&self) -> Result<String> {
        match (&self.port, self.simulate) {
            (Some(port), _) => Ok(port.clone()),
            (None, true) => Ok(SIMULATED_PORT.to_string()),
            (None, false) => anyhow::bail!("--port is required (see `icbox ports`)"),
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Run a device subcommand against an open driver
pub async fn execute(icbox: &mut IcBox, command: &Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Ports => {
            for port in icbox.get_ports().await.context("Failed to list ports")? {
                match &port.product {
                    Some(product) => writeln!(out, "{}\t{}", port.name, product)?,
                    None => writeln!(out, "{}", port.name)?,
                }
            }
        }
        Commands::Version => {
            let version = icbox.get_version_info().await?;
            writeln!(out, "{}", version.trim_end())?;
        }
        Commands::Hook => {
            let on_hook = icbox.get_on_hook().await?;
            writeln!(out, "{}", if on_hook { "on-hook" } else { "off-hook" })?;
        }
        Commands::Status => {
            let connected = icbox.check_connection_status().await?;
            writeln!(out, "connected: {}", yes_no(connected))?;
        }
        Commands::Dial { number } => {
            let accepted = icbox.dial_number(number).await?;
            writeln!(out, "dial {}: {}", number, yes_no(accepted))?;
        }
        Commands::Event { wait_ms, follow } => {
            let wait = Duration::from_millis(*wait_ms);
            loop {
                let event = icbox.get_event(Some(wait)).await?;
                if !event.is_empty() {
                    writeln!(out, "{}", event.trim_end())?;
                    out.flush()?;
                }
                if !*follow || !icbox.is_connected() {
                    break;
                }
            }
        }
        Commands::RxLevel { set: None } => {
            writeln!(out, "{}", icbox.get_rx_level().await?)?;
        }
        Commands::RxLevel { set: Some(level) } => {
            let accepted = icbox.set_rx_level(*level).await?;
            writeln!(out, "rx level {}: {}", level, yes_no(accepted))?;
        }
        Commands::RxMode { set: None } => {
            writeln!(out, "{}", icbox.get_rx_mode().await?)?;
        }
        Commands::RxMode { set: Some(mode) } => {
            let accepted = icbox.set_rx_mode(*mode).await?;
            writeln!(out, "rx mode {}: {}", mode, yes_no(accepted))?;
        }
        Commands::Id { set: None } => {
            writeln!(out, "{}", icbox.get_id().await?)?;
        }
        Commands::Id { set: Some(id) } => {
            let accepted = icbox.set_id(id).await?;
            writeln!(out, "id {}: {}", id, yes_no(accepted))?;
        }
        Commands::Send { text, wait_ms } => {
            // -1 mirrors the driver's no-connection sentinel
            let written = icbox
                .send_command(text)
                .await?
                .map_or(-1, |n| n as i64);
            writeln!(out, "wrote {} bytes", written)?;
            if written > 0 {
                let reply = icbox.receive(Duration::from_millis(*wait_ms)).await?;
                writeln!(out, "{:?}", reply)?;
            }
        }
    }
    Ok(())
}
