//! obd-diag: OBD-II diagnostics from the command line

mod commands;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obd_adapter::{DefaultAdapterFactory, DeviceKind};
use obd_client::ObdClient;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::parse_pid;

#[derive(Parser)]
#[command(name = "obd-diag")]
#[command(author, version, about = "OBD-II vehicle diagnostics")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to ./obd-diag.toml when present)
    #[arg(short, long, env = "OBD_DIAG_CONFIG")]
    config: Option<PathBuf>,

    /// Interface device: passthru, elm327, bridge or simulator
    #[arg(short, long)]
    device: Option<DeviceKind>,

    /// Serial port for ELM327 and bridge devices
    #[arg(short, long)]
    port: Option<String>,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the transport the vehicle answers on
    Negotiate,

    /// Read current values
    Query {
        /// PIDs in hex, e.g. 0C 0D
        #[arg(required = true, value_parser = parse_pid)]
        pids: Vec<u8>,
    },

    /// List supported PIDs
    Pids {
        /// Freeze frame (Mode 02) instead of live data
        #[arg(long)]
        freeze_frame: bool,
    },

    /// Read trouble codes
    Dtcs {
        /// Pending (Mode 07) instead of stored codes
        #[arg(long)]
        pending: bool,
    },

    /// Read the freeze frame stored for a trouble code
    Freeze {
        /// Trouble code, e.g. P0123
        dtc: String,
    },

    /// Clear trouble codes and freeze frames
    Clear {
        #[arg(long)]
        yes: bool,
    },

    /// Sample PIDs periodically, one JSON line per round
    Monitor {
        /// PIDs in hex; a default live-data set when empty
        #[arg(value_parser = parse_pid)]
        pids: Vec<u8>,

        /// Interval between rounds in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,

        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Battery voltage at the interface
    Voltage,

    /// Device identification and state
    Status,

    /// Write a tuning parameter after the safety check
    Write {
        /// Parameter name, e.g. max_boost
        parameter: String,

        value: f64,
    },
}

impl Commands {
    /// Whether the command talks to the vehicle
    fn needs_vehicle(&self) -> bool {
        !matches!(self, Commands::Negotiate | Commands::Voltage | Commands::Status)
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn adapter_factory() -> DefaultAdapterFactory {
    #[cfg(feature = "ffi")]
    {
        use obd_adapter::passthru::native::NativePassThru;
        use std::sync::Arc;
        DefaultAdapterFactory::new().with_passthru(Arc::new(NativePassThru))
    }
    #[cfg(not(feature = "ffi"))]
    {
        DefaultAdapterFactory::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = settings::load(cli.config.as_deref())?;
    if let Some(kind) = cli.device {
        config.adapter.kind = kind;
    }
    if let Some(port) = &cli.port {
        config.adapter.port = Some(port.clone());
    }

    info!("=== obd-diag v{} ===", env!("CARGO_PKG_VERSION"));
    let factory = adapter_factory();
    let mut client = ObdClient::connect(&factory, config)
        .await
        .context("Failed to open the interface device")?;

    if cli.command.needs_vehicle() {
        let transport = client.negotiate().await?;
        info!("Vehicle answers on {}", transport);
    }

    let pretty = cli.pretty;
    let outcome = match &cli.command {
        Commands::Negotiate => commands::negotiate(&mut client, pretty).await,
        Commands::Query { pids } => commands::query(&client, pids, pretty).await,
        Commands::Pids { freeze_frame } => {
            commands::supported_pids(&client, *freeze_frame, pretty).await
        }
        Commands::Dtcs { pending } => commands::dtcs(&client, *pending, pretty).await,
        Commands::Freeze { dtc } => commands::freeze_frame(&client, dtc, pretty).await,
        Commands::Clear { yes } => commands::clear(&client, *yes, pretty).await,
        Commands::Monitor {
            pids,
            interval_ms,
            duration_secs,
        } => {
            commands::monitor(
                &mut client,
                pids,
                Duration::from_millis(*interval_ms),
                duration_secs.map(Duration::from_secs),
            )
            .await
        }
        Commands::Voltage => commands::voltage(&client, pretty).await,
        Commands::Status => commands::status(&client, pretty).await,
        Commands::Write { parameter, value } => {
            commands::write(&client, parameter, *value, pretty).await
        }
    };

    let stats = client.statistics().await;
    if stats.requests > 0 {
        info!(
            "{} requests, {:.0}% ok, {:.1}ms average",
            stats.requests,
            stats.success_rate() * 100.0,
            stats.average_response_ms()
        );
    }
    client.close().await?;
    outcome
}
