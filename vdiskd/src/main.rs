//! Daemon hosting the vdisk block-device manager.
//!
//! `vdiskd serve` loads a registry and exposes it over a small HTTP control
//! API until `POST /shutdown`; `vdiskd bench` measures the submit path of one
//! device.

mod api;
mod bench;
mod namer;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vdisk::{BackingKind, ControlSurface, ManagerConfig, Registry};

use crate::bench::BenchOptions;
use crate::namer::LoggingNamer;

/// vdiskd: virtual block devices backed by memory, files or swap-backed pages.
#[derive(Parser)]
#[command(name = "vdiskd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API.
    Serve {
        /// Port for the HTTP control API (bound on 127.0.0.1).
        #[arg(long, default_value = "9200")]
        port: u16,

        /// JSON file with manager limits.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the maximum number of attached devices.
        #[arg(long)]
        max_devices: Option<u32>,
    },

    /// Run a submit-path throughput benchmark against one device.
    Bench {
        /// Backing medium (memory, file, swap).
        #[arg(long, default_value = "memory")]
        kind: BackingKind,

        /// Device size in MiB.
        #[arg(long, default_value = "64")]
        size_mib: u64,

        /// Number of requests per phase.
        #[arg(long, default_value = "10000")]
        requests: u64,

        /// Request size in KiB.
        #[arg(long, default_value = "64")]
        block_kib: u64,

        /// Maximum requests in flight.
        #[arg(long, default_value = "32")]
        depth: usize,

        /// Backing file for `--kind file` (a scratch file is used otherwise).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            port,
            config,
            max_devices,
        } => cmd_serve(port, config.as_deref(), max_devices),
        Commands::Bench {
            kind,
            size_mib,
            requests,
            block_kib,
            depth,
            path,
        } => bench::cmd_bench(&BenchOptions {
            kind,
            size_mib,
            requests,
            block_kib,
            depth,
            path,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `vdiskd serve`.
fn cmd_serve(
    port: u16,
    config_path: Option<&std::path::Path>,
    max_devices: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(max) = max_devices {
        config.max_devices = max;
    }

    let control = ControlSurface::new(Registry::load(config, LoggingNamer::new())?);
    api::run_api_server(&control, port)?;

    control.unload()?;
    tracing::info!("vdiskd exited cleanly");
    Ok(())
}
