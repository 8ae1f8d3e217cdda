#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sbdlink
//!
//! Satellite SBD modem link daemon for embedded Linux devices.
//!
//! sbdlink drives an Iridium-class short-burst-data modem and its companion
//! aux control board over one shared serial line: outbound reports are
//! picked from a spool directory and transmitted with retries, incoming
//! (mobile-terminated) messages are verified, routed, and saved, and the
//! signal/gateway/call state is polled in the background.
//!
//! ## Subcommands
//!
//! - `sbdlink serve` (default) — run the link daemon
//! - `sbdlink supervise` — run as supervisor: starts the daemon and
//!   restarts it on crash

mod supervisor;

use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use sbdlink::api::{ModemLink, Tunables};
use sbdlink::config::Config;
use sbdlink::hooks::NullHooks;
use sbdlink::log::ModemLogger;
use sbdlink::mt::NotificationMode;
use sbdlink::power::{CommandPower, NullPower, PowerManager};
use sbdlink::protocol::ProtocolEngine;
use sbdlink::spool::Spool;
use sbdlink::transport::TtyPort;

/// Satellite SBD modem link daemon for embedded Linux devices.
#[derive(Parser)]
#[command(name = "sbdlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the link daemon (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the daemon and restarts on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_daemon(config.as_deref()).await;
        }
        None => {
            run_daemon(None).await;
        }
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("sbdlink supervisor starting");
    supervisor::run_supervisor(config_path, &config.supervisor).await
}

async fn run_daemon(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("sbdlink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Serial device: {} @ {}", config.serial.device, config.serial.baud);
    info!("Spool: {}", config.spool.data_dir);

    let spool = Spool::new(&config.spool.data_dir);
    if let Err(e) = spool.ensure_tree() {
        error!("Cannot prepare spool tree: {e}");
        std::process::exit(1);
    }

    let port = match TtyPort::open(&config.serial.device, config.serial.baud) {
        Ok(port) => port,
        Err(e) => {
            error!("Cannot open serial device: {e}");
            std::process::exit(1);
        }
    };

    let power: Box<dyn PowerManager> = if config.power.modem_cycle_cmd.is_empty()
        && config.power.aux_cycle_cmd.is_empty()
    {
        warn!("No power-cycle commands configured, stuck-link recovery is limited");
        Box::new(NullPower)
    } else {
        let opt = |s: &String| (!s.is_empty()).then(|| s.clone());
        Box::new(CommandPower::new(
            opt(&config.power.modem_cycle_cmd),
            opt(&config.power.aux_cycle_cmd),
        ))
    };

    let logger = ModemLogger::new(Some(Path::new(&config.spool.data_dir)));
    let engine = ProtocolEngine::new(
        port,
        Box::new(sbdlink::clock::SystemClock),
        power,
        Box::new(NullHooks),
        spool,
        NotificationMode::from_name(&config.notification.mode),
    );
    let mut link = ModemLink::new(engine, logger, Tunables::from_config(&config));

    let mut ticker = tokio::time::interval(Duration::from_millis(config.timing.tick_ms));

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };
    tokio::pin!(shutdown);

    info!("Link ready");

    loop {
        tokio::select! {
            _ = ticker.tick() => link.process_tick(),
            () = &mut shutdown => break,
        }
    }

    info!("Shutting down...");
    info!("Goodbye");
}
