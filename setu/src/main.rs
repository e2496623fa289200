//! Setu - mmWave radar telemetry bridge
//!
//! # Usage
//!
//! ```bash
//! # Point-cloud firmware on the default data port
//! setu
//!
//! # Vital-sign firmware with a config file and a different endpoint
//! setu --vitalsign --config setu.toml --host 10.0.0.5:10003
//! ```
//!
//! Exit status: 0 after a clean or signal-interrupted run, 1 when the device,
//! endpoint or threads could not be set up, 2 for bad configuration or
//! arguments.

use clap::Parser;
use env_logger::Env;
use setu::error::EXIT_OK;
use setu::protocol::ProtocolMode;
use setu::{Config, Result, Supervisor};
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Radar runs the point-cloud firmware
    #[arg(short, long, conflicts_with = "vitalsign")]
    pointcloud: bool,

    /// Radar runs the vital-sign firmware
    #[arg(short, long)]
    vitalsign: bool,

    /// Data port of the radar (e.g. /dev/ttyACM1)
    #[arg(short, long)]
    device: Option<String>,

    /// Drain the device on every readiness wake
    #[arg(long)]
    edge_triggered: bool,

    /// Telemetry endpoint as host:port
    #[arg(long)]
    host: Option<String>,
}

impl Args {
    /// Load the configuration file, then apply command line overrides
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if self.pointcloud {
            config.protocol.mode = ProtocolMode::PointCloud;
        } else if self.vitalsign {
            config.protocol.mode = ProtocolMode::VitalSign;
        }
        if let Some(device) = self.device {
            config.device.path = device;
        }
        if self.edge_triggered {
            config.device.edge_triggered = true;
        }
        if let Some(host) = self.host {
            config.delivery.host = host;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
}

fn main() {
    let args = Args::parse();
    let config_path = args.config.clone();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            init_logger("info");
            log::error!("{}", e);
            process::exit(e.exit_code());
        }
    };

    init_logger(&config.logging.level);
    log::info!("Setu v{} starting...", env!("CARGO_PKG_VERSION"));
    match config_path {
        Some(path) => log::info!("Using config: {}", path),
        None => log::info!("Using built-in defaults"),
    }
    log::info!("Device: {}", config.device.path);
    log::info!("{}", config.protocol.mode.csv_title());

    let supervisor = match Supervisor::new(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            log::error!("Startup failed: {}", e);
            process::exit(e.exit_code());
        }
    };

    match supervisor.run() {
        Ok(_) => {
            log::info!("Setu stopped");
            process::exit(EXIT_OK);
        }
        Err(e) => {
            log::error!("{}", e);
            process::exit(e.exit_code());
        }
    }
}
