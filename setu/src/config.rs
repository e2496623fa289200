//! Configuration for the Setu bridge
//!
//! Loaded from a TOML file; every section falls back to defaults so a file
//! only needs the values it changes. CLI flags are applied on top in `main`.

use crate::error::{Error, Result};
use crate::handoff::OverflowPolicy;
use crate::protocol::ProtocolMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub delivery: DeliveryConfig,
    pub queue: QueueConfig,
    pub protocol: ProtocolConfig,
    pub logging: LoggingConfig,
}

/// Radar data port
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Character device carrying the TLV stream
    pub path: String,
    /// Configure the device as a serial tty at this rate; raw open when unset
    pub baud_rate: Option<u32>,
    /// Drain the device on every wake instead of one read pass per wake
    pub edge_triggered: bool,
    /// Readiness wait bound; also the exit-flag polling interval
    pub poll_timeout_ms: u64,
    /// Publish a frame as partial once it stops growing for this long;
    /// unset keeps reassembling until the frame completes or the bridge stops
    pub reassembly_timeout_ms: Option<u64>,
}

/// HTTP telemetry endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Endpoint as `host:port`, also used for the Host header
    pub host: String,
    /// Request path for point-cloud records
    pub pointcloud_path: String,
    /// Request path for vital-sign records
    pub vitalsign_path: String,
    /// Concurrent connections to the endpoint
    pub concurrency: usize,
    /// Readiness wait bound; also the exit-flag polling interval
    pub poll_timeout_ms: u64,
    /// First reconnect delay after a fault (0 reconnects immediately)
    pub reconnect_backoff_initial_ms: u64,
    /// Upper bound for the reconnect delay
    pub reconnect_backoff_max_ms: u64,
}

/// Hand-off queue between the reader and delivery threads
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

/// Radar firmware selection
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub mode: ProtocolMode,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyACM1".to_string(),
            baud_rate: None,
            edge_triggered: false,
            poll_timeout_ms: 1000,
            reassembly_timeout_ms: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            host: "49.159.114.50:10003".to_string(),
            pointcloud_path: "/2020test/2020test".to_string(),
            vitalsign_path: "/2020test/sendVitalData".to_string(),
            concurrency: 1,
            poll_timeout_ms: 5000,
            reconnect_backoff_initial_ms: 100,
            reconnect_backoff_max_ms: 10_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn reassembly_timeout(&self) -> Option<Duration> {
        self.reassembly_timeout_ms.map(Duration::from_millis)
    }
}

impl DeliveryConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Request path bound to a protocol mode
    pub fn target_path(&self, mode: ProtocolMode) -> &str {
        match mode {
            ProtocolMode::PointCloud => &self.pointcloud_path,
            ProtocolMode::VitalSign => &self.vitalsign_path,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use setu::config::Config;
    ///
    /// let config = Config::load("setu.toml")?;
    /// # Ok::<(), setu::Error>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.device.path.is_empty() {
            return Err(Error::Config("device.path is empty".into()));
        }
        if self.device.poll_timeout_ms == 0 || self.delivery.poll_timeout_ms == 0 {
            return Err(Error::Config("poll timeouts must be positive".into()));
        }
        if self.queue.capacity == 0 {
            return Err(Error::Config("queue.capacity must be positive".into()));
        }
        if self.delivery.concurrency == 0 {
            return Err(Error::Config("delivery.concurrency must be positive".into()));
        }
        if !self.delivery.host.contains(':') {
            return Err(Error::Config(format!(
                "delivery.host '{}' is not host:port",
                self.delivery.host
            )));
        }
        for path in [&self.delivery.pointcloud_path, &self.delivery.vitalsign_path] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "request path '{}' must start with '/'",
                    path
                )));
            }
        }
        if self.delivery.reconnect_backoff_initial_ms > self.delivery.reconnect_backoff_max_ms {
            return Err(Error::Config(
                "reconnect_backoff_initial_ms exceeds reconnect_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}
