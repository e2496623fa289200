//! Setu - mmWave radar telemetry bridge
//!
//! Reads the TLV output stream of a TI mmWave radar from its data port,
//! rebuilds frames, decodes them with the selected firmware protocol and
//! forwards each record as a JSON POST to an HTTP endpoint.
//!
//! Two worker threads share a bounded lock-free queue:
//!
//! - `device`: readiness-driven frame reassembly and decoding
//! - `delivery`: non-blocking keep-alive HTTP delivery
//!
//! The `supervisor` acquires all resources, runs both workers and tears them
//! down on SIGINT/SIGTERM.

pub mod config;
pub mod delivery;
pub mod device;
pub mod error;
pub mod handoff;
pub mod protocol;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use supervisor::{RunSummary, Supervisor};
