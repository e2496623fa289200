//! Radar firmware protocols
//!
//! The radar runs one of two firmwares. Each fixes a capability set used by
//! the device reader for every frame:
//!
//! | Capability | Point cloud | Vital sign |
//! |------------|-------------|------------|
//! | decode     | TLV 1/6/7 → points + stats | TLV 6 → rate estimates |
//! | dump       | one CSV row per point | one CSV row per frame |
//! | serialize  | JSON | JSON |
//!
//! The mode is chosen once at startup and never changes for the process
//! lifetime, so it is a plain enum rather than a trait object.

pub mod constants;
pub mod frame;
pub mod header;
pub mod pointcloud;
pub mod vitalsign;

pub use constants::{ENTRY_CAPACITY, HEADER_LEN, MAGIC_WORD, MAX_FRAME_LEN};
pub use frame::{PartialFrameWarning, RawFrame};
pub use header::FrameHeader;
pub use pointcloud::PointCloudFrame;
pub use vitalsign::VitalSignFrame;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Radar firmware selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    PointCloud,
    VitalSign,
}

/// Decoded domain payload of one frame
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    PointCloud(PointCloudFrame),
    VitalSign(VitalSignFrame),
}

/// Serialized record as it travels through the hand-off queue
///
/// Owns its payload; no two entries share storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEntry {
    mode: ProtocolMode,
    payload: String,
}

impl ProtocolMode {
    /// Decode a reassembled frame, complete or partial, into a fresh record
    pub fn decode(self, frame: &RawFrame) -> TelemetryRecord {
        match self {
            ProtocolMode::PointCloud => TelemetryRecord::PointCloud(pointcloud::decode(frame)),
            ProtocolMode::VitalSign => TelemetryRecord::VitalSign(vitalsign::decode(frame)),
        }
    }

    /// Diagnostic CSV rows for a record
    pub fn dump(self, record: &TelemetryRecord) -> Vec<String> {
        match record {
            TelemetryRecord::PointCloud(frame) => pointcloud::dump(frame),
            TelemetryRecord::VitalSign(frame) => vitalsign::dump(frame),
        }
    }

    /// Serialize a record into a queue entry
    ///
    /// Fails if the JSON text does not fit an entry slot.
    pub fn serialize(self, record: &TelemetryRecord) -> Result<TelemetryEntry> {
        let payload = match record {
            TelemetryRecord::PointCloud(frame) => serde_json::to_string(frame)?,
            TelemetryRecord::VitalSign(frame) => serde_json::to_string(frame)?,
        };
        if payload.len() > ENTRY_CAPACITY {
            return Err(Error::EntryTooLarge {
                size: payload.len(),
                capacity: ENTRY_CAPACITY,
            });
        }
        Ok(TelemetryEntry::new(self, payload))
    }

    /// Header row for the CSV lines produced by [`ProtocolMode::dump`]
    pub fn csv_title(self) -> &'static str {
        match self {
            ProtocolMode::PointCloud => pointcloud::CSV_TITLE,
            ProtocolMode::VitalSign => vitalsign::CSV_TITLE,
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMode::PointCloud => write!(f, "pointcloud"),
            ProtocolMode::VitalSign => write!(f, "vitalsign"),
        }
    }
}

impl TelemetryRecord {
    pub fn frame_number(&self) -> u32 {
        match self {
            TelemetryRecord::PointCloud(frame) => frame.frame_number,
            TelemetryRecord::VitalSign(frame) => frame.frame_number,
        }
    }
}

impl TelemetryEntry {
    pub fn new(mode: ProtocolMode, payload: String) -> Self {
        Self { mode, payload }
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// JSON request body
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}
