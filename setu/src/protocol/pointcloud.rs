//! Point-cloud firmware payload
//!
//! Detected points (TLV 1) carry Cartesian position and radial velocity; side
//! info (TLV 7) carries SNR and noise for the point at the same index. Stats
//! (TLV 6) carry DSP timing. Other TLVs are skipped.

use super::constants::*;
use super::frame::RawFrame;
use super::header::{TlvIter, le_f32, le_i16, le_u32};
use serde::Serialize;

/// CSV title matching [`dump`] rows
pub const CSV_TITLE: &str = "Frame Seq, Obj_index, x, y, z, velocity, snr, noise";

/// One detected object
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DetectedPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub velocity: f32,
    pub snr: i16,
    pub noise: i16,
}

/// DSP timing statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FrameStats {
    pub inter_frame_processing_time: u32,
    pub transmit_output_time: u32,
    pub inter_frame_processing_margin: u32,
    pub inter_chirp_processing_margin: u32,
    pub active_frame_cpu_load: u32,
    pub inter_frame_cpu_load: u32,
}

/// Decoded point-cloud frame
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PointCloudFrame {
    pub frame_number: u32,
    pub partial: bool,
    pub points: Vec<DetectedPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FrameStats>,
}

/// Decode a point-cloud frame
///
/// Keeps at most `MAX_POINTS` points and never more than the header's
/// detected-object count. Items cut off by a short frame are left out.
pub fn decode(frame: &RawFrame) -> PointCloudFrame {
    let header = frame.header();
    let max_points = (header.num_detected_obj as usize).min(MAX_POINTS);

    let mut out = PointCloudFrame {
        frame_number: header.frame_number,
        partial: frame.is_partial(),
        points: Vec::with_capacity(max_points),
        stats: None,
    };
    let mut side_info: Vec<(i16, i16)> = Vec::new();

    for tlv in TlvIter::new(frame.bytes(), header.num_tlvs) {
        if tlv.is_truncated() {
            log::debug!(
                "Frame {}: TLV {} truncated ({} of {} bytes)",
                header.frame_number,
                tlv_name(tlv.kind),
                tlv.value.len(),
                tlv.declared_len
            );
        }
        match tlv.kind {
            TLV_DETECTED_POINTS => {
                out.points.extend(
                    tlv.value
                        .chunks_exact(POINT_SIZE)
                        .take(max_points)
                        .filter_map(parse_point),
                );
            }
            TLV_POINTS_SIDE_INFO => {
                side_info.extend(
                    tlv.value
                        .chunks_exact(SIDE_INFO_SIZE)
                        .take(max_points)
                        .filter_map(|c| Some((le_i16(c, 0)?, le_i16(c, 2)?))),
                );
            }
            TLV_STATS => {
                out.stats = parse_stats(tlv.value);
            }
            kind => {
                log::trace!(
                    "Frame {}: skipping TLV {}",
                    header.frame_number,
                    tlv_name(kind)
                );
            }
        }
    }

    for (point, (snr, noise)) in out.points.iter_mut().zip(side_info) {
        point.snr = snr;
        point.noise = noise;
    }
    out
}

/// CSV rows for diagnostic output, one per point
pub fn dump(frame: &PointCloudFrame) -> Vec<String> {
    frame
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "{}, {}, {:.3}, {:.3}, {:.3}, {:.3}, {}, {}",
                frame.frame_number, i, p.x, p.y, p.z, p.velocity, p.snr, p.noise
            )
        })
        .collect()
}

fn parse_point(chunk: &[u8]) -> Option<DetectedPoint> {
    Some(DetectedPoint {
        x: le_f32(chunk, 0)?,
        y: le_f32(chunk, 4)?,
        z: le_f32(chunk, 8)?,
        velocity: le_f32(chunk, 12)?,
        snr: 0,
        noise: 0,
    })
}

fn parse_stats(value: &[u8]) -> Option<FrameStats> {
    if value.len() < STATS_SIZE {
        return None;
    }
    Some(FrameStats {
        inter_frame_processing_time: le_u32(value, 0)?,
        transmit_output_time: le_u32(value, 4)?,
        inter_frame_processing_margin: le_u32(value, 8)?,
        inter_chirp_processing_margin: le_u32(value, 12)?,
        active_frame_cpu_load: le_u32(value, 16)?,
        inter_frame_cpu_load: le_u32(value, 20)?,
    })
}

fn tlv_name(kind: u32) -> &'static str {
    match kind {
        TLV_DETECTED_POINTS => "DETECTED_POINTS",
        TLV_RANGE_PROFILE => "RANGE_PROFILE",
        TLV_NOISE_PROFILE => "NOISE_PROFILE",
        TLV_AZIMUTH_STATIC_HEAT_MAP => "AZIMUTH_STATIC_HEAT_MAP",
        TLV_RANGE_DOPPLER_HEAT_MAP => "RANGE_DOPPLER_HEAT_MAP",
        TLV_STATS => "STATS",
        TLV_POINTS_SIDE_INFO => "POINTS_SIDE_INFO",
        TLV_TEMPERATURE_STATS => "TEMPERATURE_STATS",
        _ => "UNKNOWN",
    }
}
