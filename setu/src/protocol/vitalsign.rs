//! Vital-sign firmware payload
//!
//! The vital-sign TLV carries the filtered waveform outputs and rate
//! estimates for the tracked subject as little-endian f32 values:
//!
//! ```text
//! [breath_out] [heart_out] [heart_rate_fft] [breathing_rate_fft]
//! [breathing_rate_xcorr] [breathing_peak_count]
//! ```

use super::constants::TLV_VITAL_SIGNS;
use super::frame::RawFrame;
use super::header::{TlvIter, le_f32};
use serde::Serialize;

/// CSV title matching [`dump`] rows
pub const CSV_TITLE: &str = "Frame Seq, OF_HeartOut, BR_Est_FFT, BR_Est_xCorr, BR_peakCount";

/// Decoded vital-sign frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VitalSignFrame {
    pub frame_number: u32,
    pub partial: bool,
    pub breath_out: f32,
    pub heart_out: f32,
    pub heart_rate_fft: f32,
    pub breathing_rate_fft: f32,
    pub breathing_rate_xcorr: f32,
    pub breathing_peak_count: f32,
}

/// Decode a vital-sign frame
///
/// Only the bytes that arrived are read. Fields cut off by a short frame,
/// or missing because the frame has no vital-sign TLV, stay at 0.0.
pub fn decode(frame: &RawFrame) -> VitalSignFrame {
    let header = frame.header();
    let value = TlvIter::new(frame.bytes(), header.num_tlvs)
        .find(|tlv| tlv.kind == TLV_VITAL_SIGNS)
        .map(|tlv| tlv.value)
        .unwrap_or(&[]);
    let field = |offset| le_f32(value, offset).unwrap_or(0.0);

    VitalSignFrame {
        frame_number: header.frame_number,
        partial: frame.is_partial(),
        breath_out: field(0),
        heart_out: field(4),
        heart_rate_fft: field(8),
        breathing_rate_fft: field(12),
        breathing_rate_xcorr: field(16),
        breathing_peak_count: field(20),
    }
}

/// CSV row for diagnostic output
pub fn dump(frame: &VitalSignFrame) -> Vec<String> {
    vec![format!(
        "{}, {:.4}, {:.2}, {:.2}, {:.2}",
        frame.frame_number,
        frame.heart_out,
        frame.breathing_rate_fft,
        frame.breathing_rate_xcorr,
        frame.breathing_peak_count
    )]
}
