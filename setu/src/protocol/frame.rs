//! Owned copy of one reassembled device frame

use super::constants::MAX_FRAME_LEN;
use super::header::FrameHeader;
use std::fmt;

/// A frame shorter than its declared (clamped) length
///
/// Recoverable: the frame is still decoded and published, and decoders only
/// read the bytes that actually arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialFrameWarning {
    pub received: usize,
    pub expected: usize,
}

impl fmt::Display for PartialFrameWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {} of {} frame bytes",
            self.received, self.expected
        )
    }
}

/// One device frame copied out of the reassembly buffer
///
/// Owns its bytes so the reassembler can start the next frame while this one
/// is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    header: FrameHeader,
    bytes: Vec<u8>,
    expected_len: usize,
}

impl RawFrame {
    /// Build a frame from reassembled bytes (header included)
    ///
    /// Bytes beyond `MAX_FRAME_LEN` are never stored.
    pub fn new(header: FrameHeader, bytes: &[u8], expected_len: usize) -> Self {
        let len = bytes.len().min(MAX_FRAME_LEN);
        Self {
            header,
            bytes: bytes[..len].to_vec(),
            expected_len: expected_len.min(MAX_FRAME_LEN),
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Received bytes, header included
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// `Some` when fewer bytes arrived than the header declared
    pub fn partial(&self) -> Option<PartialFrameWarning> {
        (self.bytes.len() < self.expected_len).then_some(PartialFrameWarning {
            received: self.bytes.len(),
            expected: self.expected_len,
        })
    }

    pub fn is_partial(&self) -> bool {
        self.partial().is_some()
    }
}
