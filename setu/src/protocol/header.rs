//! Output message header and TLV walking
//!
//! Frame layout: [MAGIC(8)] [HEADER FIELDS(32)] [TLV]...
//! where each TLV is [TYPE u32] [LENGTH u32] [VALUE; LENGTH].
//!
//! Every accessor is bounds-checked so a short or corrupt frame can be walked
//! without reading past the received bytes.

use super::constants::*;

/// Parsed output message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub version: u32,
    pub total_packet_len: u32,
    pub platform: u32,
    pub frame_number: u32,
    pub time_cpu_cycles: u32,
    pub num_detected_obj: u32,
    pub num_tlvs: u32,
    pub sub_frame_number: u32,
}

impl FrameHeader {
    /// Parse the header from the start of `bytes`
    ///
    /// Returns `None` if fewer than `HEADER_LEN` bytes are present. The magic
    /// word is not checked here; see [`has_magic`].
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            version: le_u32(bytes, OFFSET_VERSION)?,
            total_packet_len: le_u32(bytes, OFFSET_TOTAL_PACKET_LEN)?,
            platform: le_u32(bytes, OFFSET_PLATFORM)?,
            frame_number: le_u32(bytes, OFFSET_FRAME_NUMBER)?,
            time_cpu_cycles: le_u32(bytes, OFFSET_TIME_CPU_CYCLES)?,
            num_detected_obj: le_u32(bytes, OFFSET_NUM_DETECTED_OBJ)?,
            num_tlvs: le_u32(bytes, OFFSET_NUM_TLVS)?,
            sub_frame_number: le_u32(bytes, OFFSET_SUB_FRAME_NUMBER)?,
        })
    }

    /// Declared frame length clamped to what the reassembler can hold
    ///
    /// Never below the header itself, never above `MAX_FRAME_LEN`.
    pub fn clamped_len(&self) -> usize {
        (self.total_packet_len as usize).clamp(HEADER_LEN, MAX_FRAME_LEN)
    }

    /// Encode the header (magic word included), used by tests and tooling
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(&MAGIC_WORD);
        let fields = [
            (OFFSET_VERSION, self.version),
            (OFFSET_TOTAL_PACKET_LEN, self.total_packet_len),
            (OFFSET_PLATFORM, self.platform),
            (OFFSET_FRAME_NUMBER, self.frame_number),
            (OFFSET_TIME_CPU_CYCLES, self.time_cpu_cycles),
            (OFFSET_NUM_DETECTED_OBJ, self.num_detected_obj),
            (OFFSET_NUM_TLVS, self.num_tlvs),
            (OFFSET_SUB_FRAME_NUMBER, self.sub_frame_number),
        ];
        for (offset, value) in fields {
            out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// Check the first 8 bytes against the magic word
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC_WORD.len() && bytes[..MAGIC_WORD.len()] == MAGIC_WORD
}

/// One TLV view into a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub kind: u32,
    /// Value bytes, shortened if the frame ended early
    pub value: &'a [u8],
    /// Length the TLV header declared
    pub declared_len: usize,
}

impl Tlv<'_> {
    pub fn is_truncated(&self) -> bool {
        self.value.len() < self.declared_len
    }
}

/// Iterator over the TLVs following the header
///
/// Stops at `num_tlvs` or when the next TLV header does not fit. A TLV whose
/// declared length runs past the end is yielded truncated and ends iteration.
pub struct TlvIter<'a> {
    data: &'a [u8],
    remaining: u32,
}

impl<'a> TlvIter<'a> {
    /// Walk the TLVs of a frame (header included in `frame`)
    pub fn new(frame: &'a [u8], num_tlvs: u32) -> Self {
        let data = frame.get(HEADER_LEN..).unwrap_or(&[]);
        Self {
            data,
            remaining: num_tlvs,
        }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.data.len() < TLV_HEADER_LEN {
            return None;
        }
        self.remaining -= 1;

        let kind = le_u32(self.data, 0)?;
        let declared_len = le_u32(self.data, 4)? as usize;
        let body = &self.data[TLV_HEADER_LEN..];

        if declared_len > body.len() {
            self.data = &[];
            self.remaining = 0;
            return Some(Tlv {
                kind,
                value: body,
                declared_len,
            });
        }

        let (value, rest) = body.split_at(declared_len);
        self.data = rest;
        Some(Tlv {
            kind,
            value,
            declared_len,
        })
    }
}

#[inline]
pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub(crate) fn le_f32(bytes: &[u8], offset: usize) -> Option<f32> {
    le_u32(bytes, offset).map(f32::from_bits)
}

#[inline]
pub(crate) fn le_i16(bytes: &[u8], offset: usize) -> Option<i16> {
    let b = bytes.get(offset..offset + 2)?;
    Some(i16::from_le_bytes([b[0], b[1]]))
}
