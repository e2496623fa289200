//! Constants for the mmWave demo output stream

/// Magic word `0x0102 0x0304 0x0506 0x0708` as little-endian u16 words
pub const MAGIC_WORD: [u8; 8] = [0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07];

/// Output message header: magic(8) + 8 × u32
pub const HEADER_LEN: usize = 40;

/// Largest frame the reassembler will hold
pub const MAX_FRAME_LEN: usize = 1024;

/// TLV header: type(u32) + length(u32)
pub const TLV_HEADER_LEN: usize = 8;

// Header field offsets
pub const OFFSET_VERSION: usize = 8;
pub const OFFSET_TOTAL_PACKET_LEN: usize = 12;
pub const OFFSET_PLATFORM: usize = 16;
pub const OFFSET_FRAME_NUMBER: usize = 20;
pub const OFFSET_TIME_CPU_CYCLES: usize = 24;
pub const OFFSET_NUM_DETECTED_OBJ: usize = 28;
pub const OFFSET_NUM_TLVS: usize = 32;
pub const OFFSET_SUB_FRAME_NUMBER: usize = 36;

// TLV types
pub const TLV_DETECTED_POINTS: u32 = 1; // x, y, z, velocity (f32 each)
pub const TLV_RANGE_PROFILE: u32 = 2;
pub const TLV_NOISE_PROFILE: u32 = 3;
pub const TLV_AZIMUTH_STATIC_HEAT_MAP: u32 = 4;
pub const TLV_RANGE_DOPPLER_HEAT_MAP: u32 = 5;
pub const TLV_STATS: u32 = 6; // Point-cloud firmware: timing stats (6 × u32)
pub const TLV_VITAL_SIGNS: u32 = 6; // Vital-sign firmware: estimates (6 × f32)
pub const TLV_POINTS_SIDE_INFO: u32 = 7; // snr, noise (i16 each)
pub const TLV_TEMPERATURE_STATS: u32 = 9;

/// Item sizes inside TLV payloads
pub const POINT_SIZE: usize = 16;
pub const SIDE_INFO_SIZE: usize = 4;
pub const STATS_SIZE: usize = 24;
pub const VITAL_SIGNS_SIZE: usize = 24;

/// Detected objects kept per point-cloud frame
pub const MAX_POINTS: usize = 32;

/// Serialized entry slot size
pub const ENTRY_CAPACITY: usize = 4096;
