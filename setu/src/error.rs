//! Error types for Setu

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status for a clean or signal-interrupted run
pub const EXIT_OK: i32 = 0;
/// Exit status when a resource could not be acquired at startup
pub const EXIT_INIT_FAILURE: i32 = 1;
/// Exit status for malformed configuration or arguments
pub const EXIT_BAD_CONFIG: i32 = 2;

/// Frame-level validation failures
///
/// These never leave the device reader: the frame is discarded and the next
/// cycle starts from a fresh header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// First 8 bytes did not match the mmWave magic word
    #[error("bad magic word: {found:02X?}")]
    BadMagic {
        /// Bytes found where the magic word was expected
        found: [u8; 8],
    },
}

/// Setu error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Frame validation failed
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Serialized record does not fit a queue slot
    #[error("Entry too large: {size} bytes (capacity {capacity})")]
    EntryTooLarge {
        /// Serialized size
        size: usize,
        /// Slot capacity
        capacity: usize,
    },

    /// Startup resource acquisition failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A worker thread panicked
    #[error("Worker thread panicked: {0}")]
    ThreadPanic(&'static str),
}

impl Error {
    /// Process exit status for an error that reached `main`
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => EXIT_BAD_CONFIG,
            _ => EXIT_INIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let bad_config = Error::Config("capacity must be positive".into());
        let init = Error::InitializationFailed("no device".into());
        assert_eq!(bad_config.exit_code(), EXIT_BAD_CONFIG);
        assert_eq!(init.exit_code(), EXIT_INIT_FAILURE);
        assert_ne!(EXIT_OK, EXIT_BAD_CONFIG);
        assert_ne!(EXIT_OK, EXIT_INIT_FAILURE);
        assert_ne!(EXIT_BAD_CONFIG, EXIT_INIT_FAILURE);
    }

    #[test]
    fn test_bad_magic_display() {
        let err = Error::from(FramingError::BadMagic { found: [0xAA; 8] });
        assert!(err.to_string().contains("bad magic word"));
    }
}
