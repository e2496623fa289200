//! Radar data port
//!
//! The radar emits its output stream on a character device. It is opened for
//! non-blocking reads and registered with a readiness poll; reads return
//! whatever bytes are buffered and never wait for more.
//!
//! - `reassembler`: rebuilds one frame from arbitrarily sized chunks
//! - `reader`: the device thread loop (wait, reassemble, decode, publish)

pub mod reassembler;
pub mod reader;

pub use reassembler::FrameAssembler;
pub use reader::{IngestSnapshot, IngestStats, IngestionEngine};

use crate::config::DeviceConfig;
use crate::error::Result;
use serialport::TTYPort;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Anything the device reader can poll and read frames from
pub trait FrameSource: Read + AsRawFd + Send + 'static {}

impl<T: Read + AsRawFd + Send + 'static> FrameSource for T {}

/// Opened radar data port
pub enum DeviceSource {
    /// Serial tty configured 8N1 at a fixed rate
    Serial(TTYPort),
    /// Character device opened as-is (USB CDC ports ignore the baud rate)
    Raw(File),
}

impl DeviceSource {
    /// Open the device named in the configuration
    ///
    /// A configured `baud_rate` selects a serial tty; otherwise the path is
    /// opened raw with `O_NONBLOCK`.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        match config.baud_rate {
            Some(baud_rate) => Self::open_serial(&config.path, baud_rate),
            None => Self::open_raw(&config.path),
        }
    }

    fn open_serial(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::ZERO) // readiness comes from the poll, never wait in read
            .open_native()?;

        log::info!("Opened serial device: {} at {} baud", path, baud_rate);
        Ok(DeviceSource::Serial(port))
    }

    fn open_raw(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;

        log::info!("Opened device: {}", path);
        Ok(DeviceSource::Raw(file))
    }
}

impl Read for DeviceSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DeviceSource::Serial(port) => port.read(buf),
            DeviceSource::Raw(file) => file.read(buf),
        }
    }
}

impl AsRawFd for DeviceSource {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            DeviceSource::Serial(port) => port.as_raw_fd(),
            DeviceSource::Raw(file) => file.as_raw_fd(),
        }
    }
}
