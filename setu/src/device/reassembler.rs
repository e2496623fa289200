//! Resumable frame reassembly
//!
//! The data port delivers the stream in chunks that have nothing to do with
//! frame boundaries. `FrameAssembler` keeps the partially built frame between
//! calls, so the device thread can return to its readiness wait (and check
//! the exit flag) between chunks instead of blocking inside one frame.
//!
//! ```text
//!  ┌────────────┐ 40 bytes ┌──────────┐ magic ok ┌────────────┐ target reached
//!  │ Header     │─────────▶│ Validate │─────────▶│ Body       │───────────────▶ RawFrame
//!  │ (≤40 B)    │          └──────────┘          │ (≤1024 B)  │
//!  └────────────┘               │ bad magic      └────────────┘
//!        ▲                      ▼                      │ stall / shutdown
//!        └──────────────── discard ◀───────────────────┴──▶ flush() → partial RawFrame
//! ```
//!
//! Reads never ask for more than the bytes still missing from the current
//! frame, so the first byte of the next frame is never consumed early.

use crate::error::{FramingError, Result};
use crate::protocol::header::{FrameHeader, has_magic};
use crate::protocol::{HEADER_LEN, MAX_FRAME_LEN, RawFrame};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Frame reassembly state retained across wakes
pub struct FrameAssembler {
    buffer: Box<[u8; MAX_FRAME_LEN]>,
    filled: usize,
    /// Set once the header passed magic validation
    header: Option<FrameHeader>,
    /// Bytes wanted for the current stage (header, then clamped frame length)
    target: usize,
    last_progress: Instant,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Box::new([0u8; MAX_FRAME_LEN]),
            filled: 0,
            header: None,
            target: HEADER_LEN,
            last_progress: Instant::now(),
        }
    }

    /// Pull available bytes from `source` into the current frame
    ///
    /// Returns `Ok(Some(frame))` once the (clamped) declared length has been
    /// reached and `Ok(None)` when the source has nothing more right now.
    /// A header with the wrong magic word fails with
    /// [`FramingError::BadMagic`]; its bytes are discarded and the next call
    /// starts a new header.
    pub fn read_frame<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<Option<RawFrame>> {
        loop {
            if self.filled == self.target {
                if let Some(frame) = self.advance_stage()? {
                    return Ok(Some(frame));
                }
                continue;
            }

            match source.read(&mut self.buffer[self.filled..self.target]) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.filled += n;
                    self.last_progress = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Header complete → validate; body complete → emit
    fn advance_stage(&mut self) -> Result<Option<RawFrame>> {
        match self.header {
            None => {
                let bytes = &self.buffer[..HEADER_LEN];
                if !has_magic(bytes) {
                    let mut found = [0u8; 8];
                    found.copy_from_slice(&bytes[..8]);
                    self.reset();
                    return Err(FramingError::BadMagic { found }.into());
                }
                let Some(header) = FrameHeader::parse(bytes) else {
                    self.reset();
                    return Ok(None);
                };
                self.target = header.clamped_len();
                self.header = Some(header);
                if header.total_packet_len as usize > MAX_FRAME_LEN {
                    log::warn!(
                        "Frame {} declares {} bytes, clamped to {}",
                        header.frame_number,
                        header.total_packet_len,
                        MAX_FRAME_LEN
                    );
                }
                if self.filled == self.target {
                    return Ok(Some(self.take_frame()));
                }
                Ok(None)
            }
            Some(_) => Ok(Some(self.take_frame())),
        }
    }

    /// Copy the current frame out and start over
    fn take_frame(&mut self) -> RawFrame {
        let header = self.header.unwrap_or_default();
        let frame = RawFrame::new(header, &self.buffer[..self.filled], self.target);
        self.reset();
        frame
    }

    /// Give up on the frame in progress
    ///
    /// A frame whose header was validated comes back as a partial frame; an
    /// incomplete header is dropped.
    pub fn flush(&mut self) -> Option<RawFrame> {
        if self.header.is_some() {
            let frame = self.take_frame();
            if let Some(warning) = frame.partial() {
                log::warn!(
                    "Frame {}: partial frame, {}",
                    frame.header().frame_number,
                    warning
                );
            }
            return Some(frame);
        }
        if self.filled > 0 {
            log::debug!("Dropping {} bytes of incomplete header", self.filled);
        }
        self.reset();
        None
    }

    /// True when a frame is in progress and has not grown for `timeout`
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.filled > 0 && self.last_progress.elapsed() >= timeout
    }

    /// Bytes of the current frame received so far
    pub fn buffered(&self) -> usize {
        self.filled
    }

    /// Whether the current frame already passed header validation
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.header = None;
        self.target = HEADER_LEN;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
