//! Device reader thread
//!
//! Waits for the data port to become readable, rebuilds frames, decodes them
//! with the selected protocol and publishes the serialized record to the
//! hand-off queue. Nothing in the loop blocks except the readiness wait,
//! which is bounded by the poll timeout so the exit flag is seen promptly.

use super::{FrameAssembler, FrameSource};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::handoff::{Enqueued, HandoffQueue};
use crate::protocol::{ProtocolMode, RawFrame};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Token for the device descriptor
const DEVICE: Token = Token(0);

const EVENTS_CAPACITY: usize = 8;

/// Device reader counters, shared with the supervisor
#[derive(Debug, Default)]
pub struct IngestStats {
    /// Frames handed to the decoder, complete or partial
    pub frames: AtomicU64,
    /// Frames published with fewer bytes than their header declared
    pub partial_frames: AtomicU64,
    /// Headers rejected for a wrong magic word
    pub bad_magic: AtomicU64,
    /// Records that could not be serialized into a queue entry
    pub decode_failures: AtomicU64,
    /// Entries stored in the hand-off queue
    pub published: AtomicU64,
    /// Queued entries overwritten by a newer one (drop-oldest)
    pub displaced: AtomicU64,
    /// Entries refused by a full queue (reject-new)
    pub rejected: AtomicU64,
    /// Reads from the data port that failed with a hard error
    pub read_errors: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub frames: u64,
    pub partial_frames: u64,
    pub bad_magic: u64,
    pub decode_failures: u64,
    pub published: u64,
    pub displaced: u64,
    pub rejected: u64,
    pub read_errors: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            partial_frames: self.partial_frames.load(Ordering::Relaxed),
            bad_magic: self.bad_magic.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            displaced: self.displaced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Device side of the bridge
///
/// Owns the data port, its readiness poll and the frame being reassembled.
pub struct IngestionEngine<S: FrameSource> {
    source: S,
    poll: Poll,
    assembler: FrameAssembler,
    mode: ProtocolMode,
    queue: Arc<HandoffQueue>,
    shutdown: Arc<AtomicBool>,
    waker: Option<Arc<Waker>>,
    stats: Arc<IngestStats>,
    edge_triggered: bool,
    poll_timeout: Duration,
    reassembly_timeout: Option<Duration>,
}

impl<S: FrameSource> IngestionEngine<S> {
    /// Create the readiness poll and register the device descriptor
    pub fn new(
        source: S,
        mode: ProtocolMode,
        queue: Arc<HandoffQueue>,
        shutdown: Arc<AtomicBool>,
        config: &DeviceConfig,
    ) -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| Error::InitializationFailed(format!("device poll: {}", e)))?;
        let fd = source.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), DEVICE, Interest::READABLE)
            .map_err(|e| {
                Error::InitializationFailed(format!("register device descriptor {}: {}", fd, e))
            })?;

        Ok(Self {
            source,
            poll,
            assembler: FrameAssembler::new(),
            mode,
            queue,
            shutdown,
            waker: None,
            stats: Arc::new(IngestStats::default()),
            edge_triggered: config.edge_triggered,
            poll_timeout: config.poll_timeout(),
            reassembly_timeout: config.reassembly_timeout(),
        })
    }

    /// Wake the delivery thread after each publish
    pub fn with_waker(mut self, waker: Arc<Waker>) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the exit flag is set
    ///
    /// Returns the data port so the caller controls when it is closed.
    pub fn run(mut self) -> Result<S> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        // Level-trigger emulation: data may still be buffered after a pass
        let mut pending = false;

        log::info!(
            "Device reader started ({}, {})",
            self.mode,
            if self.edge_triggered { "edge-triggered" } else { "level-triggered" }
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = if pending {
                Duration::ZERO
            } else {
                self.wait_timeout()
            };

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Device poll failed: {}", e);
                return Err(e.into());
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let ready = pending
                || events.iter().any(|event| {
                    event.token() == DEVICE && (event.is_readable() || event.is_read_closed())
                });

            if ready {
                pending = if self.edge_triggered {
                    self.drain();
                    false
                } else {
                    self.read_pass()
                };
            }

            if let Some(timeout) = self.reassembly_timeout {
                if self.assembler.is_stalled(timeout) {
                    log::debug!(
                        "No data for {:?} with {} bytes buffered",
                        timeout,
                        self.assembler.buffered()
                    );
                    if let Some(frame) = self.assembler.flush() {
                        self.publish(frame);
                    }
                }
            }
        }

        if let Some(frame) = self.assembler.flush() {
            log::info!("Publishing frame in progress before exit");
            self.publish(frame);
        }

        let fd = self.source.as_raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::debug!("Deregister device descriptor: {}", e);
        }

        let stats = self.stats.snapshot();
        log::info!(
            "Device reader exiting: {} frames, {} published, {} bad magic, {} decode failures, {} read errors",
            stats.frames,
            stats.published,
            stats.bad_magic,
            stats.decode_failures,
            stats.read_errors
        );
        Ok(self.source)
    }

    /// Shorter wait while a frame is in progress so a stall is noticed
    fn wait_timeout(&self) -> Duration {
        match self.reassembly_timeout {
            Some(timeout) if self.assembler.buffered() > 0 => self.poll_timeout.min(timeout),
            _ => self.poll_timeout,
        }
    }

    /// Read until the source has nothing more
    fn drain(&mut self) {
        while self.read_pass() {}
    }

    /// One reassembly step; true when the source may still hold data
    fn read_pass(&mut self) -> bool {
        match self.assembler.read_frame(&mut self.source) {
            Ok(Some(frame)) => {
                self.publish(frame);
                true
            }
            Ok(None) => false,
            Err(Error::Framing(e)) => {
                self.stats.bad_magic.fetch_add(1, Ordering::Relaxed);
                log::warn!("Discarding frame: {}", e);
                true
            }
            Err(e) => {
                let count = self.stats.read_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 {
                    log::error!("Device read failed: {}", e);
                } else {
                    log::debug!("Device read failed ({} so far): {}", count, e);
                }
                false
            }
        }
    }

    /// Decode, dump, serialize and enqueue one frame
    fn publish(&mut self, frame: RawFrame) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        if frame.is_partial() {
            self.stats.partial_frames.fetch_add(1, Ordering::Relaxed);
        }

        let record = self.mode.decode(&frame);

        if log::log_enabled!(log::Level::Debug) {
            for row in self.mode.dump(&record) {
                log::debug!("{}", row);
            }
        }

        let entry = match self.mode.serialize(&record) {
            Ok(entry) => entry,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Frame {}: {}", record.frame_number(), e);
                return;
            }
        };

        match self.queue.try_enqueue(entry) {
            Enqueued::Stored => {}
            Enqueued::DisplacedOldest => {
                self.stats.displaced.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Queue full, dropped oldest entry for frame {}",
                    record.frame_number()
                );
            }
            Enqueued::Rejected => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Queue full, dropped frame {}", record.frame_number());
                return;
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake delivery thread: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::reassembler::tests::frame_64;
    use crate::handoff::OverflowPolicy;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Instant;

    fn test_config(edge_triggered: bool) -> DeviceConfig {
        DeviceConfig {
            edge_triggered,
            poll_timeout_ms: 20,
            ..Default::default()
        }
    }

    struct Harness {
        device: UnixStream,
        queue: Arc<HandoffQueue>,
        shutdown: Arc<AtomicBool>,
        stats: Arc<IngestStats>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_engine(config: DeviceConfig, policy: OverflowPolicy) -> Harness {
        let (device, source) = UnixStream::pair().unwrap();
        source.set_nonblocking(true).unwrap();
        spawn_with_source(source, device, ProtocolMode::PointCloud, config, policy)
    }

    fn spawn_with_source<S: FrameSource>(
        source: S,
        device: UnixStream,
        mode: ProtocolMode,
        config: DeviceConfig,
        policy: OverflowPolicy,
    ) -> Harness {
        let queue = Arc::new(HandoffQueue::new(4, policy).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = IngestionEngine::new(
            source,
            mode,
            Arc::clone(&queue),
            Arc::clone(&shutdown),
            &config,
        )
        .unwrap();
        let stats = engine.stats();
        let handle = thread::spawn(move || {
            engine.run().unwrap();
        });
        Harness {
            device,
            queue,
            shutdown,
            stats,
            handle,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn stop(h: Harness) -> IngestSnapshot {
        h.shutdown.store(true, Ordering::Relaxed);
        h.handle.join().unwrap();
        h.stats.snapshot()
    }

    #[test]
    fn test_chunked_frame_published_once() {
        let mut h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let bytes = frame_64();
        for chunk in [&bytes[..8], &bytes[8..40], &bytes[40..]] {
            h.device.write_all(chunk).unwrap();
            thread::sleep(Duration::from_millis(10));
        }

        wait_for(|| h.stats.published.load(Ordering::Relaxed) == 1);
        let entry = h.queue.try_dequeue().unwrap();
        let json: serde_json::Value = serde_json::from_str(entry.payload()).unwrap();
        assert_eq!(json["frame_number"], 1);
        assert_eq!(json["partial"], false);

        let stats = stop(h);
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.partial_frames, 0);
    }

    #[test]
    fn test_bad_magic_counted_not_published() {
        let mut h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let mut bytes = frame_64();
        bytes[3] ^= 0xFF;
        h.device.write_all(&bytes[..40]).unwrap();

        wait_for(|| h.stats.bad_magic.load(Ordering::Relaxed) == 1);
        assert!(h.queue.is_empty());
        let stats = stop(h);
        assert_eq!(stats.published, 0);
    }

    #[test]
    fn test_edge_triggered_drains_burst() {
        let mut h = spawn_engine(test_config(true), OverflowPolicy::DropOldest);
        let burst = [frame_64(), frame_64(), frame_64()].concat();
        h.device.write_all(&burst).unwrap();

        wait_for(|| h.stats.published.load(Ordering::Relaxed) == 3);
        assert_eq!(h.queue.len(), 3);
        stop(h);
    }

    #[test]
    fn test_level_triggered_drains_burst() {
        let mut h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let burst = [frame_64(), frame_64()].concat();
        h.device.write_all(&burst).unwrap();

        wait_for(|| h.stats.published.load(Ordering::Relaxed) == 2);
        stop(h);
    }

    #[test]
    fn test_slow_frame_waits_for_late_bytes() {
        let mut h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let first = frame_64();
        h.device.write_all(&first[..40]).unwrap();
        // Many poll timeouts pass with the body outstanding
        thread::sleep(Duration::from_millis(300));
        h.device.write_all(&first[40..]).unwrap();
        h.device.write_all(&frame_64()).unwrap();

        wait_for(|| h.stats.published.load(Ordering::Relaxed) == 2);
        for _ in 0..2 {
            let entry = h.queue.try_dequeue().unwrap();
            let json: serde_json::Value = serde_json::from_str(entry.payload()).unwrap();
            assert_eq!(json["partial"], false);
        }

        let stats = stop(h);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.partial_frames, 0);
        assert_eq!(stats.bad_magic, 0);
    }

    #[test]
    fn test_stalled_frame_flushed_as_partial() {
        let config = DeviceConfig {
            reassembly_timeout_ms: Some(100),
            ..test_config(false)
        };
        let mut h = spawn_engine(config, OverflowPolicy::DropOldest);
        let bytes = frame_64();
        h.device.write_all(&bytes[..50]).unwrap();

        wait_for(|| h.stats.partial_frames.load(Ordering::Relaxed) == 1);
        let entry = h.queue.try_dequeue().unwrap();
        let json: serde_json::Value = serde_json::from_str(entry.payload()).unwrap();
        assert_eq!(json["partial"], true);
        stop(h);
    }

    #[test]
    fn test_shutdown_flushes_frame_in_progress() {
        let mut h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let bytes = frame_64();
        h.device.write_all(&bytes[..48]).unwrap();
        thread::sleep(Duration::from_millis(200));

        let queue = Arc::clone(&h.queue);
        let stats = stop(h);
        assert_eq!(stats.partial_frames, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_partial_vitalsign_frame_published() {
        let (mut device, source) = UnixStream::pair().unwrap();
        source.set_nonblocking(true).unwrap();
        let config = DeviceConfig {
            reassembly_timeout_ms: Some(100),
            ..test_config(false)
        };
        let h = spawn_with_source(
            source,
            device.try_clone().unwrap(),
            ProtocolMode::VitalSign,
            config,
            OverflowPolicy::DropOldest,
        );

        let header = crate::protocol::FrameHeader {
            total_packet_len: 72,
            frame_number: 5,
            num_tlvs: 1,
            ..Default::default()
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&6u32.to_le_bytes());
        bytes.extend_from_slice(&24u32.to_le_bytes());
        for v in [0.1f32, 0.2, 68.0, 14.0, 14.5, 13.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        device.write_all(&bytes[..60]).unwrap();

        wait_for(|| h.stats.published.load(Ordering::Relaxed) == 1);
        let entry = h.queue.try_dequeue().unwrap();
        let json: serde_json::Value = serde_json::from_str(entry.payload()).unwrap();
        assert_eq!(json["frame_number"], 5);
        assert_eq!(json["partial"], true);
        assert_eq!(json["heart_rate_fft"], 68.0);
        assert_eq!(json["breathing_rate_fft"], 0.0);

        let stats = stop(h);
        assert_eq!(stats.partial_frames, 1);
        assert_eq!(stats.decode_failures, 0);
    }

    #[test]
    fn test_full_queue_rejects_new_frames() {
        let mut h = spawn_engine(test_config(true), OverflowPolicy::RejectNew);
        let burst: Vec<u8> = (0..6).flat_map(|_| frame_64()).collect();
        h.device.write_all(&burst).unwrap();

        wait_for(|| h.stats.frames.load(Ordering::Relaxed) == 6);
        let stats = stop(h);
        assert_eq!(stats.published, 4);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn test_exits_within_poll_timeout() {
        let h = spawn_engine(test_config(false), OverflowPolicy::DropOldest);
        let start = Instant::now();
        stop(h);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    /// Readable descriptor whose reads fail like an unplugged device
    struct FailingPort(UnixStream);

    impl Read for FailingPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
    }

    impl AsRawFd for FailingPort {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    #[test]
    fn test_read_errors_are_counted() {
        let (mut device, source) = UnixStream::pair().unwrap();
        source.set_nonblocking(true).unwrap();
        device.write_all(&[0u8; 8]).unwrap();
        let h = spawn_with_source(
            FailingPort(source),
            device,
            ProtocolMode::PointCloud,
            test_config(false),
            OverflowPolicy::DropOldest,
        );

        wait_for(|| h.stats.read_errors.load(Ordering::Relaxed) >= 1);
        let stats = stop(h);
        assert!(stats.read_errors >= 1);
        assert_eq!(stats.frames, 0);
    }
}
