//! HTTP delivery thread
//!
//! Drains the hand-off queue into keep-alive HTTP connections. Each
//! connection carries one request at a time; a faulted connection is torn
//! down and replaced after a backoff delay. Everything runs on one mio poll:
//!
//! - `Token(0)`: waker, poked by the device reader after each publish
//! - `Token(1..=n)`: one per connection slot
//!
//! Delivery is lossy. An entry that cannot be written immediately is dropped
//! rather than retried, so the queue always holds the newest telemetry.

pub mod backoff;
pub mod connection;
pub mod request;

pub use backoff::Backoff;
pub use connection::{ConnectionState, DeliveryConnection, ReceiveOutcome, SendOutcome};
pub use request::{StatusLine, build_request, parse_status};

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::handoff::HandoffQueue;
use mio::{Events, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WAKER: Token = Token(0);

const EVENTS_CAPACITY: usize = 64;

/// Delivery counters, shared with the supervisor
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// Requests written in full
    pub requests_sent: AtomicU64,
    /// Dequeued entries that could not be written and were dropped
    pub send_failures: AtomicU64,
    /// Responses read, whatever their status
    pub responses: AtomicU64,
    /// Responses with a non-2xx status
    pub error_responses: AtomicU64,
    /// Connections torn down, plus connect attempts that failed outright
    pub faults: AtomicU64,
    /// Connections opened, the first one included
    pub reconnects: AtomicU64,
    /// Poll timeouts that delivered no event
    pub idle_wakes: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub requests_sent: u64,
    pub send_failures: u64,
    pub responses: u64,
    pub error_responses: u64,
    pub faults: u64,
    pub reconnects: u64,
    pub idle_wakes: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            error_responses: self.error_responses.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            idle_wakes: self.idle_wakes.load(Ordering::Relaxed),
        }
    }
}

/// Resolve `host:port` to the first socket address
pub fn resolve(host: &str) -> Result<SocketAddr> {
    host.to_socket_addrs()
        .map_err(|e| Error::InitializationFailed(format!("resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::InitializationFailed(format!("{} resolved to no address", host)))
}

/// One concurrency slot: a live connection or a pending reconnect
struct Slot {
    conn: Option<DeliveryConnection>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

/// Network side of the bridge
pub struct DeliveryEngine {
    poll: Poll,
    waker: Arc<Waker>,
    slots: Vec<Slot>,
    addr: SocketAddr,
    host: String,
    path: String,
    queue: Arc<HandoffQueue>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<DeliveryStats>,
    poll_timeout: Duration,
}

impl DeliveryEngine {
    /// Create the poll and waker; connections are opened when the loop starts
    pub fn new(
        addr: SocketAddr,
        path: &str,
        queue: Arc<HandoffQueue>,
        shutdown: Arc<AtomicBool>,
        config: &DeliveryConfig,
    ) -> Result<Self> {
        let poll = Poll::new()
            .map_err(|e| Error::InitializationFailed(format!("delivery poll: {}", e)))?;
        let waker = Waker::new(poll.registry(), WAKER)
            .map_err(|e| Error::InitializationFailed(format!("delivery waker: {}", e)))?;

        let initial = Duration::from_millis(config.reconnect_backoff_initial_ms);
        let max = Duration::from_millis(config.reconnect_backoff_max_ms);
        let slots = (0..config.concurrency.max(1))
            .map(|_| Slot {
                conn: None,
                backoff: Backoff::new(initial, max),
                retry_at: Some(Instant::now()),
            })
            .collect();

        Ok(Self {
            poll,
            waker: Arc::new(waker),
            slots,
            addr,
            host: config.host.clone(),
            path: path.to_string(),
            queue,
            shutdown,
            stats: Arc::new(DeliveryStats::default()),
            poll_timeout: config.poll_timeout(),
        })
    }

    /// Handle for the device reader to wake this loop
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the exit flag is set
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        log::info!(
            "HTTP delivery started: {} connection(s) to {}{}",
            self.slots.len(),
            self.addr,
            self.path
        );

        self.reconnect_due();

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout = self.wait_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Delivery poll failed: {}", e);
                self.close_all();
                return Err(e.into());
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if events.is_empty() {
                self.stats.idle_wakes.fetch_add(1, Ordering::Relaxed);
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                // Slot waiting to reconnect: event for a socket closed this wake
                let Some(conn) = self.slot_mut(token).and_then(|slot| slot.conn.as_mut()) else {
                    continue;
                };
                conn.note_event(event);
            }

            for index in 0..self.slots.len() {
                self.service(index);
            }
            self.reconnect_due();
        }

        self.close_all();
        let stats = self.stats.snapshot();
        log::info!(
            "HTTP delivery exiting: {} sent, {} responses, {} send failures, {} faults",
            stats.requests_sent,
            stats.responses,
            stats.send_failures,
            stats.faults
        );
        Ok(())
    }

    fn slot_mut(&mut self, token: Token) -> Option<&mut Slot> {
        token.0.checked_sub(1).and_then(|i| self.slots.get_mut(i))
    }

    /// Poll timeout bounded by the nearest reconnect deadline
    fn wait_timeout(&self) -> Duration {
        let now = Instant::now();
        self.slots
            .iter()
            .filter_map(|slot| slot.retry_at)
            .map(|at| at.saturating_duration_since(now))
            .fold(self.poll_timeout, Duration::min)
    }

    /// Advance one connection as far as its cached readiness allows
    fn service(&mut self, index: usize) {
        let Slot { conn, backoff, .. } = &mut self.slots[index];
        let Some(conn) = conn.as_mut() else {
            return;
        };

        if let Some(reason) = conn.health_check() {
            log::warn!("{:?}: socket error: {}", conn.token(), reason);
            conn.mark_faulted();
        }

        loop {
            match conn.state() {
                ConnectionState::Connecting => {
                    if !conn.complete_connect() {
                        break;
                    }
                    backoff.reset();
                    log::info!("{:?}: connected to {}", conn.token(), self.addr);
                }
                ConnectionState::Sending => {
                    conn.discard_unsolicited();
                    if conn.state() != ConnectionState::Sending || !conn.is_writable() {
                        break;
                    }
                    let Some(entry) = self.queue.try_dequeue() else {
                        break;
                    };
                    let request = build_request(&self.path, &self.host, entry.payload());
                    match conn.send(&request) {
                        SendOutcome::Sent => {
                            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
                            log::trace!("{:?}: sent {} bytes", conn.token(), request.len());
                        }
                        SendOutcome::WouldBlock => {
                            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                            log::debug!("{:?}: socket busy, dropped entry", conn.token());
                            break;
                        }
                        SendOutcome::Failed => {
                            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                ConnectionState::Receiving => match conn.receive() {
                    ReceiveOutcome::Response(status) => {
                        self.stats.responses.fetch_add(1, Ordering::Relaxed);
                        match status {
                            Some(status) if status.is_success() => {
                                log::debug!(
                                    "{:?}: {} {}",
                                    conn.token(),
                                    status.code,
                                    status.reason
                                );
                            }
                            Some(status) => {
                                self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
                                log::warn!(
                                    "{:?}: endpoint returned {} {}",
                                    conn.token(),
                                    status.code,
                                    status.reason
                                );
                            }
                            None => log::debug!("{:?}: unparseable response", conn.token()),
                        }
                    }
                    ReceiveOutcome::Pending => break,
                    ReceiveOutcome::Failed => {}
                },
                ConnectionState::Faulted => {
                    self.fault(index);
                    break;
                }
            }
        }
    }

    /// Tear down a faulted connection and schedule its replacement
    fn fault(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(conn) = slot.conn.take() else {
            return;
        };
        let token = conn.token();
        conn.close(self.poll.registry());
        self.stats.faults.fetch_add(1, Ordering::Relaxed);

        let delay = slot.backoff.next_delay();
        slot.retry_at = Some(Instant::now() + delay);
        log::warn!("{:?}: connection faulted, reconnecting in {:?}", token, delay);
    }

    /// Open connections for slots whose backoff has elapsed
    fn reconnect_due(&mut self) {
        let now = Instant::now();
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            match slot.retry_at {
                Some(at) if at <= now => {}
                _ => continue,
            }
            slot.retry_at = None;

            let token = Token(index + 1);
            match DeliveryConnection::connect(self.poll.registry(), self.addr, token) {
                Ok(conn) => {
                    log::debug!("{:?}: connecting to {}", token, self.addr);
                    slot.conn = Some(conn);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.faults.fetch_add(1, Ordering::Relaxed);
                    let delay = slot.backoff.next_delay();
                    slot.retry_at = Some(now + delay);
                    log::warn!("{:?}: connect to {} failed: {}", token, self.addr, e);
                }
            }
        }
    }

    fn close_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(conn) = slot.conn.take() {
                conn.close(self.poll.registry());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::OverflowPolicy;
    use crate::protocol::{ProtocolMode, TelemetryEntry};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::thread;

    fn test_config(host: String) -> DeliveryConfig {
        DeliveryConfig {
            host,
            poll_timeout_ms: 20,
            reconnect_backoff_initial_ms: 0,
            ..Default::default()
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_resolve_literal_address() {
        let addr = resolve("127.0.0.1:10003").unwrap();
        assert_eq!(addr.port(), 10003);
        assert!(resolve("not an address").is_err());
    }

    #[test]
    fn test_delivers_entry_and_reads_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = test_config(addr.to_string());

        let engine =
            DeliveryEngine::new(addr, "/ingest", Arc::clone(&queue), Arc::clone(&shutdown), &config)
                .unwrap();
        let waker = engine.waker();
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        let (mut server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        queue.try_enqueue(TelemetryEntry::new(ProtocolMode::PointCloud, "{\"n\":1}".into()));
        waker.wake().unwrap();

        let mut buf = [0u8; 512];
        let n = server.read(&mut buf).unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(request.starts_with("POST /ingest HTTP/1.1\r\n"));
        assert!(request.contains(&format!("Host: {}\r\n", addr)));
        assert!(request.ends_with("\r\n\r\n{\"n\":1}"));

        server.write_all(b"HTTP/1.1 500 Internal Server Error\r\n\r\n").unwrap();
        wait_for(|| stats.responses.load(Ordering::Relaxed) == 1);

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();

        let stats = stats.snapshot();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.error_responses, 1);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_refused_endpoint_keeps_reconnecting() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = DeliveryEngine::new(
            addr,
            "/ingest",
            queue,
            Arc::clone(&shutdown),
            &test_config(addr.to_string()),
        )
        .unwrap();
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        wait_for(|| stats.faults.load(Ordering::Relaxed) >= 3);
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        assert_eq!(stats.requests_sent.load(Ordering::Relaxed), 0);
    }

    /// Make the next close send RST instead of FIN
    fn reset_on_close(stream: &TcpStream) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_reset_connection_replaced_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = DeliveryEngine::new(
            addr,
            "/ingest",
            queue,
            Arc::clone(&shutdown),
            &test_config(addr.to_string()),
        )
        .unwrap();
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        let (server, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(50));
        reset_on_close(&server);
        drop(server);

        // The replacement completes through the listen backlog
        wait_for(|| stats.reconnects.load(Ordering::Relaxed) == 2);
        thread::sleep(Duration::from_millis(200));

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();

        let stats = stats.snapshot();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.requests_sent, 0);
        drop(listener);
    }

    #[test]
    fn test_idle_engine_stops_within_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let queue = Arc::new(HandoffQueue::new(4, OverflowPolicy::DropOldest).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = DeliveryEngine::new(
            addr,
            "/",
            queue,
            Arc::clone(&shutdown),
            &test_config(addr.to_string()),
        )
        .unwrap();
        let stats = engine.stats();
        let handle = thread::spawn(move || engine.run());

        wait_for(|| stats.idle_wakes.load(Ordering::Relaxed) >= 2);
        let start = Instant::now();
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        drop(listener);
    }
}
