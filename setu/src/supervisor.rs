//! Process supervisor
//!
//! Acquires every resource up front, then runs the two workers:
//!
//! ```text
//!   device ──▶ [device-reader] ──try_enqueue──▶ HandoffQueue ──try_dequeue──▶ [http-delivery] ──▶ endpoint
//!                     │                                                             ▲
//!                     └──────────────────────── Waker ──────────────────────────────┘
//! ```
//!
//! Both workers poll a shared exit flag. SIGINT/SIGTERM set it, and a worker
//! that stops on its own sets it too, so the other one follows within one
//! poll timeout.

use crate::config::Config;
use crate::delivery::{self, DeliveryEngine, DeliverySnapshot, DeliveryStats};
use crate::device::{DeviceSource, FrameSource, IngestSnapshot, IngestStats, IngestionEngine};
use crate::error::{Error, Result};
use crate::handoff::{HandoffQueue, HandoffStats};
use crate::protocol::ProtocolMode;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Counters collected after both workers stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ingest: IngestSnapshot,
    pub delivery: DeliverySnapshot,
    pub queue: HandoffStats,
    /// Entries still queued at exit, discarded undelivered
    pub undelivered: usize,
}

/// Owns the device reader, the delivery engine and the queue between them
pub struct Supervisor<S: FrameSource = DeviceSource> {
    mode: ProtocolMode,
    queue: Arc<HandoffQueue>,
    shutdown: Arc<AtomicBool>,
    ingestion: IngestionEngine<S>,
    delivery: DeliveryEngine,
    ingest_stats: Arc<IngestStats>,
    delivery_stats: Arc<DeliveryStats>,
}

impl Supervisor<DeviceSource> {
    /// Open the configured device and prepare both workers
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let source = DeviceSource::open(&config.device).map_err(|e| {
            Error::InitializationFailed(format!("open {}: {}", config.device.path, e))
        })?;
        Self::with_source(config, source)
    }
}

impl<S: FrameSource> Supervisor<S> {
    /// Prepare both workers around an already opened data port
    pub fn with_source(config: &Config, source: S) -> Result<Self> {
        config.validate()?;
        let mode = config.protocol.mode;
        let path = config.delivery.target_path(mode);
        log::info!("Protocol: {} (POST {} to {})", mode, path, config.delivery.host);

        let queue = Arc::new(HandoffQueue::new(config.queue.capacity, config.queue.overflow)?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let addr = delivery::resolve(&config.delivery.host)?;
        let delivery = DeliveryEngine::new(
            addr,
            path,
            Arc::clone(&queue),
            Arc::clone(&shutdown),
            &config.delivery,
        )?;

        let ingestion = IngestionEngine::new(
            source,
            mode,
            Arc::clone(&queue),
            Arc::clone(&shutdown),
            &config.device,
        )?
        .with_waker(delivery.waker());

        log::info!(
            "Hand-off queue: {} slots, {:?} on overflow",
            queue.capacity(),
            queue.policy()
        );

        Ok(Self {
            mode,
            ingest_stats: ingestion.stats(),
            delivery_stats: delivery.stats(),
            queue,
            shutdown,
            ingestion,
            delivery,
        })
    }

    /// Exit flag shared by both workers; storing `true` stops the run
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// Run both workers until a signal or the exit flag stops them
    pub fn run(self) -> Result<RunSummary> {
        let Self {
            queue,
            shutdown,
            ingestion,
            delivery,
            ingest_stats,
            delivery_stats,
            ..
        } = self;

        let mut signal_ids = Vec::with_capacity(2);
        for signal in [SIGINT, SIGTERM] {
            let id = signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(|e| {
                Error::InitializationFailed(format!("signal handler {}: {}", signal, e))
            })?;
            signal_ids.push(id);
        }

        let delivery_handle = spawn_worker("http-delivery", &shutdown, move || delivery.run())?;
        let reader_handle = match spawn_worker("device-reader", &shutdown, move || {
            ingestion.run()
        }) {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.store(true, Ordering::Relaxed);
                let _ = delivery_handle.join();
                return Err(e);
            }
        };

        log::info!("Bridge running, send SIGINT or SIGTERM to stop");

        // Reverse of start-up: the device context first, then delivery
        let reader_result = reader_handle
            .join()
            .map_err(|_| Error::ThreadPanic("device-reader"));
        let delivery_result = delivery_handle
            .join()
            .map_err(|_| Error::ThreadPanic("http-delivery"));

        for id in signal_ids {
            signal_hook::low_level::unregister(id);
        }

        let source = reader_result??;
        delivery_result??;
        drop(source);

        let summary = RunSummary {
            ingest: ingest_stats.snapshot(),
            delivery: delivery_stats.snapshot(),
            queue: queue.stats(),
            undelivered: match Arc::try_unwrap(queue) {
                Ok(queue) => queue.deinit(),
                Err(queue) => queue.len(),
            },
        };

        log::info!(
            "Stopped: {} frames read, {} published, {} requests sent, {} undelivered",
            summary.ingest.frames,
            summary.ingest.published,
            summary.delivery.requests_sent,
            summary.undelivered
        );
        Ok(summary)
    }
}

/// Spawn a named worker that raises the exit flag when it returns
fn spawn_worker<T, F>(
    name: &str,
    shutdown: &Arc<AtomicBool>,
    work: F,
) -> Result<JoinHandle<Result<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let shutdown = Arc::clone(shutdown);
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = work();
            if let Err(e) = &result {
                log::error!("{} stopped: {}", thread_name, e);
            }
            shutdown.store(true, Ordering::Relaxed);
            result
        })
        .map_err(|e| Error::InitializationFailed(format!("spawn {}: {}", name, e)))
}
