//! Buffer between bursty `track()` calls and first-party ingestion.
//!
//! Events accumulate in a live buffer and are shipped when the buffer reaches
//! `max_size` or when the periodic timer fires. A flush takes the whole buffer
//! before sending anything, and only one flush runs at a time; a flush that
//! arrives while another is in flight is a no-op. On unload the remaining
//! buffer is handed to the beacon transport once, without retry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::events::TrackingEvent;
use crate::logging::{log, obj, v_str, Domain, Level};

pub mod retry;
pub mod transport;

pub use retry::{retry_async, RetryConfig};
pub use transport::{HttpTransport, RecordingTransport, Transport};

/// Shortest period the flush timer accepts; a zero interval would panic.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// When false, every event is delivered on its own as soon as it arrives.
    pub enabled: bool,
    pub max_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 50,
            flush_interval: Duration::from_millis(2000),
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            enabled: cfg.enable_queue,
            max_size: cfg.queue_max_size.max(1),
            flush_interval: cfg.flush_interval().max(MIN_FLUSH_INTERVAL),
            retry: RetryConfig {
                max_attempts: cfg.max_attempts,
                base_delay_ms: cfg.retry_delay_ms,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub flushes: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    pub beaconed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    flushes: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
    beaconed: AtomicU64,
}

struct Inner {
    config: QueueConfig,
    buffer: Mutex<Vec<TrackingEvent>>,
    processing: AtomicBool,
    transport: Arc<dyn Transport>,
    counters: Counters,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Clears `processing` however the flush ends, including task abort.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    pub fn new(config: QueueConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buffer: Mutex::new(Vec::new()),
                processing: AtomicBool::new(false),
                transport,
                counters: Counters::default(),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::SeqCst),
            flushes: c.flushes.load(Ordering::SeqCst),
            delivered: c.delivered.load(Ordering::SeqCst),
            failed_attempts: c.failed_attempts.load(Ordering::SeqCst),
            dropped: c.dropped.load(Ordering::SeqCst),
            beaconed: c.beaconed.load(Ordering::SeqCst),
        }
    }

    /// Accept an event. Never blocks on the network: delivery happens on a
    /// spawned task.
    pub fn enqueue(&self, event: TrackingEvent) {
        self.inner.counters.enqueued.fetch_add(1, Ordering::SeqCst);

        if !self.inner.config.enabled {
            let queue = self.clone();
            let event_name = event.event_type.clone();
            let session_id = event.session_id.clone();
            if !spawn_detached(async move {
                queue.deliver(event).await;
            }) {
                self.inner.counters.dropped.fetch_add(1, Ordering::SeqCst);
                log(
                    Level::Error,
                    Domain::Queue,
                    "delivery_dropped",
                    obj(&[
                        ("event_name", v_str(&event_name)),
                        ("session_id", v_str(&session_id)),
                        ("msg", v_str("no async runtime")),
                    ]),
                );
            }
            return;
        }

        let len = match self.inner.buffer.lock() {
            Ok(mut buffer) => {
                buffer.push(event);
                buffer.len()
            }
            Err(_) => {
                self.inner.counters.dropped.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        if len >= self.inner.config.max_size {
            self.trigger_flush();
        }
    }

    fn trigger_flush(&self) {
        let queue = self.clone();
        if !spawn_detached(async move {
            queue.flush().await;
        }) {
            log(
                Level::Warn,
                Domain::Queue,
                "flush_deferred",
                obj(&[("msg", v_str("no async runtime; events stay buffered"))]),
            );
        }
    }

    /// Ship everything currently buffered. Returns how many events were
    /// delivered; 0 when another flush is already running.
    pub async fn flush(&self) -> usize {
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let _guard = ProcessingGuard(&self.inner.processing);

        let batch = match self.inner.buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => return 0,
        };
        if batch.is_empty() {
            return 0;
        }
        self.inner.counters.flushes.fetch_add(1, Ordering::SeqCst);
        log(
            Level::Debug,
            Domain::Queue,
            "flush",
            obj(&[("size", json!(batch.len()))]),
        );

        let mut delivered = 0;
        for event in batch {
            if self.deliver(event).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, event: TrackingEvent) -> bool {
        let inner = &self.inner;
        let result = retry_async(&inner.config.retry, &event.event_type, |_attempt| {
            let event = &event;
            async move {
                let res = inner.transport.send(event).await;
                if res.is_err() {
                    inner.counters.failed_attempts.fetch_add(1, Ordering::SeqCst);
                }
                res
            }
        })
        .await;

        match result {
            Ok(()) => {
                inner.counters.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(err) => {
                inner.counters.dropped.fetch_add(1, Ordering::SeqCst);
                log(
                    Level::Error,
                    Domain::Queue,
                    "delivery_dropped",
                    obj(&[
                        ("event_name", v_str(&event.event_type)),
                        ("session_id", v_str(&event.session_id)),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
                false
            }
        }
    }

    /// Start the periodic flush. Calling it again restarts the timer.
    pub fn start(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log(
                Level::Warn,
                Domain::Queue,
                "timer_not_started",
                obj(&[("msg", v_str("no async runtime"))]),
            );
            return;
        };
        let queue = self.clone();
        let period = self.inner.config.flush_interval.max(MIN_FLUSH_INTERVAL);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !queue.is_empty() {
                    queue.flush().await;
                }
            }
        });
        if let Ok(mut timer) = self.inner.timer.lock() {
            if let Some(old) = timer.replace(task) {
                old.abort();
            }
        }
    }

    pub fn stop(&self) {
        if let Ok(mut timer) = self.inner.timer.lock() {
            if let Some(task) = timer.take() {
                task.abort();
            }
        }
    }

    /// Page is going away: stop the timer and beacon whatever is buffered.
    /// An in-flight flush is not waited for.
    pub fn on_unload(&self) -> usize {
        self.stop();
        let remaining = match self.inner.buffer.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => return 0,
        };
        if remaining.is_empty() {
            return 0;
        }
        let n = remaining.len();
        if self.inner.transport.send_beacon(remaining) {
            self.inner.counters.beaconed.fetch_add(n as u64, Ordering::SeqCst);
            log(
                Level::Info,
                Domain::Queue,
                "beacon_sent",
                obj(&[("size", json!(n))]),
            );
            n
        } else {
            self.inner.counters.dropped.fetch_add(n as u64, Ordering::SeqCst);
            0
        }
    }
}

fn spawn_detached<F>(fut: F) -> bool
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}
