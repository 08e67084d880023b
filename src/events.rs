//! Event delivery to the caller-supplied observer.
//!
//! All engine-internal state changes are reported through a single bus with a
//! dedicated delivery task, so a slow observer callback never blocks a caller
//! thread or a controller. Lifecycle events ride an unbounded channel and are
//! never dropped; log messages ride a bounded channel where overflow drops the
//! new message and bumps a saturation counter.

use crate::keys::PeerPublicKey;
use crate::transport::PeerState;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};

/// Bounded capacity for the log channel.
///
/// Log messages are advisory; when the observer cannot keep up, dropping them
/// is preferable to unbounded memory growth or blocking a controller.
const LOG_CHANNEL_SIZE: usize = 512;

/// Severity for log messages forwarded to the logger callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Adapter lifecycle state as reported in events and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Up,
    Down,
}

/// A lifecycle event emitted by the engine.
///
/// Immutable once emitted; relative order is preserved per producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The virtual adapter changed state.
    Adapter {
        state: AdapterState,
        name: String,
        luid: u64,
    },
    /// A meshnet peer changed connectivity state.
    Peer {
        public_key: PeerPublicKey,
        state: PeerState,
    },
    /// The exit node changed connectivity state.
    ExitNode {
        public_key: PeerPublicKey,
        state: PeerState,
    },
    /// Magic DNS was enabled, reconfigured, or disabled.
    Dns {
        enabled: bool,
        forward_servers: Vec<IpAddr>,
    },
}

/// Caller-supplied sink for lifecycle events.
///
/// Invoked from the engine's delivery task, never from the caller's own
/// thread. Implementations must not call back into the engine API.
pub trait EventCallback: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Caller-supplied sink for log messages.
pub trait LogCallback: Send + Sync {
    fn on_log(&self, level: LogLevel, message: &str);
}

enum BusMessage {
    Deliver(Event),
    Flush(oneshot::Sender<()>),
}

type SharedObserver<T> = Arc<RwLock<Option<Arc<T>>>>;

/// Ordered, single-consumer event delivery.
///
/// Cheap to clone; all clones feed the same delivery tasks.
#[derive(Clone)]
pub struct EventBus {
    event_tx: mpsc::UnboundedSender<BusMessage>,
    log_tx: mpsc::Sender<(LogLevel, String)>,
    dropped_logs: Arc<AtomicU64>,
    observer: SharedObserver<dyn EventCallback>,
    logger: SharedObserver<dyn LogCallback>,
}

impl EventBus {
    /// Start the delivery tasks on the given runtime and return a bus handle.
    pub fn spawn(handle: &tokio::runtime::Handle) -> Self {
        Self::with_log_capacity(handle, LOG_CHANNEL_SIZE)
    }

    pub(crate) fn with_log_capacity(handle: &tokio::runtime::Handle, capacity: usize) -> Self {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<BusMessage>();
        let (log_tx, mut log_rx) = mpsc::channel::<(LogLevel, String)>(capacity);

        let observer: SharedObserver<dyn EventCallback> = Arc::new(RwLock::new(None));
        let logger: SharedObserver<dyn LogCallback> = Arc::new(RwLock::new(None));

        let delivery_observer = observer.clone();
        handle.spawn(async move {
            while let Some(msg) = event_rx.recv().await {
                match msg {
                    BusMessage::Deliver(event) => {
                        let sink = delivery_observer
                            .read()
                            .ok()
                            .and_then(|guard| guard.clone());
                        if let Some(sink) = sink {
                            sink.on_event(&event);
                        }
                    }
                    BusMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        let delivery_logger = logger.clone();
        handle.spawn(async move {
            while let Some((level, message)) = log_rx.recv().await {
                let sink = delivery_logger.read().ok().and_then(|guard| guard.clone());
                if let Some(sink) = sink {
                    sink.on_log(level, &message);
                }
            }
        });

        Self {
            event_tx,
            log_tx,
            dropped_logs: Arc::new(AtomicU64::new(0)),
            observer,
            logger,
        }
    }

    /// Register the lifecycle observer. Re-subscription replaces the prior one.
    pub fn subscribe(&self, observer: Arc<dyn EventCallback>) {
        if let Ok(mut guard) = self.observer.write() {
            *guard = Some(observer);
        }
    }

    /// Register the logger callback. Re-subscription replaces the prior one.
    pub fn subscribe_logger(&self, logger: Arc<dyn LogCallback>) {
        if let Ok(mut guard) = self.logger.write() {
            *guard = Some(logger);
        }
    }

    /// Publish a lifecycle event.
    ///
    /// Must only be called after the state change it describes has taken
    /// effect. Never blocks and never drops.
    pub fn publish(&self, event: Event) {
        if self.event_tx.send(BusMessage::Deliver(event)).is_err() {
            log::debug!("Event bus closed; lifecycle event discarded");
        }
    }

    /// Forward a log message to the logger callback.
    ///
    /// Drops the message when the log channel is saturated.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if self.log_tx.try_send((level, message.into())).is_err() {
            self.dropped_logs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of log messages dropped due to a saturated channel.
    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs.load(Ordering::Relaxed)
    }

    /// Wait until every lifecycle event published so far has been delivered.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.event_tx.send(BusMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
