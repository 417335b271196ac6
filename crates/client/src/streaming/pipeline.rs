//! Reader / processor pipeline and its background workers
//!
//! - **reader**: owns the socket, only reads frames and enqueues them
//! - **processor**: drains frames and errors, decodes, routes, classifies
//! - **health monitor**: periodic silence scan of the subscription store
//! - **supervisor**: single long-lived consumer of reconnection requests
//!
//! The reader never waits on anything but the socket, its cancellation
//! token and a short bounded enqueue. Everything that can be slow happens
//! on the processor or further out.

use crate::errors::{ErrorDisposition, StreamError};
use crate::streaming::codec::decode_all;
use crate::streaming::connection::ConnectionManager;
use crate::streaming::router::{MessageRouter, RouteAction};
use crate::streaming::store::SubscriptionStore;
use crate::websocket::{MonoioWebSocket, WsMessage};

use flume::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use streamwire_core::{CancellationToken, Timestamp};
use tracing::{debug, info, warn};

/// Callbacks from the pipeline into whoever owns the connection
pub(crate) trait SessionControl {
    /// Peer closed normally or asked us to disconnect
    fn shutdown(&self, generation: u64);

    /// The connection broke; tear it down and reconnect
    fn connection_lost(&self, generation: u64, error: &StreamError);

    /// Reset some (or, when empty, all) subscriptions
    fn reset_subscriptions(&self, targets: Vec<String>);

    /// Queue a full reconnect. Returns false if one is already pending.
    fn request_reconnect(&self, generation: u64, reason: &str) -> bool;
}

/// A queued reconnection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Connection generation the request was raised against
    pub generation: u64,
    pub reason: String,
}

/// Highest message id seen on the stream
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: AtomicU64,
    seen: AtomicBool,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message_id: u64) {
        self.last.fetch_max(message_id, Ordering::SeqCst);
        self.seen.store(true, Ordering::SeqCst);
    }

    /// Resume point for the next connect, if any message was seen
    pub fn last_seen(&self) -> Option<u64> {
        self.seen
            .load(Ordering::SeqCst)
            .then(|| self.last.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.seen.store(false, Ordering::SeqCst);
        self.last.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Read frames until cancelled or the socket fails, then hand the socket back
pub(crate) async fn run_reader(
    mut socket: MonoioWebSocket,
    frames: Sender<WsMessage>,
    errors: Sender<StreamError>,
    cancel: CancellationToken,
    read_timeout: Duration,
    enqueue_timeout: Duration,
) -> MonoioWebSocket {
    debug!("📖 Reader started");

    loop {
        let read = monoio::select! {
            _ = cancel.cancelled() => break,
            read = monoio::time::timeout(read_timeout, socket.receive_message()) => read,
        };

        let message = match read {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                let _ = errors.try_send(e);
                break;
            }
            Err(_) => {
                let _ = errors.try_send(StreamError::Timeout(format!(
                    "no frame within {}ms",
                    read_timeout.as_millis()
                )));
                break;
            }
        };

        let closing = matches!(message, WsMessage::Close { .. });
        if !enqueue(&frames, message, enqueue_timeout).await || closing {
            break;
        }
    }

    debug!("Reader stopped");
    socket
}

/// Returns false once the processor side is gone
async fn enqueue(frames: &Sender<WsMessage>, message: WsMessage, wait: Duration) -> bool {
    match frames.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Disconnected(_)) => false,
        Err(TrySendError::Full(message)) => {
            warn!("⚠️ Processor queue backed up ({} frames)", frames.len());
            match monoio::time::timeout(wait, frames.send_async(message)).await {
                Ok(Ok(())) => true,
                Ok(Err(_)) => false,
                Err(_) => {
                    warn!("Dropping frame after waiting {}ms", wait.as_millis());
                    true
                }
            }
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Event {
    Frame(Option<WsMessage>),
    Error(Option<StreamError>),
}

/// Single consumer of the reader's frame queue and error channel
pub(crate) struct Processor {
    router: Arc<MessageRouter>,
    control: Arc<dyn SessionControl>,
    sequence: Arc<SequenceTracker>,
    generation: u64,
}

impl Processor {
    pub(crate) fn new(
        router: Arc<MessageRouter>,
        control: Arc<dyn SessionControl>,
        sequence: Arc<SequenceTracker>,
        generation: u64,
    ) -> Self {
        Self {
            router,
            control,
            sequence,
            generation,
        }
    }

    pub(crate) async fn run(
        self,
        frames: Receiver<WsMessage>,
        errors: Receiver<StreamError>,
        cancel: CancellationToken,
    ) {
        debug!("⚙️ Processor started (generation {})", self.generation);

        loop {
            let event = monoio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv_async() => Event::Frame(frame.ok()),
                error = errors.recv_async() => Event::Error(error.ok()),
            };

            match event {
                Event::Frame(Some(message)) => {
                    if self.handle_frame(message) == Flow::Stop {
                        break;
                    }
                }
                Event::Frame(None) => {
                    if let Ok(error) = errors.try_recv() {
                        self.handle_error(error);
                    }
                    break;
                }
                Event::Error(error) => {
                    // Frames read before the failure still count.
                    for message in frames.drain() {
                        if self.handle_frame(message) == Flow::Stop {
                            return;
                        }
                    }
                    if let Some(error) = error {
                        self.handle_error(error);
                    }
                    break;
                }
            }
        }

        debug!("Processor stopped (generation {})", self.generation);
    }

    fn handle_frame(&self, message: WsMessage) -> Flow {
        match message {
            WsMessage::Binary(data) => self.dispatch(&data),
            WsMessage::Text(text) => self.dispatch(text.as_bytes()),
            WsMessage::Close { code, reason } => {
                self.handle_error(StreamError::ConnectionClosed { code, reason });
                Flow::Stop
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) -> Flow {
        for decoded in decode_all(frame) {
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping undecodable frame: {}", e);
                    continue;
                }
            };

            self.sequence.record(message.message_id);
            match self.router.route(&message) {
                RouteAction::None => {}
                RouteAction::Reset(targets) => self.control.reset_subscriptions(targets),
                RouteAction::Disconnect => {
                    self.control.shutdown(self.generation);
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    fn handle_error(&self, error: StreamError) {
        match error.disposition() {
            ErrorDisposition::CleanShutdown => {
                info!("Connection closed normally: {}", error);
                self.control.shutdown(self.generation);
            }
            ErrorDisposition::Reconnect => {
                warn!("🔌 Connection lost: {}", error);
                self.control.connection_lost(self.generation, &error);
            }
            ErrorDisposition::AlreadyClosed => {
                debug!("Socket already closed locally");
            }
        }
    }
}

// ============================================================================
// Health monitor
// ============================================================================

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    FullReconnect,
    PartialReset(Vec<String>),
}

/// Silence detector over the subscription store, one per connection
pub struct HealthMonitor {
    store: Arc<SubscriptionStore>,
    timeout: Duration,
    reconnect_requested: bool,
}

impl HealthMonitor {
    pub fn new(store: Arc<SubscriptionStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            reconnect_requested: false,
        }
    }

    /// Scan once.
    ///
    /// Total silence yields `FullReconnect` until the runner confirms the
    /// request was accepted; after that only partial silence is reported.
    pub fn check_once(&mut self, now: Timestamp) -> Option<HealthAction> {
        let report = self.store.silence_report(self.timeout, now);
        if report.silent.is_empty() {
            None
        } else if report.all_silent() {
            (!self.reconnect_requested).then_some(HealthAction::FullReconnect)
        } else {
            Some(HealthAction::PartialReset(report.silent))
        }
    }

    /// Record that a full reconnect was accepted for this connection
    pub fn mark_reconnect_requested(&mut self) {
        self.reconnect_requested = true;
    }

    pub fn reconnect_requested(&self) -> bool {
        self.reconnect_requested
    }
}

pub(crate) async fn run_health_monitor(
    mut monitor: HealthMonitor,
    control: Arc<dyn SessionControl>,
    cancel: CancellationToken,
    interval: Duration,
    generation: u64,
) {
    let mut ticker = monoio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        monoio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match monitor.check_once(Timestamp::now()) {
            Some(HealthAction::FullReconnect) => {
                warn!("All subscriptions silent; requesting reconnect");
                if control.request_reconnect(generation, "all subscriptions silent") {
                    monitor.mark_reconnect_requested();
                }
            }
            Some(HealthAction::PartialReset(silent)) => {
                warn!("{} subscription(s) silent; requesting reset", silent.len());
                control.reset_subscriptions(silent);
            }
            None => {}
        }
    }

    debug!("Health monitor stopped (generation {})", generation);
}

// ============================================================================
// Reconnection supervisor
// ============================================================================

/// Consume reconnection requests for the lifetime of the manager
pub(crate) async fn run_supervisor(
    manager: Weak<ConnectionManager>,
    requests: Receiver<ReconnectRequest>,
    cooldown: Duration,
) {
    info!("🛡️ Reconnection supervisor started");

    while let Ok(request) = requests.recv_async().await {
        monoio::time::sleep(cooldown).await;

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_reconnect_request(request).await;
    }

    debug!("Reconnection supervisor stopped");
}
