//! Streaming connection management with automatic reconnection
//!
//! The manager owns the live socket (through the reader task), the
//! per-connection cancellation token and the worker handles. A connection is
//! identified by a generation number; requests raised by an older
//! generation's workers are ignored once a newer connection exists.
//!
//! ```text
//! Disconnected → Connecting → Connected → Reconnecting → Connected
//!                                              └─────────→ Disconnected (gave up)
//! ```

use crate::errors::{CLOSE_NORMAL, Result, StreamError};
use crate::streaming::config::StreamingConfig;
use crate::streaming::instruments::InstrumentMap;
use crate::streaming::pipeline::{
    HealthMonitor, Processor, ReconnectRequest, SequenceTracker, SessionControl,
    run_health_monitor, run_reader, run_supervisor,
};
use crate::streaming::router::{MessageRouter, TopicReceivers, topic_channels};
use crate::streaming::store::SubscriptionStore;
use crate::streaming::subscriptions::{FlagGuard, SubscriptionManager};
use crate::traits::AuthProvider;
use crate::types::ConnectionState;
use crate::websocket::MonoioWebSocket;

use flume::{Receiver, Sender, TrySendError};
use monoio::task::JoinHandle;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use streamwire_core::{CancellationToken, PerfTimer, generate_context_id};
use tracing::{debug, error, info, warn};
use url::Url;

/// Linear backoff: `attempt × base`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the given (1-based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.max)
    }

    /// Advance to the next attempt; `None` once the ceiling is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Socket URL for a context: `https`→`wss`, `http`→`ws`, plus `/connect`
pub fn build_stream_url(base: &str, context_id: &str, message_id: Option<u64>) -> Result<Url> {
    let trimmed = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(StreamError::InvalidUrl(format!(
            "streaming base must be http(s): {base}"
        )));
    };

    let mut url = Url::parse(&format!("{ws_base}/connect"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("contextid", context_id);
        if let Some(message_id) = message_id {
            query.append_pair("messageid", &message_id.to_string());
        }
    }
    Ok(url)
}

/// Channels the auth collaborator listens on
#[derive(Clone)]
pub struct AuthNotifications {
    /// `true` when a connection comes up, `false` when it goes away
    pub connection_state: Receiver<bool>,
    /// Context id of every new connection
    pub context_id: Receiver<String>,
}

/// Latest-wins single-slot publishers
struct Notifier {
    state_tx: Sender<bool>,
    state_rx: Receiver<bool>,
    context_tx: Sender<String>,
    context_rx: Receiver<String>,
}

impl Notifier {
    fn new() -> Self {
        let (state_tx, state_rx) = flume::bounded(1);
        let (context_tx, context_rx) = flume::bounded(1);
        Self {
            state_tx,
            state_rx,
            context_tx,
            context_rx,
        }
    }

    fn publish<T>(tx: &Sender<T>, rx: &Receiver<T>, value: T) {
        if let Err(TrySendError::Full(value)) = tx.try_send(value) {
            let _ = rx.try_recv();
            let _ = tx.try_send(value);
        }
    }

    fn connected(&self, context_id: &str) {
        Self::publish(&self.state_tx, &self.state_rx, true);
        Self::publish(&self.context_tx, &self.context_rx, context_id.to_string());
    }

    fn disconnected(&self) {
        Self::publish(&self.state_tx, &self.state_rx, false);
    }

    fn subscribe(&self) -> AuthNotifications {
        AuthNotifications {
            connection_state: self.state_rx.clone(),
            context_id: self.context_rx.clone(),
        }
    }
}

/// Workers and token of one live connection
struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    reader: JoinHandle<MonoioWebSocket>,
    processor: JoinHandle<()>,
}

/// Owns the streaming connection and its lifecycle
pub struct ConnectionManager {
    config: Arc<StreamingConfig>,
    auth: Arc<dyn AuthProvider>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
    topics: TopicReceivers,
    sequence: Arc<SequenceTracker>,
    state: AtomicU8,
    generation: AtomicU64,
    session: Mutex<Option<ActiveSession>>,
    backoff: Mutex<Backoff>,
    reconnect_in_progress: Arc<AtomicBool>,
    reconnect_pending: AtomicBool,
    supervisor_started: AtomicBool,
    shutdown_requested: AtomicBool,
    reconnect_tx: Sender<ReconnectRequest>,
    reconnect_rx: Receiver<ReconnectRequest>,
    notifier: Notifier,
    self_ref: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(config: StreamingConfig, auth: Arc<dyn AuthProvider>) -> Arc<Self> {
        let config = Arc::new(config);
        let store = Arc::new(SubscriptionStore::new());
        let instruments = Arc::new(InstrumentMap::new());
        let reconnect_in_progress = Arc::new(AtomicBool::new(false));

        let subscriptions = Arc::new(SubscriptionManager::new(
            config.clone(),
            auth.clone(),
            store.clone(),
            instruments.clone(),
            reconnect_in_progress.clone(),
        ));
        let (senders, topics) = topic_channels(config.topic_channel_capacity);
        let router = Arc::new(MessageRouter::new(store, instruments, senders));
        let (reconnect_tx, reconnect_rx) = flume::bounded(1);
        let backoff = Backoff::from_config(&config);

        Arc::new_cyclic(|self_ref| Self {
            config,
            auth,
            subscriptions,
            router,
            topics,
            sequence: Arc::new(SequenceTracker::new()),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
            backoff: Mutex::new(backoff),
            reconnect_in_progress,
            reconnect_pending: AtomicBool::new(false),
            supervisor_started: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            reconnect_tx,
            reconnect_rx,
            notifier: Notifier::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::SeqCst));
        if previous != state {
            debug!("Connection state {} → {}", previous, state);
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn topics(&self) -> &TopicReceivers {
        &self.topics
    }

    pub fn sequence(&self) -> &SequenceTracker {
        &self.sequence
    }

    /// Generation of the most recent connection (0 before the first)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn auth_notifications(&self) -> AuthNotifications {
        self.notifier.subscribe()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_in_progress.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).attempt()
    }

    /// Open a fresh connection and start the workers.
    ///
    /// Fails fast without starting anything if the auth collaborator has no
    /// session or the handshake is rejected.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected && self.has_session() {
            debug!("Already connected");
            return Ok(());
        }

        self.shutdown_requested.store(false, Ordering::SeqCst);
        self.sequence.reset();
        self.backoff.lock().unwrap_or_else(|e| e.into_inner()).reset();
        self.establish(false).await
    }

    fn has_session(&self) -> bool {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    async fn establish(&self, resume: bool) -> Result<()> {
        let reconnecting = self.state() == ConnectionState::Reconnecting;
        let fail = |e: StreamError| {
            if !reconnecting {
                self.set_state(ConnectionState::Disconnected);
            }
            e
        };

        if !self.auth.is_authenticated() {
            return Err(fail(StreamError::NotAuthenticated));
        }
        if !reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        let token = self.auth.access_token().await.map_err(fail)?;
        let context_id = generate_context_id();
        let resume_from = if resume { self.sequence.last_seen() } else { None };
        let url = build_stream_url(&self.config.streaming_base_url, &context_id, resume_from)
            .map_err(fail)?;

        let timer = PerfTimer::start("streaming_connect");
        let authorization = format!("Bearer {token}");
        let socket = MonoioWebSocket::connect_with_headers(url, &[("Authorization", authorization.as_str())])
            .await
            .map_err(fail)?;
        timer.log_elapsed();

        self.start_session(socket, context_id);
        Ok(())
    }

    fn start_session(&self, socket: MonoioWebSocket, context_id: String) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = flume::bounded(self.config.processor_queue_capacity);
        let (error_tx, error_rx) = flume::bounded(1);

        self.subscriptions.set_context_id(Some(context_id.clone()));
        // Fresh connection: silence is measured from now.
        self.subscriptions.store().touch_all();

        let reader = monoio::spawn(run_reader(
            socket,
            frame_tx,
            error_tx,
            cancel.clone(),
            self.config.read_timeout(),
            self.config.enqueue_timeout(),
        ));

        let control: Arc<dyn SessionControl> = Arc::new(ManagerHandle(self.self_ref.clone()));
        let processor = monoio::spawn(
            Processor::new(
                self.router.clone(),
                control.clone(),
                self.sequence.clone(),
                generation,
            )
            .run(frame_rx, error_rx, cancel.clone()),
        );

        monoio::spawn(run_health_monitor(
            HealthMonitor::new(
                self.subscriptions.store().clone(),
                self.config.subscription_timeout(),
            ),
            control,
            cancel.clone(),
            self.config.health_check_interval(),
            generation,
        ));

        self.ensure_supervisor();

        let previous = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ActiveSession {
                generation,
                cancel,
                reader,
                processor,
            });
        if let Some(previous) = previous {
            self.spawn_finish(previous);
        }

        self.set_state(ConnectionState::Connected);
        self.notifier.connected(&context_id);
        info!(
            "✅ Streaming connected (context {}, generation {})",
            context_id, generation
        );
    }

    fn ensure_supervisor(&self) {
        if self
            .supervisor_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            monoio::spawn(run_supervisor(
                self.self_ref.clone(),
                self.reconnect_rx.clone(),
                self.config.reconnect_cooldown(),
            ));
        }
    }

    /// Take the live session, optionally only if it belongs to `generation`
    fn detach_session(&self, generation: Option<u64>) -> Option<ActiveSession> {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match (guard.as_ref(), generation) {
            (Some(session), Some(generation)) if session.generation != generation => None,
            _ => guard.take(),
        }
    }

    /// Stop the workers and close the socket, each wait bounded
    async fn finish_session(&self, session: ActiveSession) {
        let wait = self.config.shutdown_timeout();
        session.cancel.cancel();

        if monoio::time::timeout(wait, session.processor).await.is_err() {
            warn!("Processor did not stop within {}ms", wait.as_millis());
        }

        match monoio::time::timeout(wait, session.reader).await {
            Ok(mut socket) => {
                if monoio::time::timeout(wait, socket.close(CLOSE_NORMAL, "client closing"))
                    .await
                    .is_err()
                {
                    debug!("Close handshake timed out");
                }
            }
            Err(_) => warn!("Reader did not stop within {}ms", wait.as_millis()),
        }

        debug!("Session {} finished", session.generation);
    }

    fn spawn_finish(&self, session: ActiveSession) {
        session.cancel.cancel();
        if let Some(manager) = self.self_ref.upgrade() {
            monoio::spawn(async move { manager.finish_session(session).await });
        }
    }

    /// Stop all connection workers and close the socket. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shutdown_requested.store(true, Ordering::SeqCst);

        match self.detach_session(None) {
            Some(session) => {
                info!("🔌 Closing streaming connection");
                self.finish_session(session).await;
            }
            None => {
                if self.state() == ConnectionState::Disconnected {
                    debug!("Close on a closed connection");
                    return Ok(());
                }
            }
        }

        self.subscriptions.set_context_id(None);
        self.set_state(ConnectionState::Disconnected);
        self.notifier.disconnected();
        Ok(())
    }

    /// Queue a reconnection request for the supervisor.
    ///
    /// Duplicates are dropped while one is pending, and nothing is queued
    /// after `close`.
    pub fn request_reconnect(&self, generation: u64, reason: &str) -> bool {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already pending; dropping request ({})", reason);
            return false;
        }

        let request = ReconnectRequest {
            generation,
            reason: reason.to_string(),
        };
        match self.reconnect_tx.try_send(request) {
            Ok(()) => {
                info!("Reconnect requested: {}", reason);
                true
            }
            Err(_) => {
                self.reconnect_pending.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub(crate) async fn handle_reconnect_request(&self, request: ReconnectRequest) {
        self.reconnect_pending.store(false, Ordering::SeqCst);

        if self.shutdown_requested.load(Ordering::SeqCst) {
            debug!("Ignoring reconnect request after close");
            return;
        }
        if request.generation != self.generation() {
            debug!(
                "Ignoring stale reconnect request for generation {}",
                request.generation
            );
            return;
        }

        info!("🔄 Reconnecting: {}", request.reason);
        if let Err(e) = self.reconnect_with_backoff().await {
            error!("Reconnection failed: {}", e);
        }
    }

    /// Reconnect with linear backoff and replay every subscription.
    ///
    /// Single-flight: returns immediately if another reconnect is running.
    /// A running subscription reset is drained before the replay starts.
    /// A failed resubscription tears the new connection down and counts as
    /// a failed attempt.
    pub async fn reconnect_with_backoff(&self) -> Result<()> {
        if self
            .reconnect_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in progress");
            return Ok(());
        }
        let _in_progress = FlagGuard(&self.reconnect_in_progress);

        self.subscriptions.set_context_id(None);
        self.set_state(ConnectionState::Reconnecting);
        self.notifier.disconnected();
        if let Some(session) = self.detach_session(None) {
            self.finish_session(session).await;
        }

        loop {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                info!("Reconnect abandoned: client closed");
                return Ok(());
            }

            let (delay, attempt, max_attempts) = {
                let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
                (backoff.next_delay(), backoff.attempt(), backoff.max_attempts())
            };
            let Some(delay) = delay else {
                error!("❌ Giving up after {} reconnect attempts", max_attempts);
                self.subscriptions.set_context_id(None);
                self.set_state(ConnectionState::Disconnected);
                return Err(StreamError::ReconnectExhausted(max_attempts));
            };

            info!(
                "Reconnect attempt {}/{} in {}ms",
                attempt,
                max_attempts,
                delay.as_millis()
            );
            monoio::time::sleep(delay).await;

            if self.shutdown_requested.load(Ordering::SeqCst) {
                info!("Reconnect abandoned: client closed");
                return Ok(());
            }

            if let Err(e) = self.establish(true).await {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                continue;
            }

            if self.shutdown_requested.load(Ordering::SeqCst) {
                return self.close().await;
            }

            if !self
                .subscriptions
                .wait_for_reset_idle(self.config.shutdown_timeout())
                .await
            {
                warn!("Subscription reset still running; replaying anyway");
            }

            match self.subscriptions.resubscribe_all(false, None).await {
                Ok(()) => {
                    self.backoff.lock().unwrap_or_else(|e| e.into_inner()).reset();
                    info!("✅ Reconnected after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Resubscription after reconnect failed: {}", e);
                    self.set_state(ConnectionState::Reconnecting);
                    self.notifier.disconnected();
                    if let Some(session) = self.detach_session(None) {
                        self.finish_session(session).await;
                    }
                }
            }
        }
    }
}

/// Pipeline-facing handle that does not keep the manager alive
struct ManagerHandle(Weak<ConnectionManager>);

impl ManagerHandle {
    fn current(&self, generation: u64) -> Option<Arc<ConnectionManager>> {
        self.0
            .upgrade()
            .filter(|manager| manager.generation() == generation)
    }
}

impl SessionControl for ManagerHandle {
    fn shutdown(&self, generation: u64) {
        if let Some(manager) = self.current(generation) {
            monoio::spawn(async move {
                let _ = manager.close().await;
            });
        }
    }

    fn connection_lost(&self, generation: u64, error: &StreamError) {
        let Some(manager) = self.current(generation) else {
            return;
        };
        if manager.shutdown_requested.load(Ordering::SeqCst) {
            return;
        }

        manager.subscriptions.set_context_id(None);
        manager.set_state(ConnectionState::Reconnecting);
        manager.notifier.disconnected();
        if let Some(session) = manager.detach_session(Some(generation)) {
            manager.spawn_finish(session);
        }
        manager.request_reconnect(generation, &error.to_string());
    }

    fn reset_subscriptions(&self, targets: Vec<String>) {
        if let Some(manager) = self.0.upgrade() {
            manager.subscriptions.handle_reset(targets);
        }
    }

    fn request_reconnect(&self, generation: u64, reason: &str) -> bool {
        self.current(generation)
            .is_some_and(|manager| manager.request_reconnect(generation, reason))
    }
}
