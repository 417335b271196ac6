//! Subscription lifecycle over the HTTP subscription API
//!
//! Subscriptions are created with a POST carrying the streaming context id;
//! the server then tags every message for it with the reference id we
//! minted. Resets and reconnects replay the stored arguments, usually under
//! a fresh reference id that keeps the old type prefix.

use crate::errors::{Result, StreamError};
use crate::http::HttpResponse;
use crate::streaming::config::StreamingConfig;
use crate::streaming::instruments::InstrumentMap;
use crate::streaming::store::{Subscription, SubscriptionState, SubscriptionStore};
use crate::traits::AuthProvider;
use crate::types::SubscriptionKind;

use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use streamwire_core::{PerfTimer, Timestamp, mint_reference_id, reference_id_prefix};
use tracing::{debug, info, warn};

/// What happened to a reset request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDecision {
    Scheduled,
    SkippedReconnecting,
    SkippedCooldown,
    SkippedBusy,
}

/// Clears an atomic flag when dropped
pub(crate) struct FlagGuard<'a>(pub(crate) &'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Mint a new reference id keeping the type prefix of `old`
pub fn rotate_reference_id(old: &str, is_taken: impl Fn(&str) -> bool) -> String {
    mint_reference_id(reference_id_prefix(old), is_taken)
}

/// JSON body of a subscription request
pub fn subscription_body(
    context_id: &str,
    reference_id: &str,
    refresh_rate_ms: u64,
    arguments: &Value,
    replace_reference_id: Option<&str>,
) -> Value {
    let mut body = json!({
        "ContextId": context_id,
        "ReferenceId": reference_id,
        "RefreshRate": refresh_rate_ms,
        "Arguments": arguments,
    });
    if let Some(old) = replace_reference_id {
        body["ReplaceReferenceId"] = Value::String(old.to_string());
    }
    body
}

/// Creates, replays and removes streaming subscriptions
pub struct SubscriptionManager {
    config: Arc<StreamingConfig>,
    auth: Arc<dyn AuthProvider>,
    store: Arc<SubscriptionStore>,
    instruments: Arc<InstrumentMap>,
    context_id: RwLock<Option<String>>,
    reconnect_in_flight: Arc<AtomicBool>,
    reset_running: AtomicBool,
    last_full_reset: Mutex<Option<Timestamp>>,
}

impl SubscriptionManager {
    pub fn new(
        config: Arc<StreamingConfig>,
        auth: Arc<dyn AuthProvider>,
        store: Arc<SubscriptionStore>,
        instruments: Arc<InstrumentMap>,
        reconnect_in_flight: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            auth,
            store,
            instruments,
            context_id: RwLock::new(None),
            reconnect_in_flight,
            reset_running: AtomicBool::new(false),
            last_full_reset: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<SubscriptionStore> {
        &self.store
    }

    pub fn instruments(&self) -> &Arc<InstrumentMap> {
        &self.instruments
    }

    /// Context id of the live connection, if any
    pub fn context_id(&self) -> Option<String> {
        self.context_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_context_id(&self, context_id: Option<String>) {
        *self.context_id.write().unwrap_or_else(|e| e.into_inner()) = context_id;
    }

    fn require_context(&self) -> Result<String> {
        self.context_id()
            .ok_or_else(|| StreamError::NotConnected("no streaming context".to_string()))
    }

    /// Fails once the live context is no longer `context_id`, or, for
    /// resets, once a reconnect has taken over the replay.
    fn ensure_context(&self, context_id: &str, yield_to_reconnect: bool) -> Result<()> {
        if self.context_id().as_deref() != Some(context_id) {
            return Err(StreamError::NotConnected(format!(
                "context {context_id} was replaced"
            )));
        }
        if yield_to_reconnect && self.reconnect_in_flight.load(Ordering::SeqCst) {
            return Err(StreamError::NotConnected(
                "reconnection took over the replay".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_reset_running(&self) -> bool {
        self.reset_running.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for a running reset to stop. Returns false on
    /// timeout.
    pub(crate) async fn wait_for_reset_idle(&self, limit: Duration) -> bool {
        let started = Timestamp::now();
        while self.is_reset_running() {
            if started.elapsed() >= limit {
                return false;
            }
            monoio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Create a subscription and record it in the store.
    ///
    /// For price subscriptions `instruments` may hold tickers or raw UICs;
    /// they are resolved, de-duplicated and written to `Arguments.Uics`.
    /// Returns the reference id the server will tag messages with.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        kind: SubscriptionKind,
        instruments: &[S],
        arguments: Value,
    ) -> Result<String> {
        if !self.auth.is_authenticated() {
            return Err(StreamError::NotAuthenticated);
        }
        let context_id = self.require_context()?;
        let arguments = self.build_arguments(kind, instruments, arguments)?;

        let reference_id = mint_reference_id(kind.prefix(), |id| self.store.contains(id));
        let body = subscription_body(
            &context_id,
            &reference_id,
            self.config.refresh_rate_ms,
            &arguments,
            None,
        );

        let timer = PerfTimer::start(format!("subscribe {reference_id}"));
        let response = self.post_subscription(kind.endpoint(), &body).await?;
        timer.log_elapsed();
        // The connection dropped while the POST was in flight.
        self.ensure_context(&context_id, false)?;

        let mut subscription = Subscription::new(context_id, reference_id.clone(), kind, arguments);
        subscription.location = response.header("Location").map(str::to_string);
        self.store.insert(subscription);

        info!("📡 Subscribed {} ({})", reference_id, kind.endpoint());
        Ok(reference_id)
    }

    fn build_arguments<S: AsRef<str>>(
        &self,
        kind: SubscriptionKind,
        instruments: &[S],
        arguments: Value,
    ) -> Result<Value> {
        let mut arguments: Map<String, Value> = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(StreamError::InvalidMessage(format!(
                    "subscription arguments must be a JSON object, got {other}"
                )));
            }
        };

        if kind.takes_instruments() {
            if !instruments.is_empty() {
                let uics = self.instruments.resolve(instruments)?;
                let joined = uics
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                arguments.insert("Uics".to_string(), Value::String(joined));
            }
            if !arguments.contains_key("Uics") {
                return Err(StreamError::InvalidMessage(
                    "price subscription without instruments".to_string(),
                ));
            }
            arguments
                .entry("AssetType")
                .or_insert_with(|| Value::String("FxSpot".to_string()));
        }

        Ok(Value::Object(arguments))
    }

    async fn post_subscription(&self, endpoint: &str, body: &Value) -> Result<HttpResponse> {
        let token = self.auth.access_token().await?;
        let http = self.auth.http_client()?;
        let url = format!("{}/{}", self.config.rest_base_url.trim_end_matches('/'), endpoint);
        let authorization = format!("Bearer {token}");

        let response = http
            .post_json(&url, &body.to_string(), &[("Authorization", authorization.as_str())])
            .await?;

        match response.status {
            200 | 201 => Ok(response),
            status => Err(StreamError::SubscriptionFailed {
                status,
                body: response.body,
            }),
        }
    }

    /// Remove a subscription on the server and from the store.
    ///
    /// A 404 means the server already forgot it, which is fine.
    pub async fn unsubscribe(&self, reference_id: &str) -> Result<()> {
        let Some(subscription) = self.store.get(reference_id) else {
            debug!("Unsubscribe of unknown reference id {}", reference_id);
            return Ok(());
        };

        let token = self.auth.access_token().await?;
        let http = self.auth.http_client()?;
        let url = format!(
            "{}/{}/{}/{}",
            self.config.rest_base_url.trim_end_matches('/'),
            subscription.endpoint,
            subscription.context_id,
            subscription.reference_id
        );
        let authorization = format!("Bearer {token}");
        let response = http.delete(&url, &[("Authorization", authorization.as_str())]).await?;

        if response.is_success() || response.status == 404 {
            self.store.remove(reference_id);
            info!("🗑️ Unsubscribed {}", reference_id);
            Ok(())
        } else {
            Err(StreamError::SubscriptionFailed {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Replay stored subscriptions on the current context.
    ///
    /// With `keep_reference_ids` the same ids are re-posted; otherwise each
    /// gets a rotated id, and `ReplaceReferenceId` asks the server to swap
    /// atomically when the old subscription lives on this same context.
    /// `targets` limits the replay; `None` replays everything. Stops at the
    /// first failure, or as soon as the context it started on is replaced.
    pub async fn resubscribe_all(
        &self,
        keep_reference_ids: bool,
        targets: Option<&[String]>,
    ) -> Result<()> {
        self.replay(keep_reference_ids, targets, false).await
    }

    async fn replay(
        &self,
        keep_reference_ids: bool,
        targets: Option<&[String]>,
        yield_to_reconnect: bool,
    ) -> Result<()> {
        let context_id = self.require_context()?;

        let mut pending = self.store.snapshot();
        match targets {
            Some(targets) => pending.retain(|s| targets.contains(&s.reference_id)),
            None => self.mark_full_reset(),
        }
        pending.sort_by_key(|s| s.subscribed_at);

        if pending.is_empty() {
            debug!("Nothing to resubscribe");
            return Ok(());
        }

        info!(
            "🔄 Resubscribing {} subscription(s) (keep ids: {})",
            pending.len(),
            keep_reference_ids
        );

        let spaced = pending.len() > 1;
        for (index, old) in pending.into_iter().enumerate() {
            if spaced && index > 0 {
                monoio::time::sleep(self.config.resubscribe_delay()).await;
            }
            self.ensure_context(&context_id, yield_to_reconnect)?;
            self.resubscribe_one(&context_id, old, keep_reference_ids).await?;
        }

        Ok(())
    }

    async fn resubscribe_one(
        &self,
        context_id: &str,
        old: Subscription,
        keep_reference_id: bool,
    ) -> Result<()> {
        if !self.store.contains(&old.reference_id) {
            debug!("Skipping resubscribe of {}: no longer stored", old.reference_id);
            return Ok(());
        }

        let reference_id = if keep_reference_id {
            old.reference_id.clone()
        } else {
            rotate_reference_id(&old.reference_id, |id| self.store.contains(id))
        };
        let replace = (!keep_reference_id && old.context_id == context_id)
            .then_some(old.reference_id.as_str());

        let body = subscription_body(
            context_id,
            &reference_id,
            self.config.refresh_rate_ms,
            &old.arguments,
            replace,
        );

        self.store.set_state(&old.reference_id, SubscriptionState::Resetting);
        let response = match self.post_subscription(&old.endpoint, &body).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Resubscribe of {} failed: {}", old.reference_id, e);
                self.store.set_state(&old.reference_id, SubscriptionState::Active);
                return Err(e);
            }
        };
        if let Err(e) = self.ensure_context(context_id, false) {
            self.store.set_state(&old.reference_id, SubscriptionState::Active);
            return Err(e);
        }

        let mut renewed = Subscription::new(context_id, reference_id.clone(), old.kind, old.arguments);
        renewed.endpoint = old.endpoint;
        renewed.location = response.header("Location").map(str::to_string);
        self.store.replace(&old.reference_id, renewed);

        debug!("Resubscribed {} as {}", old.reference_id, reference_id);
        Ok(())
    }

    fn mark_full_reset(&self) {
        *self.last_full_reset.lock().unwrap_or_else(|e| e.into_inner()) = Some(Timestamp::now());
    }

    fn in_reset_cooldown(&self) -> bool {
        self.last_full_reset
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() < self.config.reset_cooldown())
    }

    /// React to a server or health-monitor reset request.
    ///
    /// Empty `targets` means every subscription. The work itself runs on a
    /// spawned task so the caller never waits on HTTP. A reconnect that
    /// starts meanwhile stops the reset before its next request.
    pub fn handle_reset(self: &Arc<Self>, targets: Vec<String>) -> ResetDecision {
        if self.reconnect_in_flight.load(Ordering::SeqCst) {
            debug!("Reset ignored: reconnection in flight");
            return ResetDecision::SkippedReconnecting;
        }
        if self.in_reset_cooldown() {
            debug!("Reset ignored: full reset within cooldown");
            return ResetDecision::SkippedCooldown;
        }
        if self
            .reset_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reset ignored: another reset is running");
            return ResetDecision::SkippedBusy;
        }

        info!(
            "♻️ Resetting {} subscription(s)",
            if targets.is_empty() { "all".to_string() } else { targets.len().to_string() }
        );

        let manager = Arc::clone(self);
        monoio::spawn(async move {
            let _running = FlagGuard(&manager.reset_running);
            let targets = (!targets.is_empty()).then_some(targets);
            match manager.replay(false, targets.as_deref(), true).await {
                Ok(()) => {}
                Err(StreamError::NotConnected(reason)) => {
                    info!("Subscription reset abandoned: {}", reason);
                }
                Err(e) => warn!("Subscription reset failed: {}", e),
            }
        });

        ResetDecision::Scheduled
    }
}
