//! Streaming client facade
//!
//! Thin owner of a [`ConnectionManager`] exposing the calls an application
//! needs: connect, subscribe by ticker, read typed updates, close.

use crate::errors::Result;
use crate::streaming::auth::StaticTokenAuth;
use crate::streaming::config::StreamingConfig;
use crate::streaming::connection::{AuthNotifications, ConnectionManager};
use crate::streaming::store::Subscription;
use crate::traits::AuthProvider;
use crate::types::{ConnectionState, OrderUpdate, PortfolioUpdate, PriceUpdate, SubscriptionKind};

use flume::Receiver;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// Application-facing streaming client
#[derive(Clone)]
pub struct StreamingClient {
    manager: Arc<ConnectionManager>,
}

impl StreamingClient {
    /// Build a client after validating the configuration
    pub fn new(config: StreamingConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        config.validate()?;
        info!(
            "Streaming client configured for {} (refresh {}ms)",
            config.streaming_base_url, config.refresh_rate_ms
        );
        Ok(Self {
            manager: ConnectionManager::new(config, auth),
        })
    }

    /// Configuration and static token both taken from the environment
    pub fn from_env() -> Result<Self> {
        let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenAuth::from_env()?);
        Self::new(StreamingConfig::from_env(), auth)
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Stop every worker and close the socket. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn context_id(&self) -> Option<String> {
        self.manager.subscriptions().context_id()
    }

    /// Load the UIC ↔ ticker table used to resolve subscriptions and label
    /// price updates. Replaces any previous table.
    pub fn register_instruments<I, S>(&self, instruments: I)
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        self.manager.subscriptions().instruments().register(instruments);
    }

    pub async fn subscribe<S: AsRef<str>>(
        &self,
        kind: SubscriptionKind,
        instruments: &[S],
        arguments: Value,
    ) -> Result<String> {
        self.manager
            .subscriptions()
            .subscribe(kind, instruments, arguments)
            .await
    }

    /// Subscribe to top-of-book prices for tickers or raw UICs
    pub async fn subscribe_prices<S: AsRef<str>>(&self, instruments: &[S]) -> Result<String> {
        self.subscribe(SubscriptionKind::Prices, instruments, json!({}))
            .await
    }

    pub async fn subscribe_orders(&self, arguments: Value) -> Result<String> {
        self.subscribe::<&str>(SubscriptionKind::Orders, &[], arguments)
            .await
    }

    pub async fn subscribe_balances(&self, arguments: Value) -> Result<String> {
        self.subscribe::<&str>(SubscriptionKind::Balances, &[], arguments)
            .await
    }

    pub async fn subscribe_session_events(&self) -> Result<String> {
        self.subscribe::<&str>(SubscriptionKind::Sessions, &[], json!({}))
            .await
    }

    pub async fn unsubscribe(&self, reference_id: &str) -> Result<()> {
        self.manager.subscriptions().unsubscribe(reference_id).await
    }

    /// Replay every stored subscription on the current context
    pub async fn resubscribe_all(&self, keep_reference_ids: bool) -> Result<()> {
        self.manager
            .subscriptions()
            .resubscribe_all(keep_reference_ids, None)
            .await
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.manager.subscriptions().store().snapshot()
    }

    pub fn price_updates(&self) -> Receiver<PriceUpdate> {
        self.manager.topics().prices.clone()
    }

    pub fn order_updates(&self) -> Receiver<OrderUpdate> {
        self.manager.topics().orders.clone()
    }

    pub fn portfolio_updates(&self) -> Receiver<PortfolioUpdate> {
        self.manager.topics().portfolio.clone()
    }

    pub fn auth_notifications(&self) -> AuthNotifications {
        self.manager.auth_notifications()
    }

    /// Underlying connection manager, for reconnect diagnostics
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}
