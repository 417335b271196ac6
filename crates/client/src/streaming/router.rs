//! Message routing
//!
//! Control messages update local state or come back to the caller as a
//! [`RouteAction`]; data messages become update records on the topic
//! channels. Nothing in here blocks: topic sends are `try_send`, and a full
//! channel drops the update.

use crate::errors::{Result, StreamError};
use crate::streaming::codec::{ControlKind, ParsedMessage};
use crate::streaming::instruments::InstrumentMap;
use crate::streaming::store::SubscriptionStore;
use crate::types::{OrderUpdate, PortfolioUpdate, PriceUpdate, SubscriptionKind};

use flume::{Receiver, Sender, TrySendError};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Follow-up the processor must perform for a control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    None,
    /// Server asked us to go away
    Disconnect,
    /// Reset these subscriptions; empty means all of them
    Reset(Vec<String>),
}

/// Reason attached to a heartbeat entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatReason {
    NoNewData,
    SubscriptionTemporarilyDisabled,
    SubscriptionPermanentlyDisabled,
    Other(String),
}

impl HeartbeatReason {
    fn parse(reason: &str) -> Self {
        match reason {
            "NoNewData" => HeartbeatReason::NoNewData,
            "SubscriptionTemporarilyDisabled" => HeartbeatReason::SubscriptionTemporarilyDisabled,
            "SubscriptionPermanentlyDisabled" => HeartbeatReason::SubscriptionPermanentlyDisabled,
            other => HeartbeatReason::Other(other.to_string()),
        }
    }
}

/// Sending halves of the consumer topics
#[derive(Clone)]
pub struct TopicSenders {
    pub prices: Sender<PriceUpdate>,
    pub orders: Sender<OrderUpdate>,
    pub portfolio: Sender<PortfolioUpdate>,
}

/// Receiving halves of the consumer topics
#[derive(Clone)]
pub struct TopicReceivers {
    pub prices: Receiver<PriceUpdate>,
    pub orders: Receiver<OrderUpdate>,
    pub portfolio: Receiver<PortfolioUpdate>,
}

/// Bounded topic channels of the given capacity
pub fn topic_channels(capacity: usize) -> (TopicSenders, TopicReceivers) {
    let (prices_tx, prices_rx) = flume::bounded(capacity);
    let (orders_tx, orders_rx) = flume::bounded(capacity);
    let (portfolio_tx, portfolio_rx) = flume::bounded(capacity);
    (
        TopicSenders {
            prices: prices_tx,
            orders: orders_tx,
            portfolio: portfolio_tx,
        },
        TopicReceivers {
            prices: prices_rx,
            orders: orders_rx,
            portfolio: portfolio_rx,
        },
    )
}

/// Dispatches decoded messages to handlers and topics
pub struct MessageRouter {
    store: Arc<SubscriptionStore>,
    instruments: Arc<InstrumentMap>,
    topics: TopicSenders,
}

impl MessageRouter {
    pub fn new(
        store: Arc<SubscriptionStore>,
        instruments: Arc<InstrumentMap>,
        topics: TopicSenders,
    ) -> Self {
        Self {
            store,
            instruments,
            topics,
        }
    }

    /// Route one message. Malformed payloads are logged and dropped.
    pub fn route(&self, message: &ParsedMessage) -> RouteAction {
        let outcome = match message.control_kind() {
            Some(ControlKind::Heartbeat) => self.handle_heartbeat(message),
            Some(ControlKind::Disconnect) => {
                info!("🔌 Server requested disconnect");
                Ok(RouteAction::Disconnect)
            }
            Some(ControlKind::ResetSubscriptions) => self.handle_reset(message),
            None => self.handle_data(message).map(|_| RouteAction::None),
        };

        outcome.unwrap_or_else(|e| {
            warn!(
                "Dropping message {} ({}): {}",
                message.message_id, message.reference_id, e
            );
            RouteAction::None
        })
    }

    fn handle_heartbeat(&self, message: &ParsedMessage) -> Result<RouteAction> {
        let payload = message.json_payload()?;
        let mut disabled = Vec::new();

        for entry in flatten_entries(&payload, Some("Heartbeats")) {
            let Some(origin) = entry["OriginatingReferenceId"].as_str() else {
                continue;
            };
            let reason = HeartbeatReason::parse(entry["Reason"].as_str().unwrap_or(""));
            debug!("💓 Heartbeat for {} ({:?})", origin, reason);

            if !self.store.touch(origin) {
                debug!("Heartbeat for untracked subscription {}", origin);
                continue;
            }
            if reason == HeartbeatReason::SubscriptionPermanentlyDisabled {
                warn!("Subscription {} permanently disabled by server", origin);
                disabled.push(origin.to_string());
            }
        }

        Ok(if disabled.is_empty() {
            RouteAction::None
        } else {
            RouteAction::Reset(disabled)
        })
    }

    fn handle_reset(&self, message: &ParsedMessage) -> Result<RouteAction> {
        let payload = message.json_payload()?;
        let mut targets: Vec<String> = Vec::new();

        for entry in flatten_entries(&payload, None) {
            if let Some(ids) = entry["TargetReferenceIds"].as_array() {
                for id in ids.iter().filter_map(Value::as_str) {
                    if !targets.iter().any(|t| t == id) {
                        targets.push(id.to_string());
                    }
                }
            }
        }

        info!(
            "Server requested reset of {}",
            if targets.is_empty() { "all subscriptions".to_string() } else { targets.join(", ") }
        );
        Ok(RouteAction::Reset(targets))
    }

    fn handle_data(&self, message: &ParsedMessage) -> Result<()> {
        let Some(kind) = SubscriptionKind::from_reference_id(&message.reference_id) else {
            debug!("No route for reference id {}", message.reference_id);
            return Ok(());
        };

        self.store.touch(&message.reference_id);
        let payload = message.json_payload()?;

        match kind {
            SubscriptionKind::Prices => {
                for update in self.parse_prices(&message.reference_id, &payload) {
                    deliver(&self.topics.prices, update, "prices");
                }
            }
            SubscriptionKind::Orders => {
                for update in self.parse_orders(&message.reference_id, &payload)? {
                    deliver(&self.topics.orders, update, "orders");
                }
            }
            SubscriptionKind::Balances => {
                for update in parse_portfolio(&message.reference_id, &payload) {
                    deliver(&self.topics.portfolio, update, "portfolio");
                }
            }
            SubscriptionKind::Sessions => {
                info!("Session event on {}: {}", message.reference_id, payload);
            }
        }
        Ok(())
    }

    /// Quotes arrive as a bare array; snapshots wrap them in `Data`
    fn parse_prices(&self, reference_id: &str, payload: &Value) -> Vec<PriceUpdate> {
        let mut updates = Vec::new();

        for quote in flatten_entries(payload, Some("Data")) {
            let Some(uic) = quote["Uic"].as_i64() else {
                warn!("Price entry without Uic on {}", reference_id);
                continue;
            };
            let Some(ticker) = self.instruments.ticker(uic) else {
                warn!("Dropping price for unknown UIC {}", uic);
                continue;
            };

            let update = PriceUpdate {
                reference_id: reference_id.to_string(),
                uic,
                ticker,
                bid: decimal_or_zero(&quote["Quote"]["Bid"]),
                ask: decimal_or_zero(&quote["Quote"]["Ask"]),
                mid: decimal_or_zero(&quote["Quote"]["Mid"]),
                last_updated: quote["LastUpdated"].as_str().map(str::to_string),
            };

            if update.is_empty_quote() {
                debug!("Dropping empty quote for {}", update.ticker);
                continue;
            }
            updates.push(update);
        }

        updates
    }

    fn parse_orders(&self, reference_id: &str, payload: &Value) -> Result<Vec<OrderUpdate>> {
        flatten_entries(payload, Some("Data"))
            .into_iter()
            .map(|order| {
                let order_id = string_field(&order["OrderId"]).ok_or_else(|| {
                    StreamError::InvalidMessage("order update without OrderId".to_string())
                })?;
                let status = string_field(&order["Status"]).ok_or_else(|| {
                    StreamError::InvalidMessage(format!("order {order_id} without Status"))
                })?;
                let uic = order["Uic"].as_i64();

                Ok(OrderUpdate {
                    reference_id: reference_id.to_string(),
                    order_id,
                    status,
                    uic,
                    ticker: uic.and_then(|uic| self.instruments.ticker(uic)),
                    buy_sell: order["BuySell"].as_str().unwrap_or("").to_string(),
                    order_type: order["OpenOrderType"]
                        .as_str()
                        .or_else(|| order["OrderType"].as_str())
                        .unwrap_or("")
                        .to_string(),
                    amount: decimal_or_zero(&order["Amount"]),
                    price: decimal(&order["Price"]),
                    account_key: order["AccountKey"].as_str().unwrap_or("").to_string(),
                })
            })
            .collect()
    }
}

fn parse_portfolio(reference_id: &str, payload: &Value) -> Vec<PortfolioUpdate> {
    flatten_entries(payload, Some("Data"))
        .into_iter()
        .map(|balance| PortfolioUpdate {
            reference_id: reference_id.to_string(),
            account_key: balance["AccountKey"].as_str().unwrap_or("").to_string(),
            currency: balance["Currency"].as_str().unwrap_or("").to_string(),
            cash_balance: decimal_or_zero(&balance["CashBalance"]),
            total_value: decimal_or_zero(&balance["TotalValue"]),
            margin_available: decimal_or_zero(&balance["MarginAvailableForTrading"]),
            unrealized_pnl: decimal_or_zero(&balance["UnrealizedPositionsValue"]),
        })
        .collect()
}

/// Entries of a payload that may be a bare array, an object wrapping an
/// array under `wrapper`, an array of such wrappers, or a single object.
fn flatten_entries<'a>(payload: &'a Value, wrapper: Option<&str>) -> Vec<&'a Value> {
    let unwrap = |value: &'a Value| -> Vec<&'a Value> {
        match wrapper.and_then(|key| value.get(key)).and_then(Value::as_array) {
            Some(inner) => inner.iter().collect(),
            None => vec![value],
        }
    };

    match payload {
        Value::Array(items) => items.iter().flat_map(unwrap).collect(),
        Value::Object(_) => unwrap(payload),
        _ => Vec::new(),
    }
}

fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

fn decimal_or_zero(value: &Value) -> Decimal {
    decimal(value).unwrap_or(Decimal::ZERO)
}

fn string_field(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deliver<T>(topic: &Sender<T>, update: T, name: &str) {
    match topic.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("⚠️ {} channel full, dropping update", name),
        Err(TrySendError::Disconnected(_)) => debug!("{} channel has no consumers", name),
    }
}
