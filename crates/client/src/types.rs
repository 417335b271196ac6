//! Shared streaming types
//!
//! Update records are plain values: the router builds them once from a
//! decoded payload and hands them off by value through the topic channels.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

/// Kind of streaming subscription, derived from its reference id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Prices,
    Orders,
    Balances,
    Sessions,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 4] = [
        SubscriptionKind::Prices,
        SubscriptionKind::Orders,
        SubscriptionKind::Balances,
        SubscriptionKind::Sessions,
    ];

    /// Classify a reference id by the kind marker it contains.
    ///
    /// Matching is by substring, not prefix: `myprices-1` routes as prices.
    pub fn from_reference_id(reference_id: &str) -> Option<Self> {
        if reference_id.contains("price") {
            Some(SubscriptionKind::Prices)
        } else if reference_id.contains("order") {
            Some(SubscriptionKind::Orders)
        } else if reference_id.contains("balance") {
            Some(SubscriptionKind::Balances)
        } else if reference_id.contains("session") {
            Some(SubscriptionKind::Sessions)
        } else {
            None
        }
    }

    /// Prefix used when minting reference ids of this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            SubscriptionKind::Prices => "prices",
            SubscriptionKind::Orders => "orders",
            SubscriptionKind::Balances => "balances",
            SubscriptionKind::Sessions => "sessions",
        }
    }

    /// Subscription endpoint path relative to the REST base URL
    pub fn endpoint(&self) -> &'static str {
        match self {
            SubscriptionKind::Prices => "trade/v1/infoprices/subscriptions",
            SubscriptionKind::Orders => "port/v1/orders/subscriptions",
            SubscriptionKind::Balances => "port/v1/balances/subscriptions",
            SubscriptionKind::Sessions => "root/v1/sessions/events/subscriptions",
        }
    }

    /// Whether subscription arguments carry instrument identifiers
    pub fn takes_instruments(&self) -> bool {
        matches!(self, SubscriptionKind::Prices)
    }
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Price quote for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub reference_id: String,
    pub uic: i64,
    pub ticker: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    /// Server-side quote time as sent on the wire
    pub last_updated: Option<String>,
}

impl PriceUpdate {
    /// A quote with no bid, ask or mid carries no data
    pub fn is_empty_quote(&self) -> bool {
        self.bid.is_zero() && self.ask.is_zero() && self.mid.is_zero()
    }

    /// Ask minus bid
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Order status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub reference_id: String,
    pub order_id: String,
    pub status: String,
    pub uic: Option<i64>,
    pub ticker: Option<String>,
    pub buy_sell: String,
    pub order_type: String,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub account_key: String,
}

/// Account balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioUpdate {
    pub reference_id: String,
    pub account_key: String,
    pub currency: String,
    pub cash_balance: Decimal,
    pub total_value: Decimal,
    pub margin_available: Decimal,
    pub unrealized_pnl: Decimal,
}
