//! Streaming session: wire codec, subscription lifecycle, routing and the
//! reader/processor pipeline behind a resilient connection manager.
//!
//! One [`ConnectionManager`] owns one WebSocket at a time. Each connection
//! gets a generation number, a cancellation token, a reader task that owns
//! the socket and a processor task that decodes and routes. A supervisor
//! task serialises reconnection requests; a health monitor watches per
//! subscription silence.

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod instruments;
pub mod pipeline;
pub mod router;
pub mod store;
pub mod subscriptions;

pub use auth::StaticTokenAuth;
pub use client::StreamingClient;
pub use codec::{ControlKind, ParsedMessage, PAYLOAD_FORMAT_JSON, decode, decode_all, encode};
pub use config::StreamingConfig;
pub use connection::{AuthNotifications, Backoff, ConnectionManager, build_stream_url};
pub use instruments::InstrumentMap;
pub use pipeline::{HealthAction, HealthMonitor, ReconnectRequest, SequenceTracker};
pub use router::{MessageRouter, RouteAction, TopicReceivers, TopicSenders, topic_channels};
pub use store::{Subscription, SubscriptionState, SubscriptionStore};
pub use subscriptions::{ResetDecision, SubscriptionManager};
