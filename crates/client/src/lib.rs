//! # Streamwire Client
//!
//! Streaming API client for a brokerage-style realtime gateway.
//!
//! ## Architecture
//!
//! - **monoio-native transport** - plain TCP or rustls TLS, HTTP/1.1 and RFC 6455
//! - **Binary wire codec** - length-prefixed messages, several per frame
//! - **Subscription lifecycle** - create, replace, reset and unsubscribe over REST
//! - **Reader/processor pipeline** - bounded queues, cancellation per connection
//! - **Self-healing** - supervised reconnection with linear backoff and a
//!   health monitor for silent subscriptions
//! - **Exact decimals** - prices and balances as `rust_decimal::Decimal`

pub mod errors;
pub mod http;
pub mod streaming;
pub mod traits;
pub mod transport;
pub mod types;
pub mod websocket;

// Re-export main types
pub use errors::{ErrorDisposition, Result, StreamError};
pub use http::{HttpResponse, MonoioHttpClient};
pub use streaming::{StaticTokenAuth, StreamingClient, StreamingConfig};
pub use traits::AuthProvider;
pub use types::*;
pub use websocket::{MonoioWebSocket, WsMessage};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::errors::{ErrorDisposition, Result, StreamError};
    pub use crate::streaming::{
        ConnectionManager, StaticTokenAuth, StreamingClient, StreamingConfig, Subscription,
    };
    pub use crate::traits::AuthProvider;
    pub use crate::types::*;
    pub use streamwire_core::prelude::*;
}
