//! Live price stream using streamwire
//!
//! Demonstrates:
//! - Loading endpoints and a bearer token from the environment
//! - Connecting and subscribing to FX prices by ticker
//! - Reading typed price and order updates from topic channels
//! - Watching auth notifications while the client reconnects on its own
//!
//! Requires `STREAMWIRE_ACCESS_TOKEN`; `STREAMWIRE_REST_URL` and
//! `STREAMWIRE_STREAMING_URL` default to the simulation gateway.

use anyhow::Context;
use serde_json::json;
use std::time::Duration;
use streamwire_client::prelude::*;
use tracing::{info, warn};

const RUN_FOR: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    init_logging();
    StreamRuntime::new().block_on(run())?
}

async fn run() -> anyhow::Result<()> {
    info!("🚀 Starting streamwire price stream demo");

    let client = StreamingClient::from_env().context("loading streaming configuration")?;
    client.register_instruments([(21, "EURUSD"), (31, "USDJPY"), (22, "GBPUSD")]);

    client.connect().await.context("connecting to streaming gateway")?;
    info!("📋 Context: {}", client.context_id().unwrap_or_default());

    let prices_ref = client.subscribe_prices(&["EURUSD", "USDJPY", "GBPUSD"]).await?;
    let orders_ref = client.subscribe_orders(json!({"FieldGroups": ["DisplayAndFormat"]})).await?;
    info!("Subscribed: {} and {}", prices_ref, orders_ref);

    let prices = client.price_updates();
    let orders = client.order_updates();
    let notifications = client.auth_notifications();
    let updates = async {
        loop {
            monoio::select! {
                price = prices.recv_async() => match price {
                    Ok(p) => info!("💱 {} bid {} ask {} spread {}", p.ticker, p.bid, p.ask, p.spread()),
                    Err(_) => break,
                },
                order = orders.recv_async() => match order {
                    Ok(o) => info!("📦 Order {} {}", o.order_id, o.status),
                    Err(_) => break,
                },
                up = notifications.connection_state.recv_async() => match up {
                    Ok(true) => info!("🔗 Connection up"),
                    Ok(false) => warn!("Connection down, client is reconnecting"),
                    Err(_) => break,
                },
            }
        }
    };
    monoio::select! {
        _ = monoio::time::sleep(RUN_FOR) => info!("Demo window elapsed"),
        _ = updates => warn!("Update channels closed"),
    }

    client.unsubscribe(&prices_ref).await?;
    client.close().await?;
    info!("✅ Demo finished");
    Ok(())
}
