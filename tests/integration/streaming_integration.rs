//! End-to-end tests of the streaming client against the mock gateway

use rstest::*;
use rust_decimal::Decimal;
use serde_json::json;
use serial_test::serial;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use streamwire_client::prelude::*;
use streamwire_client::streaming::ParsedMessage;
use streamwire_tests::{MockServer, eventually, test_config};

const WAIT: Duration = Duration::from_secs(3);

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn client_for(server: &MockServer) -> StreamingClient {
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenAuth::new("test-token"));
    let client = StreamingClient::new(test_config(server), auth).unwrap();
    client.register_instruments([(21, "EURUSD"), (22, "GBPUSD")]);
    client
}

async fn connected_client(server: &MockServer) -> StreamingClient {
    let client = client_for(server);
    client.connect().await.unwrap();
    client
}

fn quote(uic: i64, bid: f64, ask: f64) -> serde_json::Value {
    json!({"Uic": uic, "Quote": {"Bid": bid, "Ask": ask, "Mid": (bid + ask) / 2.0}})
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_connect_sends_bearer_and_context() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    let context_id = client.context_id().unwrap();

    let upgrades = server.requests_with_method("GET");
    assert_eq!(upgrades.len(), 1);
    assert!(upgrades[0].path.starts_with("/openapi/streamingws/connect?"));
    assert!(upgrades[0].path.contains(&format!("contextid={context_id}")));
    assert!(!upgrades[0].path.contains("messageid"));
    assert_eq!(upgrades[0].authorization.as_deref(), Some("Bearer test-token"));

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_price_update_reaches_consumer() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let prices = client.price_updates();

    let reference_id = client.subscribe_prices(&["EURUSD"]).await.unwrap();
    assert!(reference_id.starts_with("prices-"));

    server.push(&ParsedMessage::json(
        1,
        reference_id.clone(),
        &json!([quote(21, 1.1000, 1.1002)]),
    ));

    let update = monoio::time::timeout(WAIT, prices.recv_async())
        .await
        .expect("price update within deadline")
        .unwrap();
    assert_eq!(update.reference_id, reference_id);
    assert_eq!(update.uic, 21);
    assert_eq!(update.ticker, "EURUSD");
    assert_eq!(update.bid, dec("1.1000"));
    assert_eq!(update.ask, dec("1.1002"));
    assert_eq!(update.spread(), dec("0.0002"));

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_subscription_request_body() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;

    let reference_id = client.subscribe_prices(&["21", "21", "22"]).await.unwrap();

    let posts = server.subscription_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "/openapi/trade/v1/infoprices/subscriptions");
    assert_eq!(posts[0].authorization.as_deref(), Some("Bearer test-token"));

    let body = posts[0].json_body();
    assert_eq!(body["ContextId"], client.context_id().unwrap());
    assert_eq!(body["ReferenceId"], reference_id);
    assert_eq!(body["RefreshRate"], 1000);
    assert_eq!(body["Arguments"]["Uics"], "21,22");
    assert_eq!(body["Arguments"]["AssetType"], "FxSpot");

    let stored = client.subscriptions();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, SubscriptionKind::Prices);
    assert!(stored[0].location.is_some());

    client.close().await.unwrap();
}

#[rstest]
#[case(SubscriptionKind::Orders, "/openapi/port/v1/orders/subscriptions", "orders-")]
#[case(SubscriptionKind::Balances, "/openapi/port/v1/balances/subscriptions", "balances-")]
#[case(SubscriptionKind::Sessions, "/openapi/root/v1/sessions/events/subscriptions", "sessions-")]
#[serial]
fn test_account_subscription_endpoints(
    #[case] kind: SubscriptionKind,
    #[case] path: &str,
    #[case] prefix: &str,
) {
    let mut runtime = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .build()
        .unwrap();
    runtime.block_on(async {
        let server = MockServer::start().unwrap();
        let client = connected_client(&server).await;

        let reference_id = client
            .subscribe::<&str>(kind, &[], json!({"ClientKey": "ck-1"}))
            .await
            .unwrap();
        assert!(reference_id.starts_with(prefix));

        let posts = server.subscription_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].path, path);
        assert_eq!(posts[0].json_body()["Arguments"]["ClientKey"], "ck-1");

        client.close().await.unwrap();
    });
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_rejected_subscription_is_not_stored() {
    let server = MockServer::start().unwrap();
    server.set_subscribe_status(400);
    let client = connected_client(&server).await;

    let result = client.subscribe_prices(&["EURUSD"]).await;
    assert!(matches!(
        result,
        Err(StreamError::SubscriptionFailed { status: 400, .. })
    ));
    assert!(client.subscriptions().is_empty());

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_unknown_ticker_sends_nothing() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;

    let result = client.subscribe_prices(&["XAUUSD"]).await;
    assert!(matches!(result, Err(StreamError::UnknownInstrument(_))));
    assert!(server.subscription_posts().is_empty());

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_unsubscribe_deletes_and_forgets() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let reference_id = client.subscribe_prices(&["EURUSD"]).await.unwrap();

    client.unsubscribe(&reference_id).await.unwrap();

    let deletes = server.requests_with_method("DELETE");
    assert_eq!(deletes.len(), 1);
    assert_eq!(
        deletes[0].path,
        format!(
            "/openapi/trade/v1/infoprices/subscriptions/{}/{}",
            client.context_id().unwrap(),
            reference_id
        )
    );
    assert!(client.subscriptions().is_empty());

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_close_stops_workers() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let notifications = client.auth_notifications();
    assert_eq!(notifications.connection_state.try_recv(), Ok(true));

    client.close().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(eventually(WAIT, || server.client_closes() == 1).await);
    assert_eq!(notifications.connection_state.try_recv(), Ok(false));

    // Closing twice is harmless and nothing reconnects afterwards.
    client.close().await.unwrap();
    monoio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.upgrades(), 1);
    assert!(!client.manager().is_reconnecting());
    assert!(notifications.connection_state.try_recv().is_err());
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_heartbeat_refreshes_liveness() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let reference_id = client.subscribe_prices(&["EURUSD"]).await.unwrap();
    let before = client.subscriptions()[0].last_message_at;

    monoio::time::sleep(Duration::from_millis(20)).await;
    server.push(&ParsedMessage::json(
        2,
        "_heartbeat",
        &json!([{"OriginatingReferenceId": reference_id, "Reason": "NoNewData"}]),
    ));

    assert!(
        eventually(WAIT, || client.subscriptions()[0].last_message_at > before).await,
        "heartbeat should refresh last message time"
    );
    assert!(client.price_updates().is_empty());

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_batched_frame_delivers_every_message() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let prices = client.price_updates();
    let reference_id = client.subscribe_prices(&["EURUSD", "GBPUSD"]).await.unwrap();

    server.push_batch(&[
        ParsedMessage::json(10, reference_id.clone(), &json!([quote(21, 1.10, 1.11)])),
        ParsedMessage::json(11, reference_id.clone(), &json!([quote(22, 1.25, 1.26)])),
    ]);

    let first = monoio::time::timeout(WAIT, prices.recv_async()).await.unwrap().unwrap();
    let second = monoio::time::timeout(WAIT, prices.recv_async()).await.unwrap().unwrap();
    assert_eq!(first.ticker, "EURUSD");
    assert_eq!(second.ticker, "GBPUSD");
    assert!(eventually(WAIT, || client.manager().sequence().last_seen() == Some(11)).await);

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_server_reset_rotates_reference_id() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let reference_id = client.subscribe_prices(&["EURUSD"]).await.unwrap();

    server.push(&ParsedMessage::json(
        3,
        "_resetsubscriptions",
        &json!({"TargetReferenceIds": [reference_id]}),
    ));

    assert!(eventually(WAIT, || server.subscription_posts().len() == 2).await);
    let replay = server.subscription_posts()[1].json_body();
    assert_eq!(replay["ReplaceReferenceId"], reference_id);
    assert_ne!(replay["ReferenceId"], reference_id);

    assert!(
        eventually(WAIT, || {
            let stored = client.subscriptions();
            stored.len() == 1 && stored[0].reference_id != reference_id
        })
        .await
    );

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_disconnect_message_shuts_down() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;

    server.push(&ParsedMessage::json(4, "_disconnect", &json!({})));

    assert!(eventually(WAIT, || client.state() == ConnectionState::Disconnected).await);
    monoio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.upgrades(), 1);
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_normal_server_close_does_not_reconnect() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;

    server.close_socket(1000);

    assert!(eventually(WAIT, || client.state() == ConnectionState::Disconnected).await);
    monoio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.upgrades(), 1);
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_dropped_socket_reconnects_and_resubscribes() {
    let server = MockServer::start().unwrap();
    let client = connected_client(&server).await;
    let prices = client.price_updates();
    let first_context = client.context_id().unwrap();
    let reference_id = client.subscribe_prices(&["EURUSD"]).await.unwrap();

    server.push(&ParsedMessage::json(7, reference_id.clone(), &json!([quote(21, 1.1, 1.2)])));
    monoio::time::timeout(WAIT, prices.recv_async()).await.unwrap().unwrap();

    server.drop_socket();

    assert!(eventually(WAIT, || server.upgrades() == 2).await, "client should reconnect");
    assert!(eventually(WAIT, || server.subscription_posts().len() == 2).await);
    assert!(eventually(WAIT, || !client.manager().is_reconnecting()).await);
    assert_eq!(client.state(), ConnectionState::Connected);

    let second_context = client.context_id().unwrap();
    assert_ne!(first_context, second_context);

    let upgrade = &server.requests_with_method("GET")[1];
    assert!(upgrade.path.contains(&format!("contextid={second_context}")));
    assert!(upgrade.path.contains("messageid=7"));

    // A new context never asks the server to replace the old subscription.
    let replay = server.subscription_posts()[1].json_body();
    assert_eq!(replay["ContextId"], second_context);
    assert!(replay.get("ReplaceReferenceId").is_none());
    assert_eq!(client.manager().reconnect_attempts(), 0);

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_subscribe_during_reconnect_is_rejected() {
    let server = MockServer::start().unwrap();
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenAuth::new("test-token"));
    let config = test_config(&server).with_backoff(500, 1000, 3);
    let client = StreamingClient::new(config, auth).unwrap();
    client.register_instruments([(21, "EURUSD"), (22, "GBPUSD")]);
    client.connect().await.unwrap();
    client.subscribe_prices(&["EURUSD"]).await.unwrap();

    server.drop_socket();
    assert!(eventually(WAIT, || client.state() == ConnectionState::Reconnecting).await);

    assert_eq!(client.context_id(), None);
    let result = client.subscribe_prices(&["GBPUSD"]).await;
    assert!(matches!(result, Err(StreamError::NotConnected(_))));
    assert_eq!(server.subscription_posts().len(), 1);

    assert!(eventually(WAIT, || client.state() == ConnectionState::Connected).await);
    assert!(eventually(WAIT, || !client.manager().is_reconnecting()).await);
    assert_eq!(client.subscriptions().len(), 1);

    client.close().await.unwrap();
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_reset_interrupted_by_reconnect_leaves_one_copy() {
    let server = MockServer::start().unwrap();
    let auth: Arc<dyn AuthProvider> = Arc::new(StaticTokenAuth::new("test-token"));
    let config = test_config(&server).with_resubscribe_delay(300);
    let client = StreamingClient::new(config, auth).unwrap();
    client.register_instruments([(21, "EURUSD"), (22, "GBPUSD")]);
    client.connect().await.unwrap();
    client.subscribe_prices(&["EURUSD"]).await.unwrap();
    client.subscribe_prices(&["GBPUSD"]).await.unwrap();

    server.push(&ParsedMessage::json(
        5,
        "_resetsubscriptions",
        &json!({"TargetReferenceIds": []}),
    ));
    assert!(eventually(WAIT, || server.subscription_posts().len() == 3).await);
    monoio::time::sleep(Duration::from_millis(50)).await;
    server.drop_socket();

    assert!(eventually(WAIT, || server.upgrades() == 2).await, "client should reconnect");
    let manager = client.manager();
    assert!(
        eventually(WAIT, || {
            !manager.is_reconnecting()
                && !manager.subscriptions().is_reset_running()
                && client.state() == ConnectionState::Connected
        })
        .await
    );
    // Past the spacing of any abandoned replay step.
    monoio::time::sleep(Duration::from_millis(400)).await;

    let context_id = client.context_id().unwrap();
    let stored = client.subscriptions();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|s| s.context_id == context_id));
    assert_ne!(stored[0].reference_id, stored[1].reference_id);

    let posts: Vec<_> = server
        .subscription_posts()
        .iter()
        .map(|p| p.json_body())
        .collect();
    assert!(posts.iter().all(|body| body["ReferenceId"] != body["ReplaceReferenceId"]));
    let on_new_context = posts.iter().filter(|body| body["ContextId"] == context_id).count();
    assert_eq!(on_new_context, 2);
    assert_eq!(posts.len(), 5);

    client.close().await.unwrap();
}
