//! Auth collaborator contract, exercised through a mockall double

use async_trait::async_trait;
use mockall::mock;
use serial_test::serial;
use std::sync::Arc;
use streamwire_client::prelude::*;
use streamwire_client::MonoioHttpClient;
use streamwire_tests::{MockServer, test_config};

mock! {
    pub Auth {}

    #[async_trait(?Send)]
    impl AuthProvider for Auth {
        fn is_authenticated(&self) -> bool;
        async fn access_token(&self) -> Result<String>;
        fn http_client(&self) -> Result<MonoioHttpClient>;
    }
}

fn client_with(auth: MockAuth) -> StreamingClient {
    let auth: Arc<dyn AuthProvider> = Arc::new(auth);
    let config = StreamingConfig::default()
        .with_rest_base_url("http://127.0.0.1:9/openapi")
        .with_streaming_base_url("http://127.0.0.1:9/openapi/streamingws");
    StreamingClient::new(config, auth).unwrap()
}

#[monoio::test(enable_timer = true)]
async fn test_connect_fails_fast_without_session() {
    let mut auth = MockAuth::new();
    auth.expect_is_authenticated().return_const(false);
    auth.expect_access_token().never();
    auth.expect_http_client().never();

    let client = client_with(auth);
    let result = client.connect().await;

    assert!(matches!(result, Err(StreamError::NotAuthenticated)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.manager().generation(), 0);
}

#[monoio::test(enable_timer = true)]
async fn test_token_failure_aborts_connect() {
    let mut auth = MockAuth::new();
    auth.expect_is_authenticated().return_const(true);
    auth.expect_access_token()
        .times(1)
        .returning(|| Err(StreamError::AuthenticationFailed("token expired".to_string())));

    let client = client_with(auth);
    let result = client.connect().await;

    assert!(matches!(result, Err(StreamError::AuthenticationFailed(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[monoio::test(enable_timer = true)]
async fn test_subscribe_checks_session_first() {
    let mut auth = MockAuth::new();
    auth.expect_is_authenticated().return_const(false);
    auth.expect_http_client().never();

    let client = client_with(auth);
    let result = client.subscribe_prices(&["21"]).await;

    assert!(matches!(result, Err(StreamError::NotAuthenticated)));
}

#[monoio::test(enable_timer = true)]
#[serial]
async fn test_token_is_fetched_per_request() {
    let server = MockServer::start().unwrap();
    let mut auth = MockAuth::new();
    auth.expect_is_authenticated().return_const(true);
    auth.expect_access_token()
        .times(2)
        .returning(|| Ok("rotating-token".to_string()));
    auth.expect_http_client()
        .times(1)
        .returning(|| Ok(MonoioHttpClient::new()));

    let auth: Arc<dyn AuthProvider> = Arc::new(auth);
    let client = StreamingClient::new(test_config(&server), auth).unwrap();
    client.connect().await.unwrap();
    client.subscribe_prices(&["21"]).await.unwrap();

    let posts = server.subscription_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].authorization.as_deref(), Some("Bearer rotating-token"));

    client.close().await.unwrap();
}
