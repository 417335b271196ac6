//! Static bearer-token authentication

use crate::errors::{Result, StreamError};
use crate::http::MonoioHttpClient;
use crate::traits::AuthProvider;
use async_trait::async_trait;
use std::sync::RwLock;
use tracing::info;

/// Auth provider backed by a pre-issued access token
pub struct StaticTokenAuth {
    token: RwLock<Option<String>>,
    http: MonoioHttpClient,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            http: MonoioHttpClient::new(),
        }
    }

    /// Load the token from `STREAMWIRE_ACCESS_TOKEN` (or `.env`)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let token = std::env::var("STREAMWIRE_ACCESS_TOKEN").map_err(|_| {
            StreamError::ConfigurationError("STREAMWIRE_ACCESS_TOKEN is not set".to_string())
        })?;
        info!("🔑 Loaded access token from environment");
        Ok(Self::new(token))
    }

    /// Swap in a refreshed token
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token.into());
    }

    /// Drop the token; the provider reports unauthenticated afterwards
    pub fn revoke(&self) {
        let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    fn current(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|token| !token.is_empty())
    }
}

#[async_trait(?Send)]
impl AuthProvider for StaticTokenAuth {
    fn is_authenticated(&self) -> bool {
        self.current().is_some()
    }

    async fn access_token(&self) -> Result<String> {
        self.current().ok_or(StreamError::NotAuthenticated)
    }

    fn http_client(&self) -> Result<MonoioHttpClient> {
        Ok(self.http.clone())
    }
}
