//! Collaborator interfaces consumed by the streaming client

use crate::errors::Result;
use crate::http::MonoioHttpClient;
use async_trait::async_trait;

/// Source of bearer tokens and authenticated HTTP clients.
///
/// Token persistence and the OAuth flow live behind this trait; the
/// streaming client only asks whether a session exists and for the current
/// token. The client in turn publishes connection state and context ids (see
/// `ConnectionManager::auth_notifications`) so an implementation can time its
/// early token refresh against socket liveness.
#[async_trait(?Send)]
pub trait AuthProvider: Send + Sync {
    /// Whether a usable session exists right now
    fn is_authenticated(&self) -> bool;

    /// Current bearer token
    async fn access_token(&self) -> Result<String>;

    /// HTTP client for subscription requests
    fn http_client(&self) -> Result<MonoioHttpClient>;
}
