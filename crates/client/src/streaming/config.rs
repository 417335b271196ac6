//! Streaming client configuration

use crate::errors::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Streaming client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Base URL for subscription POST/DELETE requests
    pub rest_base_url: String,
    /// Base URL of the streaming socket (`https://` or `http://`)
    pub streaming_base_url: String,
    pub refresh_rate_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub processor_queue_capacity: usize,
    pub topic_channel_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_cooldown_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub subscription_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub reset_cooldown_ms: u64,
    pub resubscribe_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://gateway.saxobank.com/sim/openapi".to_string(),
            streaming_base_url: "https://streaming.saxobank.com/sim/openapi/streamingws".to_string(),
            refresh_rate_ms: 1000,
            heartbeat_interval_ms: 30_000,
            read_timeout_ms: 35_000,
            processor_queue_capacity: 1024,
            topic_channel_capacity: 1024,
            enqueue_timeout_ms: 50,
            reconnect_base_delay_ms: 2000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            reconnect_cooldown_ms: 1000,
            shutdown_timeout_ms: 5000,
            subscription_timeout_ms: 90_000,
            health_check_interval_ms: 15_000,
            reset_cooldown_ms: 30_000,
            resubscribe_delay_ms: 100,
        }
    }
}

impl StreamingConfig {
    /// Defaults overridden by `STREAMWIRE_REST_URL` / `STREAMWIRE_STREAMING_URL`.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Ok(url) = std::env::var("STREAMWIRE_REST_URL") {
            config.rest_base_url = url;
        }
        if let Ok(url) = std::env::var("STREAMWIRE_STREAMING_URL") {
            config.streaming_base_url = url;
        }
        config
    }

    pub fn with_rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.rest_base_url = url.into();
        self
    }

    pub fn with_streaming_base_url(mut self, url: impl Into<String>) -> Self {
        self.streaming_base_url = url.into();
        self
    }

    pub fn with_refresh_rate(mut self, millis: u64) -> Self {
        self.refresh_rate_ms = millis;
        self
    }

    /// Set the expected heartbeat interval; the read deadline follows at +5s
    pub fn with_heartbeat_interval(mut self, millis: u64) -> Self {
        self.heartbeat_interval_ms = millis;
        self.read_timeout_ms = millis + 5000;
        self
    }

    pub fn with_read_timeout(mut self, millis: u64) -> Self {
        self.read_timeout_ms = millis;
        self
    }

    pub fn with_queue_capacities(mut self, processor: usize, topic: usize) -> Self {
        self.processor_queue_capacity = processor;
        self.topic_channel_capacity = topic;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64, max_attempts: u32) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_reconnect_cooldown(mut self, millis: u64) -> Self {
        self.reconnect_cooldown_ms = millis;
        self
    }

    pub fn with_shutdown_timeout(mut self, millis: u64) -> Self {
        self.shutdown_timeout_ms = millis;
        self
    }

    pub fn with_health_check(mut self, interval_ms: u64, silence_timeout_ms: u64) -> Self {
        self.health_check_interval_ms = interval_ms;
        self.subscription_timeout_ms = silence_timeout_ms;
        self
    }

    pub fn with_reset_cooldown(mut self, millis: u64) -> Self {
        self.reset_cooldown_ms = millis;
        self
    }

    pub fn with_resubscribe_delay(mut self, millis: u64) -> Self {
        self.resubscribe_delay_ms = millis;
        self
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("rest_base_url", &self.rest_base_url),
            ("streaming_base_url", &self.streaming_base_url),
        ] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(StreamError::ConfigurationError(format!(
                    "{name} must start with https:// or http://, got {url}"
                )));
            }
        }
        if self.processor_queue_capacity == 0 || self.topic_channel_capacity == 0 {
            return Err(StreamError::ConfigurationError(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(StreamError::ConfigurationError(
                "reconnect_max_delay_ms is below reconnect_base_delay_ms".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(StreamError::ConfigurationError(
                "health_check_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reset_cooldown(&self) -> Duration {
        Duration::from_millis(self.reset_cooldown_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}
