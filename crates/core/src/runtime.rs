//! monoio runtime bootstrap
//!
//! The streaming pipeline relies on timers (read deadlines, backoff, health
//! checks), so every runtime built here has the timer driver enabled.

use monoio::{FusionDriver, RuntimeBuilder};
use tracing::info;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Thread name, used in log lines
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "streamwire-main".to_string(),
        }
    }
}

/// Thin wrapper around a timer-enabled monoio runtime.
///
/// `FusionDriver` picks io_uring where the kernel supports it and falls back
/// to the epoll based legacy driver otherwise.
pub struct StreamRuntime {
    config: RuntimeConfig,
}

impl StreamRuntime {
    /// Create a runtime with default configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        info!("🚀 Stream runtime initialized");
        info!("   Thread: {}", config.thread_name);
        Self { config }
    }

    /// Run a future to completion on a fresh runtime
    pub fn block_on<F>(&self, future: F) -> std::io::Result<F::Output>
    where
        F: std::future::Future,
    {
        let mut runtime = RuntimeBuilder::<FusionDriver>::new()
            .enable_timer()
            .build()?;
        Ok(runtime.block_on(future))
    }

    /// Get runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl Default for StreamRuntime {
    fn default() -> Self {
        Self::new()
    }
}
