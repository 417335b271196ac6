//! Unified logging integration
//!
//! tracing is the front end everywhere. By default a `tracing-subscriber`
//! fmt subscriber is installed; with the `ftlog` feature the records are
//! forwarded through the `log` facade into ftlog's buffered writer instead.

use std::sync::Once;
#[cfg(not(feature = "ftlog"))]
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

/// Initialize the logging backend. Safe to call more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        #[cfg(feature = "ftlog")]
        {
            init_ftlog();
        }

        #[cfg(not(feature = "ftlog"))]
        {
            init_tracing();
        }
    });
}

#[cfg(feature = "ftlog")]
fn init_ftlog() {
    let built = ftlog::builder()
        .max_log_level(ftlog::LevelFilter::Debug)
        .bounded(100_000, false)
        .utc()
        .try_init();

    match built {
        Ok(guard) => {
            // The guard flushes on drop; the logger lives for the whole process.
            std::mem::forget(guard);
            tracing::info!("📝 Initialized ftlog logging");
        }
        Err(e) => eprintln!("ftlog initialization failed: {e}"),
    }
}

#[cfg(not(feature = "ftlog"))]
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    // A test harness or host application may already own the global subscriber.
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!("📝 Initialized tracing logging");
    }
}
