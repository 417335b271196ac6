//! Cooperative cancellation
//!
//! One token is created per connection attempt and cloned into every worker
//! tied to that connection. Cancelling drops the only sender of an internal
//! flume channel, which wakes every pending `cancelled()` future at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<flume::Sender<()>>>,
}

/// Shared cancellation signal
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
    signal: flume::Receiver<()>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
            }),
            signal: rx,
        }
    }

    /// Signal cancellation. Calling it again is a no-op.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = match self.inner.trigger.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    /// Whether `cancel` has been called on this token or any clone
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Nothing is ever sent; the receive only completes once the sender is dropped.
        let _ = self.signal.recv_async().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
