//! Precision timestamping
//!
//! Nanosecond wall-clock timestamps used for subscription liveness tracking
//! and latency logging of connection and subscription calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// High-precision timestamp type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds since Unix epoch
    pub nanos: u64,
}

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create a timestamp from the current time
    pub fn now() -> Self {
        Self { nanos: nanos() }
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.nanos / 1_000_000_000;
        let nsecs = (self.nanos % 1_000_000_000) as u32;
        DateTime::from_timestamp(secs as i64, nsecs).unwrap_or_else(Utc::now)
    }

    /// Time elapsed between this timestamp and `later`, zero if `later` is earlier
    pub fn duration_until(&self, later: Timestamp) -> Duration {
        Duration::from_nanos(later.nanos.saturating_sub(self.nanos))
    }

    /// Get elapsed time since this timestamp
    pub fn elapsed(&self) -> Duration {
        self.duration_until(Timestamp::now())
    }

    /// Get elapsed time since this timestamp in milliseconds
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// Shift the timestamp into the past, saturating at the epoch
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self {
            nanos: self.nanos.saturating_sub(duration.as_nanos() as u64),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        let nanos = dt.timestamp() as u64 * 1_000_000_000 + dt.timestamp_subsec_nanos() as u64;
        Self { nanos }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.9f UTC"))
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch
#[inline]
pub fn nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Scoped latency measurement, logged at debug level
pub struct PerfTimer {
    start: Timestamp,
    name: String,
}

impl PerfTimer {
    /// Start a new performance timer
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Timestamp::now(),
            name: name.into(),
        }
    }

    /// Get elapsed time in microseconds
    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Log the elapsed time
    pub fn log_elapsed(&self) {
        let micros = self.elapsed_micros();
        if micros < 1000 {
            tracing::debug!("⏱️  {} took {}μs", self.name, micros);
        } else {
            tracing::debug!("⏱️  {} took {:.3}ms", self.name, micros as f64 / 1000.0);
        }
    }
}
