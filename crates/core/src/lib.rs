//! # Streamwire Core
//!
//! Runtime and support primitives shared by the streaming client.
//!
//! ## Architecture Principles
//!
//! 1. **Single-threaded async with monoio** - every worker is a local task
//! 2. **Nanosecond timing** - timestamps for liveness tracking and latency logs
//! 3. **Cooperative cancellation** - one token per connection attempt
//! 4. **Unified logging** - tracing with an optional ftlog backend
//! 5. **Readable ids** - context ids and `<type>-<YYYYMMDD-HHMMSS>` reference ids

pub mod cancel;
pub mod id_gen;
pub mod logging;
pub mod runtime;
pub mod timing;

// Re-export commonly used items
pub use cancel::CancellationToken;
pub use id_gen::{generate_context_id, mint_reference_id, reference_id_prefix};
pub use logging::init_logging;
pub use runtime::StreamRuntime;
pub use timing::{PerfTimer, Timestamp, nanos};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::id_gen::{generate_context_id, mint_reference_id, reference_id_prefix};
    pub use crate::logging::init_logging;
    pub use crate::runtime::{RuntimeConfig, StreamRuntime};
    pub use crate::timing::{PerfTimer, Timestamp, nanos};

    // Common external types
    pub use chrono::{DateTime, Utc};
    pub use monoio;
    pub use serde::{Deserialize, Serialize};
}
