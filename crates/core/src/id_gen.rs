//! Identifier minting
//!
//! Two kinds of ids flow through the streaming protocol:
//!
//! - **context ids** name one streaming session and must be fresh for every
//!   connect attempt. Only `[A-Za-z0-9-]` is accepted by the server.
//! - **reference ids** name a subscription and read as
//!   `<type>-<YYYYMMDD-HHMMSS>`. The type prefix is what routing keys on, so
//!   rotated ids must keep it.

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use std::time::{SystemTime, UNIX_EPOCH};

const CONTEXT_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

/// Timestamp layout embedded in reference ids
pub const REFERENCE_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Generate a context id for a new streaming session
pub fn generate_context_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("ctx-{millis}-{}", nanoid!(10, &CONTEXT_ALPHABET))
}

/// Mint a reference id `<prefix>-<YYYYMMDD-HHMMSS>` for the current time.
///
/// `is_taken` reports ids already held by active subscriptions; a numeric
/// suffix is appended until the id is free.
pub fn mint_reference_id(prefix: &str, is_taken: impl Fn(&str) -> bool) -> String {
    mint_reference_id_at(prefix, Utc::now(), is_taken)
}

/// Same as [`mint_reference_id`] with an explicit clock reading
pub fn mint_reference_id_at(
    prefix: &str,
    at: DateTime<Utc>,
    is_taken: impl Fn(&str) -> bool,
) -> String {
    let base = format!("{prefix}-{}", at.format(REFERENCE_TIME_FORMAT));
    if !is_taken(&base) {
        return base;
    }

    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !is_taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Type prefix of a reference id: everything before the first `-`
pub fn reference_id_prefix(reference_id: &str) -> &str {
    reference_id
        .split_once('-')
        .map(|(prefix, _)| prefix)
        .unwrap_or(reference_id)
}
