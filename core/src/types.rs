//! Shared primitive types used across the settlement core.

use chrono::{DateTime, Utc};

/// Identifier of a song request.
pub type RequestId = String;

/// Identifier of a wallet or earnings account. Requesters and DJs share
/// one namespace; an account's role comes from the request it appears on.
pub type AccountId = String;

/// Money in integer minor currency units (cents). Never a float.
pub type MinorUnits = i64;

/// Wall-clock instant, always millisecond precision (see `clock`).
pub type Timestamp = DateTime<Utc>;

/// Encode a timestamp for storage.
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Decode a stored timestamp. Out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> Timestamp {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
