use crate::types::Value;
use std::time::Duration;

/// A stored value plus its remaining time to live.
///
/// TTLs are relative durations against the server's logical clock, not
/// absolute deadlines: they only shrink when the clock is advanced with
/// `fast_forward`, which makes expiry fully deterministic in tests.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    /// Remaining lifetime. None means the key never expires.
    pub ttl: Option<Duration>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Entry { value, ttl: None }
    }

    pub fn with_ttl(value: Value, ttl: Duration) -> Self {
        Entry {
            value,
            ttl: Some(ttl),
        }
    }

    /// An entry whose TTL has been driven to zero is dead and must be
    /// removed before it is observed.
    pub fn is_expired(&self) -> bool {
        self.ttl.is_some_and(|d| d.is_zero())
    }
}
