//! Wall-clock helpers
//!
//! Timestamps shared between processes (health check times, document
//! `updated_at`) are unix epoch seconds as `f64`, which is the format the
//! runtime state document has always carried.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds, with sub-second precision.
pub fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_are_past_2020() {
        // 2020-01-01T00:00:00Z
        assert!(unix_seconds() > 1_577_836_800.0);
    }
}
