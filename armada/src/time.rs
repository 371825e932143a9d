//! Time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
///
/// Timestamps cross the wire and are compared between nodes, so wall-clock
/// millis are used rather than process-local instants.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        // Sanity: after 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }
}
