//! Wall-clock helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as unix milliseconds.
///
/// Timestamps across the session core (token mint time, cache staleness,
/// broadcast ordering) are absolute unix milliseconds so they compare
/// across independent contexts.
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
    fn now_millis_is_past_2024() {
        // 2024-01-01T00:00:00Z
        assert!(now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn now_millis_does_not_go_backwards() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
