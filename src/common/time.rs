use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since UNIX_EPOCH.
///
/// Returns 0 if the system clock is set before the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Adds a duration to a millisecond timestamp without overflowing.
pub fn add_ms(ts_ms: u64, delay: Duration) -> u64 {
    ts_ms.saturating_add(delay.as_millis().min(u64::MAX as u128) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn add_ms_saturates() {
        assert_eq!(add_ms(10, Duration::from_millis(5)), 15);
        assert_eq!(add_ms(u64::MAX - 1, Duration::from_secs(1)), u64::MAX);
    }
}
