/// Small helpers shared by the cache, the supervisor and the pool.
///
/// IMPORTANT:
/// - No transport-specific logic should live here.
/// - This module must remain lightweight and deterministic.
///

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Used for:
/// - Cache expiry timestamps (persisted as `expires`)
/// - Expiry checks on read
///
/// A clock before UNIX_EPOCH is reported as 0 rather than panicking.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Converts a duration into whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Removes duplicate node ids while keeping first-seen order.
///
/// Examples:
/// - ["a", "b", "a"] -> ["a", "b"]
/// - []              -> []
pub fn dedupe_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_seen_order() {
        let ids: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dedupe_ids(&ids), vec!["b", "a", "c"]);
    }

    #[test]
    fn duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), i64::MAX);
    }
}
