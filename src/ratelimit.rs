//! Rate-limit enforcement with fixed-window counters in the shared store.
//!
//! Each configured cap maps to one window; a request increments every
//! window's counter and is rejected as soon as one is over its cap. Counters
//! are keyed like cache entries (`sx:rl:<window>:<path>:<values...>`), so all
//! gateway instances sharing the store share the budget. Store failures fail
//! open: the request proceeds.

use crate::cache::{make_key, CacheClient};
use crate::config::RateLimit;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
struct Window {
    name: &'static str,
    length: Duration,
    cap: u64,
}

fn windows(policy: &RateLimit) -> Vec<Window> {
    let caps = [
        ("second", Duration::from_secs(1), policy.per_second),
        ("minute", Duration::from_secs(60), policy.per_minute),
        ("hour", Duration::from_secs(3_600), policy.per_hour),
        ("day", Duration::from_secs(86_400), policy.per_day),
    ];
    caps.into_iter()
        .filter_map(|(name, length, cap)| {
            cap.filter(|c| *c > 0).map(|cap| Window { name, length, cap })
        })
        .collect()
}

/// Returns false when any configured window is exhausted.
pub async fn check(
    cache: &CacheClient,
    policy: &RateLimit,
    path: &str,
    values: &[String],
) -> bool {
    for window in windows(policy) {
        let key = make_key(&format!("rl:{}", window.name), path, values);
        if let Some(count) = cache.incr_window(&key, window.length).await {
            if count as u64 > window.cap {
                debug!(window = window.name, count, cap = window.cap, "rate limit exceeded");
                return false;
            }
        }
    }
    true
}
