//! Advisory request throttle.
//!
//! Every (identifier, context) key owns two counters, a short window and a
//! long window. A counter is created by the first request it counts and
//! disappears once its window length has elapsed, so the count can never
//! outlive the window.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    expires_at: Instant,
}

impl Counter {
    fn live_count(counter: Option<&Counter>, now: Instant) -> u32 {
        match counter {
            Some(c) if c.expires_at > now => c.count,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    limit: u32,
    length: Duration,
}

/// Snapshot of one window for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window_secs: u64,
    /// Seconds until the counter resets; zero when no counter is live
    pub resets_in_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub bypassed: bool,
    pub short: WindowStatus,
    pub long: WindowStatus,
}

#[derive(Debug, Default)]
struct Counters {
    short: HashMap<String, Counter>,
    long: HashMap<String, Counter>,
}

pub struct RateLimiter {
    short: Window,
    long: Window,
    bypass: bool,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            short: Window {
                limit: config.short_limit,
                length: Duration::from_secs(config.short_window_secs),
            },
            long: Window {
                limit: config.long_limit,
                length: Duration::from_secs(config.long_window_secs),
            },
            bypass: config.bypass,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// A limiter that admits everything
    pub fn disabled() -> Self {
        Self::new(&RateLimitConfig {
            bypass: true,
            ..Default::default()
        })
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Admit the call and count it, or refuse it without counting.
    pub fn is_allowed(&self, identifier: &str, context: &str) -> bool {
        self.is_allowed_at(identifier, context, Instant::now())
    }

    pub fn is_allowed_at(&self, identifier: &str, context: &str, now: Instant) -> bool {
        if self.bypass {
            return true;
        }

        let key = key(identifier, context);
        let mut counters = self.lock();

        let short_count = Counter::live_count(counters.short.get(&key), now);
        let long_count = Counter::live_count(counters.long.get(&key), now);

        if short_count >= self.short.limit || long_count >= self.long.limit {
            tracing::warn!(
                identifier,
                context,
                short_count,
                short_limit = self.short.limit,
                long_count,
                long_limit = self.long.limit,
                "Rate limit exceeded"
            );
            return false;
        }

        increment(&mut counters.short, &key, self.short.length, now);
        increment(&mut counters.long, &key, self.long.length, now);
        true
    }

    pub fn get_status(&self, identifier: &str, context: &str) -> RateLimitStatus {
        self.get_status_at(identifier, context, Instant::now())
    }

    pub fn get_status_at(&self, identifier: &str, context: &str, now: Instant) -> RateLimitStatus {
        let key = key(identifier, context);
        let counters = self.lock();

        RateLimitStatus {
            bypassed: self.bypass,
            short: window_status(self.short, counters.short.get(&key), now),
            long: window_status(self.long, counters.long.get(&key), now),
        }
    }

    pub fn reset(&self, identifier: &str, context: &str) {
        let key = key(identifier, context);
        let mut counters = self.lock();
        counters.short.remove(&key);
        counters.long.remove(&key);
        tracing::debug!(identifier, context, "Rate limit counters reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        // A poisoned lock only means another caller panicked mid-update;
        // the counters themselves are still usable.
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key(identifier: &str, context: &str) -> String {
    format!("{}:{}", context, identifier)
}

fn increment(map: &mut HashMap<String, Counter>, key: &str, length: Duration, now: Instant) {
    map.retain(|_, c| c.expires_at > now);
    map.entry(key.to_string())
        .and_modify(|c| c.count = c.count.saturating_add(1))
        .or_insert(Counter {
            count: 1,
            expires_at: now + length,
        });
}

fn window_status(window: Window, counter: Option<&Counter>, now: Instant) -> WindowStatus {
    let count = Counter::live_count(counter, now);
    let resets_in_secs = match counter {
        Some(c) if c.expires_at > now => (c.expires_at - now).as_secs(),
        _ => 0,
    };

    WindowStatus {
        count,
        limit: window.limit,
        remaining: window.limit.saturating_sub(count),
        window_secs: window.length.as_secs(),
        resets_in_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(short_limit: u32, long_limit: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            bypass: false,
            short_limit,
            short_window_secs: 60,
            long_limit,
            long_window_secs: 3600,
        })
    }

    #[test]
    fn test_limit_of_two_per_minute() {
        let limiter = limiter(2, 1000);
        let now = Instant::now();

        assert!(limiter.is_allowed_at("user", "api", now));
        assert!(limiter.is_allowed_at("user", "api", now + Duration::from_secs(1)));
        assert!(!limiter.is_allowed_at("user", "api", now + Duration::from_secs(2)));
    }

    #[test]
    fn test_rejected_call_is_not_counted() {
        let limiter = limiter(1, 1000);
        let now = Instant::now();

        assert!(limiter.is_allowed_at("user", "api", now));
        assert!(!limiter.is_allowed_at("user", "api", now));
        assert!(!limiter.is_allowed_at("user", "api", now));

        let status = limiter.get_status_at("user", "api", now);
        assert_eq!(status.short.count, 1);
        assert_eq!(status.long.count, 1);
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        let limiter = limiter(3, 1000);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.is_allowed_at("user", "api", now));
        }
        assert!(!limiter.is_allowed_at("user", "api", now + Duration::from_secs(59)));
        assert!(limiter.is_allowed_at("user", "api", now + Duration::from_secs(61)));

        let status = limiter.get_status_at("user", "api", now + Duration::from_secs(61));
        assert_eq!(status.short.count, 1);
        assert_eq!(status.long.count, 4);
    }

    #[test]
    fn test_long_window_applies_independently() {
        let limiter = limiter(100, 2);
        let now = Instant::now();

        assert!(limiter.is_allowed_at("user", "api", now));
        assert!(limiter.is_allowed_at("user", "api", now + Duration::from_secs(120)));
        // Short window has reset, long window has not
        assert!(!limiter.is_allowed_at("user", "api", now + Duration::from_secs(240)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 1000);
        let now = Instant::now();

        assert!(limiter.is_allowed_at("alice", "api", now));
        assert!(limiter.is_allowed_at("bob", "api", now));
        assert!(limiter.is_allowed_at("alice", "images", now));
        assert!(!limiter.is_allowed_at("alice", "api", now));
    }

    #[test]
    fn test_status_and_reset() {
        let limiter = limiter(5, 1000);
        let now = Instant::now();
        limiter.is_allowed_at("user", "api", now);
        limiter.is_allowed_at("user", "api", now);

        let status = limiter.get_status_at("user", "api", now + Duration::from_secs(10));
        assert_eq!(status.short.count, 2);
        assert_eq!(status.short.remaining, 3);
        assert_eq!(status.short.resets_in_secs, 50);
        assert_eq!(status.long.remaining, 998);

        limiter.reset("user", "api");
        let status = limiter.get_status_at("user", "api", now);
        assert_eq!(status.short.count, 0);
        assert_eq!(status.short.resets_in_secs, 0);
    }

    #[test]
    fn test_bypass_admits_everything() {
        assert!(!limiter(5, 1000).is_bypassed());

        let limiter = RateLimiter::disabled();
        assert!(limiter.is_bypassed());
        let now = Instant::now();
        for _ in 0..10_000 {
            assert!(limiter.is_allowed_at("user", "api", now));
        }
        assert!(limiter.get_status("user", "api").bypassed);
        assert_eq!(limiter.get_status("user", "api").short.count, 0);
    }
}
