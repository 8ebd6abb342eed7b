//! Server-wide fixed-window rate limiter.
//!
//! A single counter covers all peers; non-overlapping windows of fixed
//! length reset it. Whitelisted addresses bypass the limiter before the
//! counter is touched. Check-then-increment happens under one lock so the
//! decision is atomic across connection workers.

use crate::config::RateLimitConfig;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) enum RateDecision {
    Allow,
    /// Rejected; `retry_after` is whole seconds until the window ends.
    Reject { retry_after: u64 },
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug)]
pub(crate) struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window: Duration,
    whitelist: HashSet<IpAddr>,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub(crate) fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            window: Duration::from_secs(config.window_seconds),
            whitelist: config.whitelist.iter().copied().collect(),
            state: Mutex::new(Window {
                count: 0,
                started: Instant::now(),
            }),
        }
    }

    pub(crate) fn check(&self, peer: Option<IpAddr>) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allow;
        }
        if let Some(ip) = peer {
            if self.whitelist.contains(&ip) {
                return RateDecision::Allow;
            }
        }

        let mut window = self.state.lock().unwrap();
        let elapsed = window.started.elapsed();
        if elapsed >= self.window {
            window.count = 0;
            window.started = Instant::now();
        }

        if window.count < self.max_requests {
            window.count += 1;
            RateDecision::Allow
        } else {
            let remaining = self.window.saturating_sub(window.started.elapsed());
            RateDecision::Reject {
                retry_after: remaining.as_secs().max(1),
            }
        }
    }
}

#[cfg(test)]
mod limiter_tests {
    use super::*;

    fn limiter(max_requests: u32, window_seconds: u64, whitelist: Vec<IpAddr>) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            max_requests,
            window_seconds,
            whitelist,
        })
    }

    #[test]
    fn counts_within_window() {
        let limiter = limiter(3, 60, Vec::new());
        let peer = Some("10.0.0.1".parse().unwrap());

        for _ in 0..3 {
            assert!(matches!(limiter.check(peer), RateDecision::Allow));
        }
        match limiter.check(peer) {
            RateDecision::Reject { retry_after } => assert!(retry_after <= 60),
            RateDecision::Allow => panic!("fourth request must be rejected"),
        }
    }

    #[test]
    fn counter_is_server_wide() {
        let limiter = limiter(2, 60, Vec::new());
        let a = Some("10.0.0.1".parse().unwrap());
        let b = Some("10.0.0.2".parse().unwrap());

        assert!(matches!(limiter.check(a), RateDecision::Allow));
        assert!(matches!(limiter.check(b), RateDecision::Allow));
        // a different peer still trips the shared counter
        assert!(matches!(limiter.check(a), RateDecision::Reject { .. }));
    }

    #[test]
    fn whitelist_bypasses() {
        let vip: IpAddr = "192.168.1.9".parse().unwrap();
        let limiter = limiter(1, 60, vec![vip]);
        let other = Some("10.0.0.1".parse().unwrap());

        assert!(matches!(limiter.check(other), RateDecision::Allow));
        assert!(matches!(limiter.check(other), RateDecision::Reject { .. }));
        for _ in 0..10 {
            assert!(matches!(limiter.check(Some(vip)), RateDecision::Allow));
        }
    }

    #[test]
    fn window_reset() {
        let limiter = limiter(1, 1, Vec::new());
        let peer = Some("10.0.0.1".parse().unwrap());

        assert!(matches!(limiter.check(peer), RateDecision::Allow));
        assert!(matches!(limiter.check(peer), RateDecision::Reject { .. }));

        limiter.state.lock().unwrap().started = Instant::now() - Duration::from_secs(2);
        assert!(matches!(limiter.check(peer), RateDecision::Allow));
    }

    #[test]
    fn disabled_allows_everything() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            max_requests: 1,
            window_seconds: 60,
            whitelist: Vec::new(),
        });
        for _ in 0..100 {
            assert!(matches!(limiter.check(None), RateDecision::Allow));
        }
    }
}
