//! Reference implementations of the pre-flight policy chain
//! (`SPEC_FULL.md` §C, `tunnox_core::contracts::{IpPolicy, BruteForceGuard,
//! AnonymousRateLimiter}`). Fixed-window counters, grounded on the spec's
//! own numbers (§8 scenario 3: the sixth failure from one IP inside the
//! window is rejected) rather than a sliding-window or token-bucket scheme —
//! adequate for a reference deployment, not a claim that it's what a
//! high-traffic edge would run.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tunnox_common::time::timestamp_secs;

use tunnox_core::contracts::{AnonymousRateLimiter, BruteForceGuard, IpPolicy};

/// Allows every IP. A real deployment's allow/blacklist is expected to sit
/// in front of this crate entirely (spec §1 marks it out of scope); this
/// exists so the core can be exercised without one.
#[derive(Default)]
pub struct AllowAllIpPolicy;

#[async_trait]
impl IpPolicy for AllowAllIpPolicy {
    async fn is_allowed(&self, _ip: IpAddr) -> bool {
        true
    }
}

struct Window {
    failures: u32,
    window_started_at: i64,
}

/// Fixed-window brute-force guard: `max_failures` failures inside
/// `window_secs` blocks the IP until the window rolls over. A
/// `record_success` resets the window immediately rather than waiting for
/// it to expire, so a legitimate client that mistypes a secret once doesn't
/// stay flagged after authenticating correctly.
pub struct FixedWindowBruteForceGuard {
    max_failures: u32,
    window_secs: i64,
    windows: DashMap<IpAddr, Mutex<Window>>,
}

impl FixedWindowBruteForceGuard {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        FixedWindowBruteForceGuard {
            max_failures,
            window_secs: window.as_secs() as i64,
            windows: DashMap::new(),
        }
    }

    fn current_failures(&self, ip: IpAddr) -> u32 {
        let now = timestamp_secs();
        match self.windows.get(&ip) {
            Some(entry) => {
                let window = entry.lock();
                if now - window.window_started_at >= self.window_secs {
                    0
                } else {
                    window.failures
                }
            }
            None => 0,
        }
    }
}

#[async_trait]
impl BruteForceGuard for FixedWindowBruteForceGuard {
    async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.current_failures(ip) >= self.max_failures
    }

    async fn record_failure(&self, ip: IpAddr) {
        let now = timestamp_secs();
        let entry = self.windows.entry(ip).or_insert_with(|| {
            Mutex::new(Window {
                failures: 0,
                window_started_at: now,
            })
        });
        let mut window = entry.lock();
        if now - window.window_started_at >= self.window_secs {
            window.failures = 0;
            window.window_started_at = now;
        }
        window.failures += 1;
    }

    async fn record_success(&self, ip: IpAddr) {
        self.windows.remove(&ip);
    }
}

/// Fixed-window rate limiter for anonymous-bootstrap issuance, independent
/// of the brute-force guard (which only tracks failed credential checks).
pub struct FixedWindowAnonymousRateLimiter {
    max_per_window: u32,
    window_secs: i64,
    windows: DashMap<IpAddr, Mutex<Window>>,
}

impl FixedWindowAnonymousRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        FixedWindowAnonymousRateLimiter {
            max_per_window,
            window_secs: window.as_secs() as i64,
            windows: DashMap::new(),
        }
    }
}

#[async_trait]
impl AnonymousRateLimiter for FixedWindowAnonymousRateLimiter {
    async fn allow(&self, ip: IpAddr) -> bool {
        let now = timestamp_secs();
        let entry = self.windows.entry(ip).or_insert_with(|| {
            Mutex::new(Window {
                failures: 0,
                window_started_at: now,
            })
        });
        let mut window = entry.lock();
        if now - window.window_started_at >= self.window_secs {
            window.failures = 0;
            window.window_started_at = now;
        }
        if window.failures >= self.max_per_window {
            return false;
        }
        window.failures += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn allow_all_policy_always_allows() {
        assert!(AllowAllIpPolicy.is_allowed(ip()).await);
    }

    #[tokio::test]
    async fn brute_force_guard_blocks_after_max_failures() {
        let guard = FixedWindowBruteForceGuard::new(5, Duration::from_secs(900));
        for _ in 0..5 {
            guard.record_failure(ip()).await;
        }
        assert!(guard.is_blocked(ip()).await);
    }

    #[tokio::test]
    async fn brute_force_guard_allows_under_the_threshold() {
        let guard = FixedWindowBruteForceGuard::new(5, Duration::from_secs(900));
        for _ in 0..4 {
            guard.record_failure(ip()).await;
        }
        assert!(!guard.is_blocked(ip()).await);
    }

    #[tokio::test]
    async fn recorded_success_clears_the_block() {
        let guard = FixedWindowBruteForceGuard::new(5, Duration::from_secs(900));
        for _ in 0..5 {
            guard.record_failure(ip()).await;
        }
        guard.record_success(ip()).await;
        assert!(!guard.is_blocked(ip()).await);
    }

    #[tokio::test]
    async fn anonymous_rate_limiter_caps_issuance_per_window() {
        let limiter = FixedWindowAnonymousRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow(ip()).await);
        assert!(limiter.allow(ip()).await);
        assert!(!limiter.allow(ip()).await);
    }
}
