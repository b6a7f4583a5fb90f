// Per-connector admission control.
//
// Sliding window log keyed by connector id. Admission and recording happen under
// the DashMap entry lock, so concurrent callers can never both take the last slot.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{ConnectorError, Result};

/// Rate-limit settings stored on a connector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Requests admitted per window.
    pub requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

fn default_enabled() -> bool {
    true
}

impl RateLimitConfig {
    pub fn new(requests: u32, window_ms: u64) -> Self {
        Self {
            enabled: true,
            requests,
            window_ms,
        }
    }

    /// Rejects settings that could never admit a call.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.requests == 0 {
            return Err(ConnectorError::Validation(
                "rateLimit.requests must be at least 1".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(ConnectorError::Validation(
                "rateLimit.windowMs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Admission timestamps inside the trailing window for one connector.
struct Window {
    admitted: VecDeque<Instant>,
}

impl Window {
    fn new() -> Self {
        Self {
            admitted: VecDeque::new(),
        }
    }

    /// Admits and records one request, or returns the wait until a slot frees up.
    fn try_admit(&mut self, now: Instant, limit: &RateLimitConfig) -> std::result::Result<(), Duration> {
        let window = limit.window();
        while let Some(oldest) = self.admitted.front() {
            if now.duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() < limit.requests as usize {
            self.admitted.push_back(now);
            return Ok(());
        }

        // Full: the oldest entry is the next one to leave the window
        // A non-zero wait, so callers never retry in a tight loop
        let oldest = self.admitted.front().copied().unwrap_or(now);
        Err((oldest + window)
            .saturating_duration_since(now)
            .max(Duration::from_millis(1)))
    }
}

/// Per-connector sliding-window rate limiter.
///
/// Windows are created lazily on first request. State is in-memory only
/// (resets on restart).
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Admits one call for `key`, recording it in the window.
    ///
    /// With no settings, or settings disabled, admission is unconditional.
    /// A denied call returns `RateLimitExceeded` carrying the time until a slot
    /// frees up.
    pub fn acquire(&self, key: &str, limit: Option<&RateLimitConfig>) -> Result<()> {
        self.acquire_at(key, limit, Instant::now())
    }

    pub(crate) fn acquire_at(
        &self,
        key: &str,
        limit: Option<&RateLimitConfig>,
        now: Instant,
    ) -> Result<()> {
        let limit = match limit {
            Some(limit) if limit.enabled => limit,
            _ => return Ok(()),
        };

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(Window::new);

        window.try_admit(now, limit).map_err(|wait| {
            tracing::debug!(connector_id = %key, retry_after_ms = wait.as_millis() as u64, "Rate limit exceeded");
            ConnectorError::RateLimitExceeded {
                retry_after_ms: wait.as_millis() as u64,
            }
        })
    }

    /// Forgets the window for `key` (connector deleted or re-configured).
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Number of calls currently counted in the window for `key`.
    pub fn in_window(&self, key: &str) -> usize {
        self.windows
            .get(key)
            .map(|w| w.admitted.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourth_call_rejected_within_window() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(3, 1000);
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter
                .acquire_at("c1", Some(&limit), start + Duration::from_millis(i * 10))
                .is_ok());
        }

        let err = limiter
            .acquire_at("c1", Some(&limit), start + Duration::from_millis(100))
            .unwrap_err();
        match err {
            ConnectorError::RateLimitExceeded { retry_after_ms } => {
                // Oldest call at t=0 leaves the window at t=1000
                assert_eq!(retry_after_ms, 900);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_zero_request_limit_fails_validation() {
        assert!(RateLimitConfig::new(0, 1000).validate().is_err());
        assert!(RateLimitConfig::new(5, 0).validate().is_err());
        assert!(RateLimitConfig::new(5, 1000).validate().is_ok());

        let mut off = RateLimitConfig::new(0, 0);
        off.enabled = false;
        assert!(off.validate().is_ok());
    }

    #[test]
    fn test_denied_wait_is_never_zero() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        match limiter.acquire_at("c1", Some(&RateLimitConfig::new(0, 1000)), start) {
            Err(ConnectorError::RateLimitExceeded { retry_after_ms }) => {
                assert_eq!(retry_after_ms, 1000)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        match limiter.acquire_at("c2", Some(&RateLimitConfig::new(0, 0)), start) {
            Err(ConnectorError::RateLimitExceeded { retry_after_ms }) => {
                assert!(retry_after_ms >= 1)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_admitted_again_after_window() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(3, 1000);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire_at("c1", Some(&limit), start).unwrap();
        }
        assert!(limiter.acquire_at("c1", Some(&limit), start).is_err());

        let later = start + Duration::from_millis(1001);
        assert!(limiter.acquire_at("c1", Some(&limit), later).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(2, 1000);
        let start = Instant::now();

        limiter.acquire_at("c1", Some(&limit), start).unwrap();
        limiter
            .acquire_at("c1", Some(&limit), start + Duration::from_millis(600))
            .unwrap();

        // t=1100: the t=0 call has left, the t=600 call has not
        let t = start + Duration::from_millis(1100);
        assert!(limiter.acquire_at("c1", Some(&limit), t).is_ok());
        assert!(limiter.acquire_at("c1", Some(&limit), t).is_err());
    }

    #[test]
    fn test_rejected_calls_are_not_recorded() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(1, 1000);
        let start = Instant::now();

        limiter.acquire_at("c1", Some(&limit), start).unwrap();
        for _ in 0..5 {
            assert!(limiter.acquire_at("c1", Some(&limit), start).is_err());
        }
        assert_eq!(limiter.in_window("c1"), 1);
    }

    #[test]
    fn test_separate_windows_per_connector() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(1, 1000);

        assert!(limiter.acquire("c1", Some(&limit)).is_ok());
        assert!(limiter.acquire("c1", Some(&limit)).is_err());
        assert!(limiter.acquire("c2", Some(&limit)).is_ok());
    }

    #[test]
    fn test_disabled_or_missing_is_unconditional() {
        let limiter = RateLimiter::new();
        let mut limit = RateLimitConfig::new(1, 60_000);
        limit.enabled = false;

        for _ in 0..100 {
            assert!(limiter.acquire("c1", Some(&limit)).is_ok());
            assert!(limiter.acquire("c2", None).is_ok());
        }
        assert_eq!(limiter.in_window("c1"), 0);
    }

    #[test]
    fn test_reset_clears_window() {
        let limiter = RateLimiter::new();
        let limit = RateLimitConfig::new(1, 60_000);

        limiter.acquire("c1", Some(&limit)).unwrap();
        assert!(limiter.acquire("c1", Some(&limit)).is_err());

        limiter.reset("c1");
        assert!(limiter.acquire("c1", Some(&limit)).is_ok());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new());
        let admitted = Arc::new(AtomicUsize::new(0));
        let limit = RateLimitConfig::new(25, 60_000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                let limit = limit.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        if limiter.acquire("shared", Some(&limit)).is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 25);
    }
}
