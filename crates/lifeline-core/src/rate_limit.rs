//! Sliding-window request limiter.
//!
//! Requests are counted per key (the daemon keys by client IP) over a
//! trailing window. Memory is bounded two ways: every `cleanup_interval`
//! requests idle keys are dropped, and the number of tracked keys is capped
//! at `max_tracked_keys`. A new key arriving at the cap forces a cleanup and
//! is rejected if that frees nothing.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limiter settings, loaded from the `[rate_limit]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Disables limiting entirely when `false`.
    pub enabled: bool,

    /// Requests allowed per key within the window.
    pub max_requests: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Run an idle-key sweep every this many requests.
    pub cleanup_interval: u64,

    /// Hard cap on distinct keys held in memory.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 120,
            window_secs: 60,
            cleanup_interval: 100,
            max_tracked_keys: 10_000,
        }
    }
}

/// Rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// The key used up its quota for the current window.
    #[error("rate limit exceeded for {key}: {limit} requests per {window_secs}s")]
    Exceeded {
        /// Offending key, rendered.
        key: String,
        /// Configured quota.
        limit: u32,
        /// Window length.
        window_secs: u64,
    },

    /// Too many distinct keys are being tracked to admit a new one.
    #[error("rate limiter is tracking the maximum of {max_tracked_keys} clients")]
    TooManyClients {
        /// Configured cap.
        max_tracked_keys: usize,
    },
}

/// Thread-safe sliding-window limiter keyed by `K`.
#[derive(Debug)]
pub struct RateLimiter<K> {
    config: RateLimitConfig,
    windows: RwLock<HashMap<K, Vec<Instant>>>,
    request_count: AtomicU64,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Creates a limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Records a request from `key` if it is within quota.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::Exceeded` when the key is over quota and
    /// `RateLimitError::TooManyClients` when a new key arrives at the cap.
    pub fn check(&self, key: &K) -> Result<(), RateLimitError> {
        self.check_at(key, Instant::now())
    }

    /// [`check`](Self::check) against an explicit instant.
    ///
    /// # Errors
    ///
    /// See [`check`](Self::check).
    pub fn check_at(&self, key: &K, now: Instant) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }

        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && self.config.cleanup_interval > 0 && count % self.config.cleanup_interval == 0
        {
            tracing::debug!(request_count = count, "running periodic rate limiter cleanup");
            self.cleanup_at(now);
        }

        let cutoff = now.checked_sub(self.window()).unwrap_or(now);

        let at_capacity = {
            let windows = self
                .windows
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            !windows.contains_key(key) && windows.len() >= self.config.max_tracked_keys
        };
        if at_capacity {
            tracing::debug!(
                max_tracked_keys = self.config.max_tracked_keys,
                "tracked key cap reached, forcing cleanup"
            );
            self.cleanup_at(now);
        }

        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Re-checked under the write lock: another thread may have added keys.
        if !windows.contains_key(key) && windows.len() >= self.config.max_tracked_keys {
            tracing::warn!(
                client = %key,
                tracked = windows.len(),
                "rejecting new client: tracked key cap reached"
            );
            return Err(RateLimitError::TooManyClients {
                max_tracked_keys: self.config.max_tracked_keys,
            });
        }

        let stamps = windows.entry(key.clone()).or_default();
        stamps.retain(|&t| t > cutoff);
        if stamps.len() >= self.config.max_requests as usize {
            tracing::warn!(
                client = %key,
                requests = stamps.len(),
                max = self.config.max_requests,
                "rate limit exceeded"
            );
            return Err(RateLimitError::Exceeded {
                key: key.to_string(),
                limit: self.config.max_requests,
                window_secs: self.config.window_secs,
            });
        }
        stamps.push(now);
        Ok(())
    }

    /// Drops keys with no request inside the window.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let cutoff = now.checked_sub(self.window()).unwrap_or(now);
        let mut windows = self
            .windows
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        windows.retain(|_, stamps| {
            stamps.retain(|&t| t > cutoff);
            !stamps.is_empty()
        });
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter(max_requests: u32) -> RateLimiter<IpAddr> {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_quota_is_per_key() {
        let limiter = limiter(2);
        let now = Instant::now();
        assert!(limiter.check_at(&ip(1), now).is_ok());
        assert!(limiter.check_at(&ip(1), now).is_ok());
        assert!(matches!(
            limiter.check_at(&ip(1), now),
            Err(RateLimitError::Exceeded { limit: 2, .. })
        ));
        assert!(limiter.check_at(&ip(2), now).is_ok());
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(1);
        let start = Instant::now();
        limiter.check_at(&ip(1), start).unwrap();
        assert!(limiter.check_at(&ip(1), start).is_err());
        let later = start + Duration::from_secs(61);
        assert!(limiter.check_at(&ip(1), later).is_ok());
    }

    #[test]
    fn test_tracked_key_cap() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 10,
            window_secs: 60,
            max_tracked_keys: 2,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        limiter.check_at(&ip(1), now).unwrap();
        limiter.check_at(&ip(2), now).unwrap();
        assert_eq!(
            limiter.check_at(&ip(3), now),
            Err(RateLimitError::TooManyClients {
                max_tracked_keys: 2
            })
        );
        // Known keys are still served at the cap.
        assert!(limiter.check_at(&ip(1), now).is_ok());

        // Once the old windows lapse, the forced cleanup admits a new key.
        let later = now + Duration::from_secs(120);
        assert!(limiter.check_at(&ip(3), later).is_ok());
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_requests: 0,
            ..RateLimitConfig::default()
        });
        for _ in 0..10 {
            assert!(limiter.check(&ip(1)).is_ok());
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_config_from_toml_fills_defaults() {
        let config: RateLimitConfig = toml::from_str("max_requests = 5").unwrap();
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.window_secs, 60);
        assert!(config.enabled);
    }
}
