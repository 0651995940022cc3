//! Cached fetch with exponential backoff on HTTP 429.
//!
//! A call made while the current delay has not elapsed since the last
//! attempt is served from cache without touching the network.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::market::error::FetchError;

#[derive(Debug)]
pub struct BackoffState<T> {
    last_attempt: Option<Instant>,
    cached: Option<T>,
    delay: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl<T: Clone> BackoffState<T> {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            last_attempt: None,
            cached: None,
            delay: floor,
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// Whether a live call is allowed at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.last_attempt
            .map_or(true, |last| now.saturating_duration_since(last) >= self.delay)
    }

    pub fn record_success(&mut self, now: Instant, value: T) {
        self.last_attempt = Some(now);
        self.cached = Some(value);
        self.delay = self.floor;
    }

    pub fn record_failure(&mut self, now: Instant, rate_limited: bool) {
        self.last_attempt = Some(now);
        if rate_limited {
            self.delay = (self.delay * 2).min(self.ceiling);
        }
    }

    pub fn cached(&self) -> Option<&T> {
        self.cached.as_ref()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// Fetched from upstream on this call.
    Fresh(T),
    /// Served from cache, either gated by the backoff or after a failure.
    Cached(T),
    /// Nothing live and nothing cached.
    Unavailable,
}

impl<T> Fetched<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Self::Fresh(v) | Self::Cached(v) => Some(v),
            Self::Unavailable => None,
        }
    }
}

/// `BackoffState` behind an async mutex, shared by every caller of one source.
pub struct BackoffCache<T> {
    name: &'static str,
    state: Mutex<BackoffState<T>>,
}

impl<T: Clone + Send> BackoffCache<T> {
    pub fn new(name: &'static str, floor: Duration, ceiling: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(BackoffState::new(floor, ceiling)),
        }
    }

    /// Serve from cache while backing off, otherwise call `fetch` once.
    /// Concurrent callers wait on the same lock, so only one request is in
    /// flight per source.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Fetched<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if !state.ready(now) {
            debug!(source = self.name, delay_ms = state.delay().as_millis() as u64, "Backing off, serving cache");
            return state.cached().cloned().map_or(Fetched::Unavailable, Fetched::Cached);
        }

        match fetch().await {
            Ok(value) => {
                state.record_success(Instant::now(), value.clone());
                Fetched::Fresh(value)
            }
            Err(e) => {
                state.record_failure(Instant::now(), e.is_rate_limited());
                warn!(
                    source = self.name,
                    error = %e,
                    error_type = e.error_type(),
                    delay_ms = state.delay().as_millis() as u64,
                    "Upstream fetch failed"
                );
                state.cached().cloned().map_or(Fetched::Unavailable, Fetched::Cached)
            }
        }
    }

    pub async fn delay(&self) -> Duration {
        self.state.lock().await.delay()
    }
}

/// Degraded-mode stand-in: `base + sin(epoch_ms / 3_600_000) * amplitude`,
/// rounded to cents.
pub fn sinusoidal_placeholder(base: Decimal, amplitude: Decimal) -> Decimal {
    let ms = Utc::now().timestamp_millis() as f64;
    let wave = Decimal::from_f64((ms / 3_600_000.0).sin()).unwrap_or_default();
    (base + wave * amplitude).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FLOOR: Duration = Duration::from_secs(5);
    const CEILING: Duration = Duration::from_secs(60);

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut state: BackoffState<f64> = BackoffState::new(FLOOR, CEILING);
        let mut now = Instant::now();

        let mut seen = Vec::new();
        for _ in 0..6 {
            state.record_failure(now, true);
            seen.push(state.delay().as_secs());
            now += state.delay();
        }
        assert_eq!(seen, vec![10, 20, 40, 60, 60, 60]);

        state.record_success(now, 26_000.0);
        assert_eq!(state.delay(), FLOOR);
        assert_eq!(state.cached(), Some(&26_000.0));
    }

    #[test]
    fn test_other_errors_keep_delay() {
        let mut state: BackoffState<f64> = BackoffState::new(FLOOR, CEILING);
        let now = Instant::now();
        state.record_failure(now, true);
        state.record_failure(now, false);
        assert_eq!(state.delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_gate_on_last_attempt() {
        let mut state: BackoffState<f64> = BackoffState::new(FLOOR, CEILING);
        let now = Instant::now();
        assert!(state.ready(now));

        state.record_success(now, 1.0);
        assert!(!state.ready(now + Duration::from_secs(4)));
        assert!(state.ready(now + FLOOR));
    }

    #[tokio::test]
    async fn test_cache_serves_without_refetch_inside_delay() {
        let cache: BackoffCache<f64> = BackoffCache::new("test", FLOOR, CEILING);
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_fetch(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(25_900.0)
            })
            .await;
        assert_eq!(first, Fetched::Fresh(25_900.0));

        let second = cache
            .get_or_fetch(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1.0)
            })
            .await;
        assert_eq!(second, Fetched::Cached(25_900.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_without_cache_is_unavailable() {
        let cache: BackoffCache<f64> = BackoffCache::new("test", FLOOR, CEILING);
        let result = cache
            .get_or_fetch(|| async { Err(FetchError::RateLimited) })
            .await;
        assert_eq!(result, Fetched::Unavailable);
        assert_eq!(cache.delay().await, Duration::from_secs(10));
    }

    #[test]
    fn test_placeholder_stays_in_band() {
        let v = sinusoidal_placeholder(dec!(40000), dec!(2000));
        assert!((dec!(38000)..=dec!(42000)).contains(&v));
        assert!(v.scale() <= 2);
    }
}
