//! Token-bucket rate limiting per client and route.
//!
//! Buckets are keyed by `{ip}#{route_key}` for route limits and by the bare
//! client IP for the global limit. Route keys look like `ROUTE:GET:/users/{id}`
//! for templated routes and `RAW:/events` for raw routes.
//!
//! A bucket starts full, refills continuously at `capacity / window` tokens
//! per millisecond and never holds more than `capacity` tokens.

use crate::{
    errors::{BoxError, ServerError},
    lifecycle::spawn_supervised,
    BoxFuture, Method, Request, Response, StatusCode,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    future::Future,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

/// Maximum number of requests accepted per time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub(crate) max_requests: u32,
    pub(crate) window: Duration,
}

impl RateLimit {
    /// `max_requests` per `window`.
    ///
    /// A zero `max_requests` or `window` disables the limit.
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// `max_requests` per `value` `unit`, where unit is one of
    /// `seconds`, `minutes`, `hours` or `days` (singular and short forms
    /// such as `s`, `min` or `h` are accepted too).
    ///
    /// ```
    /// use dispatch_web::RateLimit;
    /// use std::time::Duration;
    ///
    /// let limit = RateLimit::per(100, 1, "minutes").unwrap();
    /// assert_eq!(limit.window(), Duration::from_secs(60));
    /// assert!(RateLimit::per(100, 1, "fortnights").is_err());
    /// ```
    pub fn per(max_requests: u32, value: u64, unit: &str) -> Result<Self, ServerError> {
        Ok(Self::new(max_requests, parse_window(value, unit)?))
    }

    #[inline]
    pub const fn max_requests(&self) -> u32 {
        self.max_requests
    }

    #[inline]
    pub const fn window(&self) -> Duration {
        self.window
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.max_requests > 0 && !self.window.is_zero()
    }
}

pub(crate) fn parse_window(value: u64, unit: &str) -> Result<Duration, ServerError> {
    let secs = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        _ => return Err(ServerError::InvalidTimeUnit(unit.to_string())),
    };
    Ok(Duration::from_secs(value.saturating_mul(secs)))
}

/// Limit details handed to a rate-limit callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideContext {
    pub route_key: String,
    pub max_requests: u32,
    pub window: Duration,
}

/// Details of a denied request, passed to notification hooks.
#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub client_ip: IpAddr,
    /// `None` for the global limit.
    pub route_key: Option<String>,
    /// Consecutive denials of this bucket, starting at 1.
    pub triggered: u64,
    pub method: Method,
    pub path: String,
}

pub(crate) type LimitCallback = Arc<
    dyn Fn(u64, Request, OverrideContext) -> BoxFuture<'static, Result<Option<Response>, BoxError>>
        + Send
        + Sync,
>;

pub(crate) type NotifyHook =
    Arc<dyn Fn(RateLimitEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

pub(crate) fn limit_callback<F, Fut>(f: F) -> LimitCallback
where
    F: Fn(u64, Request, OverrideContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Response>, BoxError>> + Send + 'static,
{
    Arc::new(move |triggered, req, ctx| Box::pin(f(triggered, req, ctx)))
}

pub(crate) fn notify_hook<F, Fut>(f: F) -> NotifyHook
where
    F: Fn(RateLimitEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Plain `429` sent when no callback overrides the denial.
pub(crate) fn too_many_requests(retry_after: Duration) -> Response {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    Response::text(StatusCode::TooManyRequests, "Too Many Requests")
        .header("Retry-After", secs.max(1))
}

// BUCKETS

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    window: Duration,
    last_refill: Instant,
    last_used: Instant,
    denied: u64,
    /// Set when the sweeper drops the bucket from the map.
    retired: bool,
}

impl TokenBucket {
    fn full(capacity: f64, window: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            window,
            last_refill: now,
            last_used: now,
            denied: 0,
            retired: false,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1000.0;
        let window_ms = self.window.as_secs_f64() * 1000.0;
        if window_ms > 0.0 {
            self.tokens = (self.tokens + elapsed_ms * self.capacity / window_ms).min(self.capacity);
        }
        self.last_refill = now;
    }

    /// Time until one whole token is available.
    fn retry_after(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        self.window.mul_f64(missing / self.capacity.max(1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Decision {
    Allowed,
    Denied { triggered: u64, retry_after: Duration },
}

/// Concurrent map of buckets, each behind its own lock.
#[derive(Debug, Default)]
pub(crate) struct TokenBucketManager {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl TokenBucketManager {
    pub(crate) fn try_consume(&self, key: &str, capacity: u32, window: Duration) -> Decision {
        let now = Instant::now();
        let capacity = f64::from(capacity);

        // A bucket retired between lookup and lock is stale; look it up again
        let bucket = loop {
            let bucket = self.bucket(key, capacity, window, now);
            if !bucket.lock().retired {
                break bucket;
            }
        };

        let mut bucket = bucket.lock();
        bucket.capacity = capacity;
        bucket.window = window;
        bucket.refill(now);
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.denied = 0;
            Decision::Allowed
        } else {
            bucket.denied += 1;
            Decision::Denied {
                triggered: bucket.denied,
                retry_after: bucket.retry_after(),
            }
        }
    }

    /// Clones the bucket out so the shard lock is not held while deciding.
    fn bucket(&self, key: &str, capacity: f64, window: Duration, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(capacity, window, now))))
                .value(),
        )
    }

    /// Tokens currently available for `key`, `None` if it has no bucket.
    pub(crate) fn available(&self, key: &str) -> Option<f64> {
        let bucket = Arc::clone(self.buckets.get(key)?.value());
        let mut bucket = bucket.lock();
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    /// Drops buckets unused for longer than `idle`.
    pub(crate) fn sweep(&self, idle: Duration) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            if now.saturating_duration_since(bucket.last_used) <= idle {
                return true;
            }
            bucket.retired = true;
            false
        });
        before.saturating_sub(self.buckets.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }
}

// LIMITER

#[inline]
pub(crate) fn bucket_key(ip: IpAddr, route_key: &str) -> String {
    format!("{ip}#{route_key}")
}

/// Route and global limits with their notification hooks.
#[derive(Default)]
pub(crate) struct RateLimiter {
    pub(crate) buckets: TokenBucketManager,
    global: RwLock<Option<RateLimit>>,
    on_global: RwLock<Option<NotifyHook>>,
    on_route: RwLock<Option<NotifyHook>>,
}

impl RateLimiter {
    pub(crate) fn set_global(&self, limit: Option<RateLimit>) {
        *self.global.write() = limit.filter(RateLimit::is_active);
    }

    pub(crate) fn global(&self) -> Option<RateLimit> {
        *self.global.read()
    }

    pub(crate) fn set_global_hook(&self, hook: NotifyHook) {
        *self.on_global.write() = Some(hook);
    }

    pub(crate) fn set_route_hook(&self, hook: NotifyHook) {
        *self.on_route.write() = Some(hook);
    }

    pub(crate) fn check_route(&self, ip: IpAddr, route_key: &str, limit: RateLimit) -> Decision {
        self.buckets
            .try_consume(&bucket_key(ip, route_key), limit.max_requests, limit.window)
    }

    /// `None` when no global limit is configured.
    pub(crate) fn check_global(&self, ip: IpAddr) -> Option<Decision> {
        let limit = self.global()?;
        Some(
            self.buckets
                .try_consume(&ip.to_string(), limit.max_requests, limit.window),
        )
    }

    pub(crate) fn available_tokens(&self, ip: IpAddr, route_key: Option<&str>) -> Option<f64> {
        match route_key {
            Some(route_key) => self.buckets.available(&bucket_key(ip, route_key)),
            None => self.buckets.available(&ip.to_string()),
        }
    }

    pub(crate) fn notify(&self, event: RateLimitEvent) {
        let hook = match event.route_key {
            Some(_) => self.on_route.read().clone(),
            None => self.on_global.read().clone(),
        };

        if let Some(hook) = hook {
            spawn_supervised("rate limit hook", hook(event));
        }
    }
}

#[cfg(test)]
mod rate_limit_tests {
    use super::*;

    #[test]
    fn capacity_then_deny() {
        let manager = TokenBucketManager::default();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert_eq!(manager.try_consume("k", 5, window), Decision::Allowed);
        }
        for expected in 1..=3 {
            match manager.try_consume("k", 5, window) {
                Decision::Denied { triggered, retry_after } => {
                    assert_eq!(triggered, expected);
                    assert!(retry_after <= Duration::from_secs(12));
                }
                Decision::Allowed => panic!("request {expected} over capacity was allowed"),
            }
        }

        // Other keys are independent
        assert_eq!(manager.try_consume("other", 5, window), Decision::Allowed);
    }

    #[test]
    fn refills_over_time() {
        let manager = TokenBucketManager::default();
        let window = Duration::from_millis(100);

        assert_eq!(manager.try_consume("k", 2, window), Decision::Allowed);
        assert_eq!(manager.try_consume("k", 2, window), Decision::Allowed);
        assert!(matches!(manager.try_consume("k", 2, window), Decision::Denied { .. }));

        // A full window later exactly the capacity is back, no more
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(manager.try_consume("k", 2, window), Decision::Allowed);
        assert_eq!(manager.try_consume("k", 2, window), Decision::Allowed);
        assert!(matches!(manager.try_consume("k", 2, window), Decision::Denied { triggered: 1, .. }));
    }

    #[test]
    fn capped_after_long_idle() {
        let manager = TokenBucketManager::default();
        let window = Duration::from_millis(10);

        assert_eq!(manager.try_consume("k", 3, window), Decision::Allowed);
        std::thread::sleep(Duration::from_millis(100));

        let available = manager.available("k").unwrap();
        assert!((available - 3.0).abs() < f64::EPSILON, "{available}");
        assert_eq!(manager.available("missing"), None);
    }

    #[test]
    fn sweep_removes_idle_buckets() {
        let manager = TokenBucketManager::default();
        manager.try_consume("old", 1, Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(30));
        manager.try_consume("fresh", 1, Duration::from_secs(1));

        assert_eq!(manager.sweep(Duration::from_millis(20)), 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.available("fresh").is_some());
    }

    #[test]
    fn swept_bucket_is_retired_for_holders() {
        let manager = TokenBucketManager::default();
        let window = Duration::from_secs(60);
        assert_eq!(manager.try_consume("k", 1, window), Decision::Allowed);

        // A request that looked the bucket up just before the sweep
        let held = Arc::clone(manager.buckets.get("k").unwrap().value());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.sweep(Duration::from_millis(1)), 1);
        assert!(held.lock().retired);

        assert_eq!(manager.try_consume("k", 1, window), Decision::Allowed);
        assert_eq!(manager.len(), 1);
        assert!(!Arc::ptr_eq(&held, manager.buckets.get("k").unwrap().value()));
    }

    #[test]
    fn window_units() {
        #[rustfmt::skip]
        let cases = [
            (30, "seconds", Some(30)),
            (2, "Minutes", Some(120)),
            (1, "h", Some(3600)),
            (1, "day", Some(86_400)),
            (1, "weeks", None),
            (1, "", None),
        ];

        for (value, unit, expected) in cases {
            let got = parse_window(value, unit).ok().map(|d| d.as_secs());
            assert_eq!(got, expected, "{value} {unit}");
        }
    }

    #[test]
    fn global_and_route_keys() {
        let limiter = RateLimiter::default();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert!(limiter.check_global(ip).is_none());

        limiter.set_global(Some(RateLimit::new(1, Duration::from_secs(60))));
        assert_eq!(limiter.check_global(ip), Some(Decision::Allowed));
        assert!(matches!(limiter.check_global(ip), Some(Decision::Denied { .. })));

        let limit = RateLimit::new(1, Duration::from_secs(60));
        assert_eq!(limiter.check_route(ip, "ROUTE:GET:/a", limit), Decision::Allowed);
        assert_eq!(limiter.check_route(ip, "ROUTE:GET:/b", limit), Decision::Allowed);
        let left = limiter.available_tokens(ip, Some("ROUTE:GET:/a")).unwrap();
        assert!(left < 1.0, "{left}");
        assert!(limiter.available_tokens(ip, Some("ROUTE:GET:/c")).is_none());

        limiter.set_global(Some(RateLimit::new(0, Duration::from_secs(1))));
        assert!(limiter.global().is_none());
    }

    #[test]
    fn retry_after_header() {
        let resp = too_many_requests(Duration::from_millis(1500));
        assert_eq!(resp.status(), StatusCode::TooManyRequests);
        assert_eq!(resp.header_value("retry-after"), Some("2"));
    }
}
