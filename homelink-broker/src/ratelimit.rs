//! Token-bucket rate limiting per user and per source IP, with a
//! violation log, automatic IP blocking, and a coarse DDoS mode.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use homelink_proto::ErrorCode;

use crate::auth::{unix_now, Tier};
use crate::metrics::METRIC_RATE_LIMIT_VIOLATIONS;

/// How many violations within [`VIOLATION_WINDOW`] mark an IP suspicious.
const SUSPICIOUS_THRESHOLD: usize = 5;
/// How many violations within [`VIOLATION_WINDOW`] auto-block an IP.
const BLOCK_THRESHOLD: usize = 10;
const VIOLATION_WINDOW: Duration = Duration::from_secs(300);
/// Rolling violation log capacity.
const VIOLATION_LOG_CAP: usize = 1000;
/// Distinct suspicious IPs that trigger DDoS mode.
const DDOS_SUSPICIOUS_IPS: usize = 10;
const DDOS_WINDOW: Duration = Duration::from_secs(300);
/// Global bucket budget while in DDoS mode, requests per minute.
const DDOS_GLOBAL_PER_MIN: f64 = 1000.0;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub free_per_min: u32,
    pub premium_per_min: u32,
    pub enterprise_per_min: u32,
    pub ip_per_min: u32,
    pub ban_window: Duration,
    /// Buckets untouched for this long are dropped by the cleaner.
    pub stale_after: Duration,
}

impl RateLimitSettings {
    fn user_capacity(&self, tier: Tier) -> f64 {
        let per_min = match tier {
            Tier::Free => self.free_per_min,
            Tier::Premium => self.premium_per_min,
            Tier::Enterprise => self.enterprise_per_min,
        };
        f64::from(per_min)
    }
}

/// Outcome of a rate-limit check, with everything the HTTP layer needs
/// for the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub code: ErrorCode,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
    /// Unix second at which a denied caller can expect a token.
    pub reset_unix: u64,
}

impl Decision {
    fn allowed(limit: u32, remaining: u32) -> Self {
        Self {
            allowed: true,
            code: ErrorCode::RateLimitExceeded,
            limit,
            remaining,
            retry_after_secs: 0,
            reset_unix: unix_now(),
        }
    }

    fn denied(code: ErrorCode, limit: u32, retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            code,
            limit,
            remaining: 0,
            retry_after_secs,
            reset_unix: unix_now() + retry_after_secs,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    /// Refill window; capacity tokens per window.
    window: Duration,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, window: Duration) -> Self {
        Self {
            tokens: capacity,
            capacity,
            window,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate = self.capacity / self.window.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token if available; effective capacity may be scaled
    /// down (DDoS mode) without resetting accumulated tokens.
    fn try_consume(&mut self, now: Instant, effective_capacity: f64) -> bool {
        self.refill(now);
        let available = self.tokens.min(effective_capacity);
        if available >= 1.0 {
            self.tokens = available - 1.0;
            true
        } else {
            self.tokens = available;
            false
        }
    }

    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    fn remaining(&self) -> u32 {
        self.tokens.floor().max(0.0) as u32
    }

    /// Seconds until one token is available.
    fn retry_after(&self, effective_capacity: f64) -> u64 {
        let rate = self.capacity / self.window.as_secs_f64();
        let deficit = (1.0 - self.tokens.min(effective_capacity)).max(0.0);
        (deficit / rate).ceil() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    User(String),
    Ip(IpAddr),
    Global,
}

struct Violation {
    at: Instant,
    ip: IpAddr,
}

pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: DashMap<BucketKey, Bucket>,
    /// Last-touched timestamps for the cleaner, parallel to `buckets`.
    touched: DashMap<BucketKey, Instant>,
    violations: Mutex<VecDeque<Violation>>,
    suspicious: DashMap<IpAddr, Instant>,
    blocked: DashMap<IpAddr, Instant>,
    ddos_until: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
            touched: DashMap::new(),
            violations: Mutex::new(VecDeque::with_capacity(VIOLATION_LOG_CAP)),
            suspicious: DashMap::new(),
            blocked: DashMap::new(),
            ddos_until: Mutex::new(None),
        }
    }

    /// Check and consume one request budget for `(user, ip)`.
    #[tracing::instrument(name = "rate_limit.check", level = "debug", skip(self))]
    pub fn check(&self, user_id: &str, tier: Tier, ip: IpAddr) -> Decision {
        let now = Instant::now();
        let user_limit = self.settings.user_capacity(tier) as u32;

        if let Some(until) = self.blocked.get(&ip).map(|e| *e.value()) {
            if until > now {
                let retry = until.duration_since(now).as_secs().max(1);
                self.count_violation(ErrorCode::IpBlocked);
                return Decision::denied(ErrorCode::IpBlocked, user_limit, retry);
            }
            self.blocked.remove(&ip);
        }

        let ddos = self.in_ddos_mode(now);

        let user_key = BucketKey::User(user_id.to_owned());
        let user_cap = self.settings.user_capacity(tier);
        let (user_ok, remaining, user_retry) =
            self.consume(user_key.clone(), user_cap, user_cap, now);
        if !user_ok {
            self.record_violation(ip, now);
            return Decision::denied(ErrorCode::RateLimitExceeded, user_limit, user_retry);
        }

        let ip_cap = f64::from(self.settings.ip_per_min);
        let ip_effective = if ddos { ip_cap / 2.0 } else { ip_cap };
        let (ip_ok, _, ip_retry) = self.consume(BucketKey::Ip(ip), ip_cap, ip_effective, now);
        if !ip_ok {
            self.refund(&user_key);
            self.record_violation(ip, now);
            return Decision::denied(ErrorCode::RateLimitExceeded, user_limit, ip_retry);
        }

        if ddos {
            let (global_ok, _, global_retry) = self.consume(
                BucketKey::Global,
                DDOS_GLOBAL_PER_MIN,
                DDOS_GLOBAL_PER_MIN,
                now,
            );
            if !global_ok {
                self.refund(&user_key);
                self.refund(&BucketKey::Ip(ip));
                self.count_violation(ErrorCode::RateLimitExceeded);
                return Decision::denied(ErrorCode::RateLimitExceeded, user_limit, global_retry);
            }
        }

        Decision::allowed(user_limit, remaining)
    }

    fn consume(
        &self,
        key: BucketKey,
        capacity: f64,
        effective_capacity: f64,
        now: Instant,
    ) -> (bool, u32, u64) {
        self.touched.insert(key.clone(), now);
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(capacity, Duration::from_secs(60)));
        let ok = bucket.try_consume(now, effective_capacity);
        let remaining = bucket.remaining();
        let retry = if ok {
            0
        } else {
            bucket.retry_after(effective_capacity).max(1)
        };
        (ok, remaining, retry)
    }

    fn refund(&self, key: &BucketKey) {
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            bucket.refund();
        }
    }

    fn count_violation(&self, code: ErrorCode) {
        metrics::counter!(METRIC_RATE_LIMIT_VIOLATIONS, "code" => code.as_str()).increment(1);
    }

    fn record_violation(&self, ip: IpAddr, now: Instant) {
        self.count_violation(ErrorCode::RateLimitExceeded);
        let ip_violations = {
            let mut log = self.violations.lock();
            if log.len() == VIOLATION_LOG_CAP {
                log.pop_front();
            }
            log.push_back(Violation { at: now, ip });
            log.iter()
                .filter(|v| v.ip == ip && now.duration_since(v.at) < VIOLATION_WINDOW)
                .count()
        };

        if ip_violations >= BLOCK_THRESHOLD {
            tracing::warn!(%ip, violations = ip_violations, "auto-blocking ip");
            self.blocked.insert(ip, now + self.settings.ban_window);
        } else if ip_violations >= SUSPICIOUS_THRESHOLD {
            tracing::info!(%ip, violations = ip_violations, "marking ip suspicious");
            self.suspicious.insert(ip, now);
        }

        let distinct: HashSet<IpAddr> = self
            .suspicious
            .iter()
            .filter(|e| now.duration_since(*e.value()) < DDOS_WINDOW)
            .map(|e| *e.key())
            .collect();
        if distinct.len() >= DDOS_SUSPICIOUS_IPS {
            let mut ddos = self.ddos_until.lock();
            if ddos.map_or(true, |until| until <= now) {
                tracing::warn!(
                    suspicious_ips = distinct.len(),
                    "ddos signal raised, halving per-ip budgets"
                );
            }
            *ddos = Some(now + DDOS_WINDOW);
        }
    }

    pub fn in_ddos_mode(&self, now: Instant) -> bool {
        self.ddos_until.lock().is_some_and(|until| until > now)
    }

    /// Drop buckets and tracking entries that have gone stale.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let stale = self.settings.stale_after;
        self.touched.retain(|_, last| now.duration_since(*last) < stale);
        self.buckets.retain(|key, _| self.touched.contains_key(key));
        self.blocked.retain(|_, until| *until > now);
        self.suspicious
            .retain(|_, marked| now.duration_since(*marked) < DDOS_WINDOW);
    }

    /// Snapshot for the diagnostics endpoint.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        RateLimiterSnapshot {
            tracked_buckets: self.buckets.len(),
            blocked_ips: self.blocked.iter().map(|e| e.key().to_string()).collect(),
            suspicious_ips: self.suspicious.len(),
            ddos_mode: self.in_ddos_mode(now),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct RateLimiterSnapshot {
    pub tracked_buckets: usize,
    pub blocked_ips: Vec<String>,
    pub suspicious_ips: usize,
    pub ddos_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(free: u32, ip: u32) -> RateLimitSettings {
        RateLimitSettings {
            free_per_min: free,
            premium_per_min: 300,
            enterprise_per_min: 1000,
            ip_per_min: ip,
            ban_window: Duration::from_secs(600),
            stale_after: Duration::from_secs(600),
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn admits_up_to_capacity_then_denies() {
        let limiter = RateLimiter::new(settings(60, 200));
        for _ in 0..60 {
            assert!(limiter.check("u1", Tier::Free, ip(1)).allowed);
        }
        let denied = limiter.check("u1", Tier::Free, ip(1));
        assert!(!denied.allowed);
        assert_eq!(denied.code, ErrorCode::RateLimitExceeded);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs >= 1 && denied.retry_after_secs <= 60);
        // the very next request in the same window is also rejected
        assert!(!limiter.check("u1", Tier::Free, ip(1)).allowed);
    }

    #[test]
    fn users_do_not_share_buckets() {
        let limiter = RateLimiter::new(settings(2, 200));
        assert!(limiter.check("u1", Tier::Free, ip(1)).allowed);
        assert!(limiter.check("u1", Tier::Free, ip(1)).allowed);
        assert!(!limiter.check("u1", Tier::Free, ip(1)).allowed);
        assert!(limiter.check("u2", Tier::Free, ip(2)).allowed);
    }

    #[test]
    fn ip_budget_denies_across_users_and_refunds_user_token() {
        let limiter = RateLimiter::new(settings(60, 1));
        assert!(limiter.check("u1", Tier::Free, ip(1)).allowed);
        // second user, same ip: ip bucket is empty
        assert!(!limiter.check("u2", Tier::Free, ip(1)).allowed);
        // u2's own budget was refunded, so a different ip succeeds
        assert!(limiter.check("u2", Tier::Free, ip(2)).allowed);
    }

    #[test]
    fn tier_capacity_applies() {
        let limiter = RateLimiter::new(settings(1, 200));
        assert!(limiter.check("p", Tier::Premium, ip(3)).allowed);
        let decision = limiter.check("p", Tier::Premium, ip(3));
        assert!(decision.allowed);
        assert_eq!(decision.limit, 300);
    }

    #[test]
    fn repeated_violations_block_the_ip() {
        let limiter = RateLimiter::new(settings(1, 200));
        assert!(limiter.check("u1", Tier::Free, ip(9)).allowed);
        for _ in 0..BLOCK_THRESHOLD {
            limiter.check("u1", Tier::Free, ip(9));
        }
        let denied = limiter.check("u1", Tier::Free, ip(9));
        assert_eq!(denied.code, ErrorCode::IpBlocked);
        assert!(denied.retry_after_secs > 0);
    }

    #[test]
    fn cleanup_drops_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitSettings {
            stale_after: Duration::from_millis(0),
            ..settings(60, 200)
        });
        limiter.check("u1", Tier::Free, ip(1));
        assert!(limiter.buckets.len() >= 2);
        limiter.cleanup();
        assert_eq!(limiter.buckets.len(), 0);
    }
}
