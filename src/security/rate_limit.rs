//! Sliding-window rate limiting and abusive-address blocking.
//!
//! Two independent layers share the same [`SlidingWindow`] algorithm:
//!
//! - [`KeyRateLimiter`] is keyed by `(key digest, endpoint)` and guards
//!   authenticated resources with one global limit.
//! - [`AddressRateLimiter`] is keyed by `(source address, request path)`,
//!   applies per-route limits and escalates to a temporary address block
//!   when an address keeps hammering a route after being refused.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::events::{EventType, SecurityEvent, SecurityEventLog, Severity};
use crate::error::GatewayError;

/// Header consulted for the original client address behind a proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Address used when neither the header nor the peer is known.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Default escalation block length.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// Which limiting layer refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Per API key and endpoint.
    Key,
    /// Per source address and path.
    Address,
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key => write!(f, "key"),
            Self::Address => write!(f, "address"),
        }
    }
}

/// Outcome of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request admitted and recorded.
    Admitted { remaining: u32 },
    /// Request refused. `attempts` counts admitted and refused requests
    /// still inside the window, not including this one.
    Rejected { retry_after: Duration, attempts: usize },
}

/// Timestamps of one subject's requests inside a trailing window.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    admitted: VecDeque<Instant>,
    rejected: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry at or before `now - window`.
    fn prune(&mut self, now: Instant, window: Duration) {
        let Some(start) = now.checked_sub(window) else {
            return;
        };
        while self.admitted.front().is_some_and(|&t| t <= start) {
            self.admitted.pop_front();
        }
        while self.rejected.front().is_some_and(|&t| t <= start) {
            self.rejected.pop_front();
        }
    }

    /// Prune, then admit if fewer than `limit` requests remain in the window.
    pub fn try_admit(&mut self, now: Instant, window: Duration, limit: u32) -> Admission {
        self.prune(now, window);

        if self.admitted.len() >= limit as usize {
            let attempts = self.attempts();
            let retry_after = self.retry_after(now, window);
            self.rejected.push_back(now);
            return Admission::Rejected {
                retry_after,
                attempts,
            };
        }

        self.admitted.push_back(now);
        Admission::Admitted {
            remaining: limit.saturating_sub(self.admitted.len() as u32),
        }
    }

    /// Admitted plus refused requests currently in the window.
    pub fn attempts(&self) -> usize {
        self.admitted.len() + self.rejected.len()
    }

    /// Admitted requests currently in the window.
    pub fn admitted(&self) -> usize {
        self.admitted.len()
    }

    /// Time until the oldest admitted request leaves the window.
    fn retry_after(&self, now: Instant, window: Duration) -> Duration {
        self.admitted
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(window)
            .max(Duration::from_secs(1))
    }

    fn last_seen(&self) -> Option<Instant> {
        match (self.admitted.back(), self.rejected.back()) {
            (Some(&a), Some(&r)) => Some(a.max(r)),
            (a, r) => a.or(r).copied(),
        }
    }
}

/// Round a retry hint up to whole seconds.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Drop idle entries, then the least recently seen ones above `cap`.
pub(crate) fn evict<K, V, F>(map: &mut HashMap<K, V>, cutoff: Instant, cap: usize, last_seen: F)
where
    K: Clone + Eq + std::hash::Hash,
    F: Fn(&V) -> Option<Instant>,
{
    map.retain(|_, v| last_seen(v).is_some_and(|t| t > cutoff));

    if map.len() > cap {
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), last_seen(v))).collect();
        entries.sort_by_key(|(_, t)| *t);
        let to_remove = map.len() - cap;
        for (key, _) in entries.into_iter().take(to_remove) {
            map.remove(&key);
        }
    }
}

/// Free a slot for one new entry so the map never grows past `cap`.
///
/// Idle entries go first; if the map is still full, the least recently seen
/// entry is dropped.
pub(crate) fn make_room<K, V, F>(
    map: &mut HashMap<K, V>,
    cutoff: Option<Instant>,
    cap: usize,
    last_seen: F,
) where
    K: Clone + Eq + std::hash::Hash,
    F: Fn(&V) -> Option<Instant>,
{
    let cap = cap.max(1);
    if map.len() < cap {
        return;
    }
    if let Some(cutoff) = cutoff {
        map.retain(|_, v| last_seen(v).is_some_and(|t| t > cutoff));
    }
    while map.len() >= cap {
        let oldest = map
            .iter()
            .min_by_key(|(_, v)| last_seen(v))
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                map.remove(&key);
            }
            None => break,
        }
    }
}

/// Key-scoped limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub max_requests: u32,
    /// Time window duration.
    pub window: Duration,
    /// Whether rate limiting is enabled.
    pub enabled: bool,
    /// Maximum number of tracked subjects (memory limit).
    pub max_tracked_subjects: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            enabled: true,
            max_tracked_subjects: 10000,
        }
    }
}

impl RateLimitConfig {
    /// Create a disabled rate limiter config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Custom rate limit.
    pub fn custom(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
            ..Default::default()
        }
    }
}

/// Layer A: limits per `(key digest, endpoint)`.
#[derive(Debug)]
pub struct KeyRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, String), SlidingWindow>>,
    last_cleanup: Mutex<Instant>,
}

impl KeyRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Create a disabled rate limiter.
    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::disabled())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record a request.
    ///
    /// Returns `Ok(remaining)` if allowed, `Err(retry_after)` if limited.
    pub fn check(&self, subject: &str, endpoint: &str) -> Result<u32, Duration> {
        self.check_at(subject, endpoint, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(&self, subject: &str, endpoint: &str, now: Instant) -> Result<u32, Duration> {
        if !self.config.enabled {
            return Ok(self.config.max_requests);
        }

        self.maybe_cleanup(now);

        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            // Fail closed: a poisoned table cannot vouch for the caller.
            Err(_) => return Err(self.config.window),
        };

        let key = (subject.to_string(), endpoint.to_string());
        if !windows.contains_key(&key) {
            make_room(
                &mut *windows,
                now.checked_sub(self.config.window),
                self.config.max_tracked_subjects,
                SlidingWindow::last_seen,
            );
        }
        let window = windows.entry(key).or_default();

        match window.try_admit(now, self.config.window, self.config.max_requests) {
            Admission::Admitted { remaining } => Ok(remaining),
            Admission::Rejected { retry_after, .. } => Err(retry_after),
        }
    }

    /// Unused budget for a subject without recording a request.
    pub fn remaining(&self, subject: &str, endpoint: &str) -> u32 {
        self.remaining_at(subject, endpoint, Instant::now())
    }

    pub fn remaining_at(&self, subject: &str, endpoint: &str, now: Instant) -> u32 {
        let Ok(mut windows) = self.windows.lock() else {
            return 0;
        };
        match windows.get_mut(&(subject.to_string(), endpoint.to_string())) {
            Some(window) => {
                window.prune(now, self.config.window);
                self.config
                    .max_requests
                    .saturating_sub(window.admitted() as u32)
            }
            None => self.config.max_requests,
        }
    }

    /// Number of `(subject, endpoint)` pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn maybe_cleanup(&self, now: Instant) {
        let interval = self.config.window * 2;
        let Ok(mut last) = self.last_cleanup.lock() else {
            return;
        };
        if now.saturating_duration_since(*last) <= interval {
            return;
        }
        *last = now;
        drop(last);

        if let (Ok(mut windows), Some(cutoff)) = (self.windows.lock(), now.checked_sub(interval)) {
            evict(
                &mut windows,
                cutoff,
                self.config.max_tracked_subjects,
                SlidingWindow::last_seen,
            );
        }
    }
}

impl Default for KeyRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// A limit for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteLimit {
    pub limit: u32,
    pub window: Duration,
}

impl RouteLimit {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// A path prefix with a tighter or looser limit than the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub limit: RouteLimit,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, limit: u32, window_secs: u64) -> Self {
        Self {
            prefix: prefix.into(),
            limit: RouteLimit::new(limit, window_secs),
        }
    }
}

/// Address-scoped limiter configuration.
#[derive(Debug, Clone)]
pub struct AddressLimitConfig {
    pub enabled: bool,
    /// Limit for paths that match no rule.
    pub default_limit: RouteLimit,
    /// Per-route overrides; the longest matching prefix wins.
    pub routes: Vec<RouteRule>,
    /// How long an escalated address stays blocked.
    pub block_duration: Duration,
    /// Maximum number of tracked `(address, path)` pairs.
    pub max_tracked_subjects: usize,
    /// Prefer the first `X-Forwarded-For` hop over the peer address.
    ///
    /// Only safe when a trusted reverse proxy sets the header; any direct
    /// client can forge it.
    pub trust_forwarded_for: bool,
}

impl Default for AddressLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: RouteLimit::new(100, 60),
            routes: default_route_rules(),
            block_duration: DEFAULT_BLOCK_DURATION,
            max_tracked_subjects: 10000,
            trust_forwarded_for: true,
        }
    }
}

impl AddressLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Limit applying to `path`.
    pub fn limit_for(&self, path: &str) -> RouteLimit {
        self.routes
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.limit)
            .unwrap_or(self.default_limit)
    }
}

/// Built-in route overrides.
pub fn default_route_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/api/v1/auth/login", 5, 60),
        RouteRule::new("/api/v1/tenants", 50, 60),
        RouteRule::new("/api/v1/monitoring", 200, 60),
        RouteRule::new("/api/v1/system", 30, 60),
    ]
}

/// Admitted address-scoped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdmission {
    pub limit: u32,
    pub remaining: u32,
}

/// Layer B: limits per `(address, path)` with escalation blocking.
#[derive(Debug)]
pub struct AddressRateLimiter {
    config: AddressLimitConfig,
    windows: Mutex<HashMap<(String, String), SlidingWindow>>,
    blocked: Mutex<HashMap<String, Instant>>,
    last_cleanup: Mutex<Instant>,
    events: SecurityEventLog,
}

impl AddressRateLimiter {
    pub fn new(config: AddressLimitConfig, events: SecurityEventLog) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
            events,
        }
    }

    pub fn disabled() -> Self {
        Self::new(AddressLimitConfig::disabled(), SecurityEventLog::new())
    }

    pub fn config(&self) -> &AddressLimitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check and record a request from `address` to `path`.
    pub fn check(&self, address: &str, path: &str) -> Result<RouteAdmission, GatewayError> {
        self.check_at(address, path, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub fn check_at(
        &self,
        address: &str,
        path: &str,
        now: Instant,
    ) -> Result<RouteAdmission, GatewayError> {
        let route = self.config.limit_for(path);
        if !self.config.enabled {
            return Ok(RouteAdmission {
                limit: route.limit,
                remaining: route.limit,
            });
        }

        if let Some(retry_after) = self.block_remaining_at(address, now) {
            tracing::debug!("Rejecting blocked address {} on {}", address, path);
            return Err(GatewayError::AddressBlocked { retry_after });
        }

        self.maybe_cleanup(now);

        let admission = {
            let mut windows = self.windows.lock().map_err(|_| GatewayError::LockPoisoned)?;
            let key = (address.to_string(), path.to_string());
            if !windows.contains_key(&key) {
                make_room(
                    &mut *windows,
                    now.checked_sub(self.longest_window()),
                    self.config.max_tracked_subjects,
                    SlidingWindow::last_seen,
                );
            }
            windows
                .entry(key)
                .or_default()
                .try_admit(now, route.window, route.limit)
        };

        match admission {
            Admission::Admitted { remaining } => Ok(RouteAdmission {
                limit: route.limit,
                remaining,
            }),
            Admission::Rejected {
                retry_after,
                attempts,
            } => {
                tracing::warn!("Rate limit exceeded for IP {} on path {}", address, path);
                self.events.emit(
                    SecurityEvent::new(EventType::RateLimitExceeded, address, Severity::Warning)
                        .with("scope", "address")
                        .with("path", path)
                        .with("limit", route.limit)
                        .with("window_secs", route.window.as_secs()),
                );

                if attempts >= route.limit as usize * 2 {
                    self.block_at(address, path, attempts, now)?;
                    return Err(GatewayError::AddressBlocked {
                        retry_after: self.config.block_duration,
                    });
                }

                Err(GatewayError::RateLimited {
                    scope: RateLimitScope::Address,
                    retry_after,
                })
            }
        }
    }

    /// Remaining block time for `address`, expiring stale entries.
    pub fn block_remaining_at(&self, address: &str, now: Instant) -> Option<Duration> {
        let mut blocked = self.blocked.lock().ok()?;
        match blocked.get(address) {
            Some(&until) if now < until => Some(until - now),
            Some(_) => {
                blocked.remove(address);
                None
            }
            None => None,
        }
    }

    /// Whether `address` is currently blocked.
    pub fn is_blocked(&self, address: &str) -> bool {
        self.block_remaining_at(address, Instant::now()).is_some()
    }

    fn block_at(
        &self,
        address: &str,
        path: &str,
        attempts: usize,
        now: Instant,
    ) -> Result<(), GatewayError> {
        let duration = self.config.block_duration;
        self.blocked
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?
            .insert(address.to_string(), now + duration);

        tracing::warn!(
            "IP {} temporarily blocked for {} minutes due to rate limit violation",
            address,
            duration.as_secs() / 60
        );
        self.events.emit(
            SecurityEvent::new(EventType::AddressBlocked, address, Severity::Error)
                .with("path", path)
                .with("attempts", attempts)
                .with("block_secs", duration.as_secs()),
        );
        Ok(())
    }

    /// Number of `(address, path)` pairs and blocked addresses tracked.
    pub fn tracked(&self) -> (usize, usize) {
        let windows = self.windows.lock().map(|w| w.len()).unwrap_or(0);
        let blocked = self.blocked.lock().map(|b| b.len()).unwrap_or(0);
        (windows, blocked)
    }

    fn longest_window(&self) -> Duration {
        self.config
            .routes
            .iter()
            .map(|r| r.limit.window)
            .chain(std::iter::once(self.config.default_limit.window))
            .max()
            .unwrap_or(self.config.default_limit.window)
    }

    fn maybe_cleanup(&self, now: Instant) {
        let interval = self.longest_window() * 2;

        let Ok(mut last) = self.last_cleanup.lock() else {
            return;
        };
        if now.saturating_duration_since(*last) <= interval {
            return;
        }
        *last = now;
        drop(last);

        if let (Ok(mut windows), Some(cutoff)) = (self.windows.lock(), now.checked_sub(interval)) {
            evict(
                &mut windows,
                cutoff,
                self.config.max_tracked_subjects,
                SlidingWindow::last_seen,
            );
        }
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.retain(|_, until| *until > now);
        }
    }
}

/// Resolved caller address, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub String);

impl ClientAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolve the caller address for limiting and auditing.
///
/// With `trust_forwarded_for`, the first `X-Forwarded-For` hop wins over the
/// transport peer.
pub fn resolve_client_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let first_hop = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(hop) = first_hop {
            return hop.to_string();
        }
    }

    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

/// Address-scoped rate limit middleware for axum.
///
/// Runs before routing to handlers and before authentication. Also records
/// the resolved [`ClientAddress`] for later extractors.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<AddressRateLimiter>>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let address = resolve_client_address(
        request.headers(),
        peer,
        limiter.config().trust_forwarded_for,
    );
    let path = request.uri().path().to_string();
    request
        .extensions_mut()
        .insert(ClientAddress(address.clone()));

    if !limiter.is_enabled() {
        return next.run(request).await;
    }

    match limiter.check(&address, &path) {
        Ok(admission) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(admission.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(admission.remaining));
            response
        }
        Err(err) => {
            tracing::info!("Rate limit exceeded for {} on {}", address, path);
            let limit = limiter.config().limit_for(&path).limit;
            let mut response = err.into_response();
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            response
        }
    }
}
