//! API key authentication with failed-attempt tracking.
//!
//! [`AuthGate`] validates raw keys against the [`CredentialStore`], records
//! every outcome as a security event and applies the key-scoped rate limit
//! once a key is known. Failures are counted per source address over a
//! trailing [`FAILURE_LOOKBACK`]; reaching [`ABUSE_THRESHOLD`] raises an
//! `auth_abuse` event without blocking the address.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use super::credentials::{CredentialStore, KeyRecord};
use super::events::{EventType, SecurityEvent, SecurityEventLog, Severity};
use super::rate_limit::{
    evict, make_room, resolve_client_address, ClientAddress, KeyRateLimiter, RateLimitScope,
};
use crate::error::GatewayError;
use crate::Result;

/// Primary header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Prefix accepted in the `Authorization` header.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Window over which failed attempts are counted.
pub const FAILURE_LOOKBACK: Duration = Duration::from_secs(300);

/// Failures within the lookback that raise an abuse event.
pub const ABUSE_THRESHOLD: usize = 5;

/// Why a credential was refused.
///
/// Unknown and malformed keys both produce [`AuthRejection::InvalidKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingKey,
    InvalidKey,
}

impl AuthRejection {
    fn reason(&self) -> &'static str {
        match self {
            Self::MissingKey => "missing_key",
            Self::InvalidKey => "invalid_key",
        }
    }
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKey => write!(f, "Missing API key"),
            Self::InvalidKey => write!(f, "Invalid API key"),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    record: KeyRecord,
    address: String,
}

impl Identity {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &KeyRecord {
        &self.record
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Fail with [`GatewayError::Forbidden`] unless the key grants `scope`.
    pub fn require(&self, scope: &str) -> Result<()> {
        if self.record.allows(scope) {
            Ok(())
        } else {
            tracing::warn!(
                key_name = %self.record.name,
                "Permission denied for scope {}",
                scope
            );
            Err(GatewayError::Forbidden {
                scope: scope.to_string(),
            })
        }
    }
}

/// Extract the raw key from request headers.
///
/// `X-API-Key` wins over `Authorization: Bearer`. Blank values count as
/// absent.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let key = from_header.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    });

    key.map(str::to_string)
}

/// Resource group used as the key-scoped rate limit endpoint.
///
/// `/api/v1/tenants/acme/start` maps to `tenants`.
pub fn endpoint_scope(path: &str) -> &str {
    let trimmed = path.strip_prefix("/api/v1/").unwrap_or(path.trim_start_matches('/'));
    match trimmed.split('/').next() {
        Some(segment) if !segment.is_empty() => segment,
        _ => "/",
    }
}

/// Authentication gate shared by all handlers.
#[derive(Debug)]
pub struct AuthGate {
    store: Arc<CredentialStore>,
    key_limiter: KeyRateLimiter,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
    last_sweep: Mutex<Instant>,
    max_tracked_addresses: usize,
    trust_forwarded_for: bool,
    events: SecurityEventLog,
}

impl AuthGate {
    pub fn new(
        store: Arc<CredentialStore>,
        key_limiter: KeyRateLimiter,
        events: SecurityEventLog,
    ) -> Self {
        Self {
            store,
            key_limiter,
            failures: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            max_tracked_addresses: 10000,
            trust_forwarded_for: true,
            events,
        }
    }

    /// Cap on addresses with tracked failures.
    pub fn with_max_tracked_addresses(mut self, max: usize) -> Self {
        self.max_tracked_addresses = max;
        self
    }

    /// Whether request extractors may trust `X-Forwarded-For`.
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn key_limiter(&self) -> &KeyRateLimiter {
        &self.key_limiter
    }

    /// Validate a raw key presented from `address`.
    pub fn authenticate(&self, raw_key: Option<&str>, address: &str) -> Result<Identity> {
        self.authenticate_at(raw_key, address, Instant::now())
    }

    /// [`authenticate`](Self::authenticate) at an explicit instant.
    pub fn authenticate_at(
        &self,
        raw_key: Option<&str>,
        address: &str,
        now: Instant,
    ) -> Result<Identity> {
        let raw_key = match raw_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => key,
            None => return Err(self.reject(AuthRejection::MissingKey, address, now)),
        };

        match self.store.validate_at(raw_key, now)? {
            Some(record) => {
                self.events.emit(
                    SecurityEvent::new(EventType::AuthSuccess, address, Severity::Info)
                        .with("key_name", record.name.clone())
                        .with("request_count", record.request_count),
                );
                Ok(Identity {
                    record,
                    address: address.to_string(),
                })
            }
            None => Err(self.reject(AuthRejection::InvalidKey, address, now)),
        }
    }

    /// Authenticate, then charge the key-scoped limit for `endpoint`.
    pub fn authorize(
        &self,
        raw_key: Option<&str>,
        address: &str,
        endpoint: &str,
    ) -> Result<Identity> {
        self.authorize_at(raw_key, address, endpoint, Instant::now())
    }

    /// [`authorize`](Self::authorize) at an explicit instant.
    pub fn authorize_at(
        &self,
        raw_key: Option<&str>,
        address: &str,
        endpoint: &str,
        now: Instant,
    ) -> Result<Identity> {
        let identity = self.authenticate_at(raw_key, address, now)?;

        if let Err(retry_after) =
            self.key_limiter
                .check_at(&identity.record.digest, endpoint, now)
        {
            tracing::warn!(
                key_name = %identity.name(),
                "Rate limit exceeded for API key on endpoint {}",
                endpoint
            );
            self.events.emit(
                SecurityEvent::new(EventType::RateLimitExceeded, address, Severity::Warning)
                    .with("scope", "key")
                    .with("key_name", identity.name())
                    .with("endpoint", endpoint),
            );
            return Err(GatewayError::RateLimited {
                scope: RateLimitScope::Key,
                retry_after,
            });
        }

        Ok(identity)
    }

    /// Failures recorded for `address` within the lookback.
    pub fn failure_count(&self, address: &str) -> usize {
        self.failure_count_at(address, Instant::now())
    }

    pub fn failure_count_at(&self, address: &str, now: Instant) -> usize {
        let Ok(failures) = self.failures.lock() else {
            return 0;
        };
        let horizon = now.checked_sub(FAILURE_LOOKBACK);
        failures
            .get(address)
            .map(|times| times.iter().filter(|&&t| horizon.map_or(true, |h| t > h)).count())
            .unwrap_or(0)
    }

    /// Addresses with tracked failures.
    pub fn tracked_addresses(&self) -> usize {
        self.failures.lock().map(|f| f.len()).unwrap_or(0)
    }

    fn reject(&self, rejection: AuthRejection, address: &str, now: Instant) -> GatewayError {
        let recent = self.record_failure(address, now);

        tracing::warn!("Failed authentication attempt from {}: {}", address, rejection.reason());
        self.events.emit(
            SecurityEvent::new(EventType::AuthFailure, address, Severity::Warning)
                .with("reason", rejection.reason())
                .with("recent_failures", recent),
        );

        if recent >= ABUSE_THRESHOLD {
            self.events.emit(
                SecurityEvent::new(EventType::AuthAbuse, address, Severity::Error)
                    .with("reason", "multiple_failed_attempts")
                    .with("failure_count", recent),
            );
        }

        rejection.into()
    }

    /// Append a failure and return the count within the lookback.
    fn record_failure(&self, address: &str, now: Instant) -> usize {
        self.maybe_sweep(now);

        let Ok(mut failures) = self.failures.lock() else {
            return 0;
        };
        if !failures.contains_key(address) {
            make_room(
                &mut *failures,
                now.checked_sub(FAILURE_LOOKBACK),
                self.max_tracked_addresses,
                |times: &VecDeque<Instant>| times.back().copied(),
            );
        }
        let times = failures.entry(address.to_string()).or_default();
        if let Some(horizon) = now.checked_sub(FAILURE_LOOKBACK) {
            while times.front().is_some_and(|&t| t <= horizon) {
                times.pop_front();
            }
        }
        times.push_back(now);
        times.len()
    }

    fn maybe_sweep(&self, now: Instant) {
        let Ok(mut last) = self.last_sweep.lock() else {
            return;
        };
        if now.saturating_duration_since(*last) <= FAILURE_LOOKBACK {
            return;
        }
        *last = now;
        drop(last);

        let (Ok(mut failures), Some(horizon)) =
            (self.failures.lock(), now.checked_sub(FAILURE_LOOKBACK))
        else {
            return;
        };
        evict(
            &mut *failures,
            horizon,
            self.max_tracked_addresses,
            |times: &VecDeque<Instant>| times.back().copied(),
        );
    }
}

/// Axum extractor that authenticates the request.
///
/// Uses the [`ClientAddress`] recorded by the rate limit middleware, falling
/// back to the request headers when the middleware did not run.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
    Arc<AuthGate>: FromRef<S>,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let gate = Arc::<AuthGate>::from_ref(state);

        let address = match parts.extensions.get::<ClientAddress>() {
            Some(addr) => addr.0.clone(),
            None => resolve_client_address(&parts.headers, None, gate.trust_forwarded_for),
        };
        let raw_key = extract_api_key(&parts.headers);
        let endpoint = endpoint_scope(parts.uri.path());

        gate.authorize(raw_key.as_deref(), &address, endpoint)
            .map(Authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::credentials::scopes;
    use crate::security::events::MemorySink;
    use crate::security::rate_limit::RateLimitConfig;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        gate: AuthGate,
        memory: Arc<MemorySink>,
        key: String,
    }

    fn fixture(limit: RateLimitConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::open(
            dir.path().join("keys.json"),
            Duration::ZERO,
        ));
        let key = store.issue("ops", &[scopes::TENANTS_READ.to_string()]).unwrap();
        let (events, memory) = SecurityEventLog::with_memory();
        let gate = AuthGate::new(store, KeyRateLimiter::new(limit), events);
        Fixture {
            _dir: dir,
            gate,
            memory,
            key,
        }
    }

    #[test]
    fn test_valid_key_emits_success() {
        let f = fixture(RateLimitConfig::default());
        let identity = f.gate.authenticate(Some(&f.key), "10.0.0.1").unwrap();

        assert_eq!(identity.name(), "ops");
        assert_eq!(identity.address(), "10.0.0.1");
        let events = f.memory.of_type(EventType::AuthSuccess);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detail("key_name"), Some(&serde_json::json!("ops")));
        assert_eq!(events[0].detail("request_count"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_missing_and_invalid_keys() {
        let f = fixture(RateLimitConfig::default());

        let err = f.gate.authenticate(None, "10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthRejection::MissingKey)));

        let err = f.gate.authenticate(Some("   "), "10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthRejection::MissingKey)));

        let err = f.gate.authenticate(Some("nope"), "10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthRejection::InvalidKey)));

        assert_eq!(f.gate.failure_count("10.0.0.1"), 3);
    }

    #[test]
    fn test_each_unknown_key_adds_one_failure() {
        let f = fixture(RateLimitConfig::default());
        for i in 1..=3 {
            let _ = f.gate.authenticate(Some(&format!("guess-{i}")), "10.0.0.9");
            assert_eq!(f.gate.failure_count("10.0.0.9"), i);
        }
        assert_eq!(f.gate.failure_count("10.0.0.10"), 0);
    }

    #[test]
    fn test_five_failures_raise_abuse_event() {
        let f = fixture(RateLimitConfig::default());
        let ip = "203.0.113.9";

        for i in 0..4 {
            let _ = f.gate.authenticate(Some(&format!("wrong-{i}")), ip);
        }
        assert!(f.memory.of_type(EventType::AuthAbuse).is_empty());

        let _ = f.gate.authenticate(Some("wrong-4"), ip);
        let abuse = f.memory.of_type(EventType::AuthAbuse);
        assert_eq!(abuse.len(), 1);
        assert_eq!(abuse[0].source_address, ip);
        assert_eq!(abuse[0].severity, Severity::Error);
        assert_eq!(abuse[0].detail("failure_count"), Some(&serde_json::json!(5)));

        // Abuse does not block: the valid key still authenticates.
        assert!(f.gate.authenticate(Some(&f.key), ip).is_ok());
    }

    #[test]
    fn test_failures_expire_after_lookback() {
        let f = fixture(RateLimitConfig::default());
        let start = Instant::now();
        let ip = "198.51.100.4";

        for _ in 0..4 {
            let _ = f.gate.authenticate_at(Some("bad"), ip, start);
        }
        let later = start + FAILURE_LOOKBACK + Duration::from_secs(1);
        let _ = f.gate.authenticate_at(Some("bad"), ip, later);

        assert_eq!(f.gate.failure_count_at(ip, later), 1);
        assert!(f.memory.of_type(EventType::AuthAbuse).is_empty());
    }

    #[test]
    fn test_sweep_drops_idle_addresses() {
        let f = fixture(RateLimitConfig::default());
        let start = Instant::now();
        for i in 0..5 {
            let _ = f.gate.authenticate_at(Some("bad"), &format!("10.0.1.{i}"), start);
        }
        assert_eq!(f.gate.tracked_addresses(), 5);

        let later = start + FAILURE_LOOKBACK * 2;
        let _ = f.gate.authenticate_at(Some("bad"), "10.0.2.1", later);
        assert_eq!(f.gate.tracked_addresses(), 1);
    }

    #[test]
    fn test_failure_tracking_capped_between_sweeps() {
        let mut f = fixture(RateLimitConfig::default());
        f.gate = f.gate.with_max_tracked_addresses(8);
        let now = Instant::now();
        for i in 0..1000 {
            let _ = f.gate.authenticate_at(Some("bad"), &format!("10.9.{}.{}", i / 256, i % 256), now);
        }
        assert_eq!(f.gate.tracked_addresses(), 8);
    }

    #[test]
    fn test_parallel_authorize_admits_exactly_key_limit() {
        let f = fixture(RateLimitConfig::custom(30, 60));
        let now = Instant::now();
        let admitted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for t in 0..6 {
                let (gate, key, admitted) = (&f.gate, &f.key, &admitted);
                scope.spawn(move || {
                    for _ in 0..10 {
                        let address = format!("10.0.3.{t}");
                        if gate.authorize_at(Some(key), &address, "tenants", now).is_ok() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 30);
        assert_eq!(f.memory.of_type(EventType::AuthSuccess).len(), 60);
    }

    #[test]
    fn test_authorize_applies_key_limit() {
        let f = fixture(RateLimitConfig::custom(2, 60));
        let now = Instant::now();

        assert!(f.gate.authorize_at(Some(&f.key), "10.0.0.1", "tenants", now).is_ok());
        assert!(f.gate.authorize_at(Some(&f.key), "10.0.0.2", "tenants", now).is_ok());
        let err = f
            .gate
            .authorize_at(Some(&f.key), "10.0.0.3", "tenants", now)
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                scope: RateLimitScope::Key,
                ..
            }
        ));
        // Other endpoints keep their own budget.
        assert!(f.gate.authorize_at(Some(&f.key), "10.0.0.3", "system", now).is_ok());
    }

    #[test]
    fn test_identity_require() {
        let f = fixture(RateLimitConfig::default());
        let identity = f.gate.authenticate(Some(&f.key), "10.0.0.1").unwrap();

        assert!(identity.require(scopes::TENANTS_READ).is_ok());
        let err = identity.require(scopes::TENANTS_WRITE).unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_extract_api_key_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-bearer"));

        headers.insert(API_KEY_HEADER, "from-header".parse().unwrap());
        assert_eq!(extract_api_key(&headers).as_deref(), Some("from-header"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_api_key(&basic), None);
    }

    #[test]
    fn test_endpoint_scope() {
        assert_eq!(endpoint_scope("/api/v1/tenants/acme/start"), "tenants");
        assert_eq!(endpoint_scope("/api/v1/system/backup"), "system");
        assert_eq!(endpoint_scope("/api/v1/"), "/");
        assert_eq!(endpoint_scope("/health"), "health");
    }
}
