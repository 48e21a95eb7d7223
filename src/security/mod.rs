//! Security layer for the CachePilot gateway.
//!
//! Everything that stands between an HTTP caller and the privileged CLI:
//!
//! - **Credentials**: hashed API keys in a file-backed store
//! - **Authentication**: key validation with failed-attempt tracking
//! - **Rate Limiting**: key-scoped and address-scoped sliding windows,
//!   with temporary blocks for abusive addresses
//! - **Validation**: sanitizers for names, paths, numbers and arguments
//! - **Events**: structured, optionally hash-chained security trail
//!
//! ## Example
//!
//! ```rust
//! use cachepilot_gateway::security::{sanitize_tenant_name, KeyRateLimiter};
//!
//! assert_eq!(sanitize_tenant_name("  Acme-Prod ").unwrap(), "acme-prod");
//! assert!(sanitize_tenant_name("../etc").is_err());
//!
//! let limiter = KeyRateLimiter::default();
//! assert!(limiter.check("key-digest", "tenants").is_ok());
//! ```

pub mod auth;
pub mod credentials;
pub mod events;
pub mod rate_limit;
pub mod validation;

// Re-export commonly used types
pub use auth::{
    endpoint_scope, extract_api_key, AuthGate, AuthRejection, Authenticated, Identity,
};
pub use credentials::{
    check_file_permissions, digest_key, generate_api_key, scopes, CredentialStore, KeyRecord,
};
pub use events::{
    verify_audit_chain, AuditFileSink, EventSink, EventType, MemorySink, SecurityEvent,
    SecurityEventLog, Severity, TracingSink,
};
pub use rate_limit::{
    rate_limit_middleware, resolve_client_address, AddressLimitConfig, AddressRateLimiter,
    ClientAddress, KeyRateLimiter, RateLimitConfig, RateLimitScope, RouteLimit, RouteRule,
};
pub use validation::{
    looks_suspicious, sanitize_command_argument, sanitize_file_path, sanitize_tenant_name,
    validate_backup_name, validate_memory_limit, validate_memory_pair, validate_port,
    ValidationError,
};
