//! # cachepilot-gateway
//!
//! Security gateway in front of the CachePilot management CLI.
//!
//! The CLI runs with elevated privileges and manages Redis tenants. This
//! crate exposes it over HTTP while making sure that only authenticated,
//! authorized and rate-limited callers can reach it, and only with
//! sanitized, whitelisted arguments.
//!
//! ## Features
//!
//! - **Input validation**: tenant names, paths, memory limits and free-form
//!   arguments are checked before they come near a process
//! - **API keys**: hashed at rest, hot-reloaded, with per-key scopes
//! - **Two-layer rate limiting**: per key and endpoint, plus per address and
//!   route with escalation to a temporary block
//! - **Whitelisted execution**: closed command set, no shell, hard timeout
//! - **Security events**: structured tracing plus an optional hash-chained
//!   audit file
//!
//! ## Quick Start
//!
//! ```no_run
//! use cachepilot_gateway::{api, AppState, Config, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> cachepilot_gateway::Result<()> {
//!     cachepilot_gateway::logging::try_init().ok();
//!
//!     let config = Config::default();
//!     let state = AppState::from_config(&config)?;
//!
//!     api::serve(ServerConfig::new("127.0.0.1", 8000), state).await
//! }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;
pub mod security;

// Re-export commonly used types
pub use api::{create_router, serve, ApiSettings, AppState, ServerConfig};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use execution::{CliCommand, CommandExecutor, CommandInvocation, ExecutionResult};
pub use security::{
    AddressRateLimiter, AuthGate, CredentialStore, KeyRateLimiter, SecurityEventLog,
};
