//! HTTP boundary for the gateway.
//!
//! A thin REST layer over the security core. Every request passes the
//! address rate limit before routing; handlers authenticate through the
//! [`Authenticated`](crate::security::Authenticated) extractor, check a
//! permission scope and run one whitelisted CLI command.
//!
//! ## Endpoints
//!
//! ### Health & Info
//! - `GET /` - API information
//! - `GET /api/v1/health` - Health check (no key required)
//!
//! ### Tenants
//! - `GET /api/v1/tenants` - List tenants
//! - `POST /api/v1/tenants` - Create a tenant
//! - `GET /api/v1/tenants/{name}` - Tenant status
//! - `PATCH /api/v1/tenants/{name}` - Change memory limits
//! - `DELETE /api/v1/tenants/{name}` - Delete (`?force=true`)
//! - `POST /api/v1/tenants/{name}/{start|stop|restart|rotate-password}`
//! - `GET /api/v1/tenants/{name}/handover` - Connection handover
//!
//! ### Backups
//! - `POST /api/v1/system/backup`, `POST /api/v1/system/restore`
//! - `GET /api/v1/system/backups/{name}`
//! - `POST /api/v1/system/verify-backup?backup_file=...`
//! - `POST /api/v1/system/backup/{enable|disable}/{name}`
//!
//! ### Monitoring
//! - `GET /api/v1/monitoring/health`, `GET /api/v1/monitoring/stats`
//! - `GET /api/v1/monitoring/metrics/{name}`

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod router;
pub mod types;

// Re-export commonly used types
pub use handlers::{ApiSettings, AppState};
pub use response::{InternalErrorDetail, GENERIC_ERROR_MESSAGE};
pub use router::{create_router, serve, ServerConfig};
pub use types::ApiResponse;
