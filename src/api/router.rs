//! API router configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    create_backup, create_tenant, delete_tenant, disable_backups, enable_backups, get_tenant,
    health, list_backups, list_tenants, monitoring_health, monitoring_stats, restore_backup, root,
    tenant_action, tenant_handover, tenant_metrics, update_tenant, verify_backup, AppState,
};
use super::middleware::{
    error_boundary, handle_panic, process_time, reject_suspicious_query, require_json_body,
    security_headers,
};
use crate::security::rate_limit_middleware;
use crate::security::CredentialStore;

/// Create the API router with all routes and middleware configured.
///
/// Request flow, outermost first: CORS, tracing, process time, security
/// headers, address rate limit, error boundary, panic guard, query and
/// content-type guards, then the handler (which authenticates).
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let tenant_routes = Router::new()
        .route("/", get(list_tenants).post(create_tenant))
        .route(
            "/{tenant_name}",
            get(get_tenant).patch(update_tenant).delete(delete_tenant),
        )
        .route("/{tenant_name}/handover", get(tenant_handover))
        .route("/{tenant_name}/{action}", post(tenant_action));

    let system_routes = Router::new()
        .route("/backup", post(create_backup))
        .route("/backups/{tenant_name}", get(list_backups))
        .route("/restore", post(restore_backup))
        .route("/verify-backup", post(verify_backup))
        .route("/backup/enable/{tenant_name}", post(enable_backups))
        .route("/backup/disable/{tenant_name}", post(disable_backups));

    let monitoring_routes = Router::new()
        .route("/health", get(monitoring_health))
        .route("/stats", get(monitoring_stats))
        .route("/metrics/{tenant_name}", get(tenant_metrics));

    let api_v1 = Router::new()
        .route("/health", get(health))
        .nest("/tenants", tenant_routes)
        .nest("/system", system_routes)
        .nest("/monitoring", monitoring_routes);

    Router::new()
        .route("/", get(root))
        .nest("/api/v1", api_v1)
        .layer(middleware::from_fn(require_json_body))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            reject_suspicious_query,
        ))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(state.clone(), error_boundary))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(process_time))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() || origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ])
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
    /// Wait for in-flight requests on SIGINT/SIGTERM.
    pub graceful_shutdown: bool,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            graceful_shutdown: true,
        }
    }
}

/// Start the API server and flush credential usage on shutdown.
pub async fn serve(config: ServerConfig, state: AppState) -> crate::Result<()> {
    let addr = config.bind_address();
    let store: Arc<CredentialStore> = Arc::clone(state.auth.store());
    let router = create_router(state, &config.cors_origins);

    tracing::info!("Starting cachepilot-gateway API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    let served = if config.graceful_shutdown {
        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown_signal())
            .await
    } else {
        axum::serve(listener, service).await
    };

    if let Err(e) = store.flush() {
        tracing::error!("Failed to persist API key usage: {}", e);
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
