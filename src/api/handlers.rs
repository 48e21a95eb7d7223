//! REST API handlers.
//!
//! Handlers are thin: check the caller's scope, sanitize path and body
//! values, run one whitelisted command and wrap its output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{FromRef, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use super::types::{
    ApiResponse, BackupFileQuery, BackupRequest, DeleteQuery, RestoreRequest,
    TenantCreateRequest, TenantUpdateRequest,
};
use crate::config::Config;
use crate::error::GatewayError;
use crate::execution::{CliCommand, CommandExecutor, CommandInvocation, ExecutionResult};
use crate::security::{
    sanitize_file_path, sanitize_tenant_name, scopes, validate_backup_name, validate_memory_pair,
    AddressRateLimiter, AuditFileSink, AuthGate, Authenticated, CredentialStore, EventSink,
    KeyRateLimiter, SecurityEventLog, TracingSink,
};
use crate::Result;

/// Timeout for tenant creation and backups.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for restores.
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(300);

/// Settings read by handlers and middleware.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Echo internal error detail to callers.
    pub debug: bool,
    pub tenants_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            debug: false,
            tenants_dir: PathBuf::from("/var/cachepilot/tenants"),
            backups_dir: PathBuf::from("/var/cachepilot/backups"),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthGate>,
    pub limiter: Arc<AddressRateLimiter>,
    pub executor: Arc<CommandExecutor>,
    pub events: SecurityEventLog,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    /// Wire every component from a loaded configuration.
    ///
    /// Fails when the CLI tool is missing or a rate limit is malformed.
    /// A missing credential file is tolerated and yields an empty store.
    pub fn build(config: &Config, events: SecurityEventLog) -> Result<Self> {
        let address_limits = config.address_rate_limit()?;
        let trust_forwarded_for = address_limits.trust_forwarded_for;
        let max_tracked = address_limits.max_tracked_subjects;

        let store = Arc::new(CredentialStore::open(
            &config.security.api_key_file,
            config.key_cache_ttl(),
        ));
        let auth = AuthGate::new(
            store,
            KeyRateLimiter::new(config.key_rate_limit()?),
            events.clone(),
        )
        .with_max_tracked_addresses(max_tracked)
        .with_trust_forwarded_for(trust_forwarded_for);

        let executor = CommandExecutor::new(config.executor_config()?, events.clone())?;
        let limiter = AddressRateLimiter::new(address_limits, events.clone());

        Ok(Self {
            auth: Arc::new(auth),
            limiter: Arc::new(limiter),
            executor: Arc::new(executor),
            events,
            settings: Arc::new(config.api_settings()),
        })
    }

    /// [`build`](Self::build) with the tracing sink plus the configured audit file.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
        if let Some(ref path) = config.security.audit_log {
            sinks.push(Arc::new(AuditFileSink::open(path)?));
        }
        Self::build(config, SecurityEventLog::with_sinks(sinks))
    }
}

impl FromRef<AppState> for Arc<AuthGate> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.auth)
    }
}

type ApiResult = Result<Json<ApiResponse>>;

fn output_response(message: impl Into<String>, result: ExecutionResult) -> Json<ApiResponse> {
    Json(ApiResponse::ok(message).with_data(json!({ "output": result.output_trimmed() })))
}

/// Validate a tenant name and require its directory to exist.
fn existing_tenant(state: &AppState, raw_name: &str) -> Result<String> {
    let name = sanitize_tenant_name(raw_name)?;
    let dir = sanitize_file_path(&name, &state.settings.tenants_dir)?;
    if !dir.is_dir() {
        return Err(GatewayError::NotFound(format!("Tenant '{}'", name)));
    }
    Ok(name)
}

/// API information endpoint.
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "cachepilot-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Health check endpoint. Requires no key.
pub async fn health() -> Json<ApiResponse> {
    Json(ApiResponse::ok("API is healthy").with_data(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

// ============================================================================
// Tenants
// ============================================================================

pub async fn list_tenants(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult {
    identity.require(scopes::TENANTS_READ)?;

    let result = state
        .executor
        .execute(CliCommand::List, Vec::<String>::new())
        .await
        .into_result()?;
    let tenants: Vec<&str> = result.output_lines().collect();

    Ok(Json(
        ApiResponse::ok(format!("Found {} tenants", tenants.len()))
            .with_data(json!({ "tenants": tenants })),
    ))
}

pub async fn create_tenant(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(req): Json<TenantCreateRequest>,
) -> Result<(StatusCode, Json<ApiResponse>)> {
    identity.require(scopes::TENANTS_WRITE)?;

    let name = sanitize_tenant_name(&req.tenant_name)?;
    validate_memory_pair(req.maxmemory_mb, req.docker_limit_mb)?;

    let mut invocation = CommandInvocation::new(CliCommand::New)
        .args([
            name.clone(),
            req.maxmemory_mb.to_string(),
            req.docker_limit_mb.to_string(),
        ])?
        .timeout(LONG_TIMEOUT);
    if let Some(password) = req.password.as_deref().filter(|p| !p.is_empty()) {
        invocation = invocation.secret_arg(password)?;
    }

    state.executor.run(&invocation).await.into_result()?;
    tracing::info!(key_name = %identity.name(), "Tenant {} created", name);

    Ok((
        StatusCode::CREATED,
        Json(
            ApiResponse::ok(format!("Tenant '{}' created successfully", name)).with_data(json!({
                "tenant_name": name,
                "maxmemory_mb": req.maxmemory_mb,
                "docker_limit_mb": req.docker_limit_mb,
            })),
        ),
    ))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::TENANTS_READ)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let result = state
        .executor
        .execute(CliCommand::Status, [&name])
        .await
        .into_result()?;
    Ok(output_response(format!("Status of tenant '{}'", name), result))
}

pub async fn update_tenant(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
    Json(req): Json<TenantUpdateRequest>,
) -> ApiResult {
    identity.require(scopes::TENANTS_WRITE)?;
    let name = existing_tenant(&state, &tenant_name)?;
    validate_memory_pair(req.maxmemory_mb, req.docker_limit_mb)?;

    let result = state
        .executor
        .execute(
            CliCommand::SetMemory,
            [
                name.clone(),
                req.maxmemory_mb.to_string(),
                req.docker_limit_mb.to_string(),
            ],
        )
        .await
        .into_result()?;
    Ok(output_response(format!("Tenant '{}' updated", name), result))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult {
    identity.require(scopes::TENANTS_WRITE)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let mut args = vec![name.clone()];
    if query.force {
        args.push("--force".to_string());
    }
    let result = state
        .executor
        .execute(CliCommand::Rm, args)
        .await
        .into_result()?;
    tracing::info!(key_name = %identity.name(), "Tenant {} deleted", name);
    Ok(output_response(format!("Tenant '{}' deleted", name), result))
}

/// Lifecycle actions: start, stop, restart, rotate-password.
pub async fn tenant_action(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path((tenant_name, action)): Path<(String, String)>,
) -> ApiResult {
    let command = match action.as_str() {
        "start" => CliCommand::Start,
        "stop" => CliCommand::Stop,
        "restart" => CliCommand::Restart,
        "rotate-password" => CliCommand::Rotate,
        _ => return Err(GatewayError::NotFound(format!("Action '{}'", action))),
    };
    identity.require(scopes::TENANTS_WRITE)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let result = state
        .executor
        .execute(command, [&name])
        .await
        .into_result()?;
    Ok(output_response(
        format!("Action '{}' completed for tenant '{}'", action, name),
        result,
    ))
}

pub async fn tenant_handover(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::TENANTS_READ)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let result = state
        .executor
        .execute(CliCommand::Handover, [&name])
        .await
        .into_result()?;
    Ok(output_response(format!("Handover for tenant '{}'", name), result))
}

// ============================================================================
// Backups
// ============================================================================

pub async fn create_backup(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(req): Json<BackupRequest>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_WRITE)?;
    let name = existing_tenant(&state, &req.tenant_name)?;

    let result = state
        .executor
        .execute_with_timeout(CliCommand::Backup, LONG_TIMEOUT, [&name])
        .await
        .into_result()?;
    Ok(output_response(format!("Backup created for tenant '{}'", name), result))
}

pub async fn list_backups(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_READ)?;
    let name = sanitize_tenant_name(&tenant_name)?;

    let result = state
        .executor
        .execute(CliCommand::ListBackups, [&name])
        .await
        .into_result()?;
    let backups: Vec<&str> = result.output_lines().collect();
    Ok(Json(
        ApiResponse::ok(format!("Found {} backups", backups.len()))
            .with_data(json!({ "tenant_name": name, "backups": backups })),
    ))
}

pub async fn restore_backup(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(req): Json<RestoreRequest>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_WRITE)?;
    let name = existing_tenant(&state, &req.tenant_name)?;
    let backup = validate_backup_name(&req.backup_file)?;

    let result = state
        .executor
        .execute_with_timeout(CliCommand::Restore, RESTORE_TIMEOUT, [&name, &backup])
        .await
        .into_result()?;
    tracing::info!(key_name = %identity.name(), "Tenant {} restored from {}", name, backup);
    Ok(output_response(format!("Tenant '{}' restored", name), result))
}

pub async fn verify_backup(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Query(query): Query<BackupFileQuery>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_READ)?;
    let path = sanitize_file_path(&query.backup_file, &state.settings.backups_dir)?;
    let path = path.to_string_lossy().into_owned();

    let result = state
        .executor
        .execute(CliCommand::VerifyBackup, [&path])
        .await
        .into_result()?;
    Ok(output_response("Backup verified", result))
}

pub async fn enable_backups(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_WRITE)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let result = state
        .executor
        .execute(CliCommand::BackupEnable, [&name])
        .await
        .into_result()?;
    Ok(output_response(format!("Automated backups enabled for '{}'", name), result))
}

pub async fn disable_backups(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::BACKUPS_WRITE)?;
    let name = existing_tenant(&state, &tenant_name)?;

    let result = state
        .executor
        .execute(CliCommand::BackupDisable, [&name])
        .await
        .into_result()?;
    Ok(output_response(format!("Automated backups disabled for '{}'", name), result))
}

// ============================================================================
// Monitoring
// ============================================================================

pub async fn monitoring_health(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult {
    identity.require(scopes::MONITORING_READ)?;
    let data = state
        .executor
        .execute_json(CliCommand::Health, Vec::<String>::new())
        .await?;
    Ok(Json(ApiResponse::ok("Health check completed").with_data(data)))
}

pub async fn monitoring_stats(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult {
    identity.require(scopes::MONITORING_READ)?;
    let data = state
        .executor
        .execute_json(CliCommand::Stats, Vec::<String>::new())
        .await?;
    Ok(Json(ApiResponse::ok("Statistics retrieved").with_data(data)))
}

pub async fn tenant_metrics(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(tenant_name): Path<String>,
) -> ApiResult {
    identity.require(scopes::MONITORING_READ)?;
    let name = existing_tenant(&state, &tenant_name)?;
    let data = state
        .executor
        .execute_json(CliCommand::Metrics, [&name])
        .await?;
    Ok(Json(
        ApiResponse::ok(format!("Metrics for tenant '{}'", name)).with_data(data),
    ))
}
