//! API request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope used by every JSON response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Machine-readable error code on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failure(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(code.into()),
        }
    }
}

fn default_maxmemory() -> i64 {
    256
}

fn default_docker_limit() -> i64 {
    512
}

/// Request to create a tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantCreateRequest {
    pub tenant_name: String,
    #[serde(default = "default_maxmemory")]
    pub maxmemory_mb: i64,
    #[serde(default = "default_docker_limit")]
    pub docker_limit_mb: i64,
    /// Optional initial password; generated by the CLI when absent.
    #[serde(default)]
    pub password: Option<String>,
}

/// Request to change a tenant's memory limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantUpdateRequest {
    pub maxmemory_mb: i64,
    pub docker_limit_mb: i64,
}

/// Query for tenant deletion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// Request to back up a tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub tenant_name: String,
}

/// Request to restore a tenant from a backup file.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreRequest {
    pub tenant_name: String,
    pub backup_file: String,
}

/// Query naming a backup file.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupFileQuery {
    pub backup_file: String,
}
