//! Configuration management for cachepilot-gateway.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::{ApiSettings, ServerConfig};
use crate::cli::Args;
use crate::execution::ExecutorConfig;
use crate::security::{AddressLimitConfig, RateLimitConfig, RouteLimit, RouteRule};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerSection,
    /// Credentials, audit trail and rate limits.
    pub security: SecuritySection,
    /// Privileged CLI settings.
    pub executor: ExecutorSection,
    /// Data directories.
    pub paths: PathsSection,
    /// Logging configuration.
    pub logging: LoggingSection,
    pub environment: EnvironmentSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable graceful shutdown.
    pub graceful_shutdown: bool,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            graceful_shutdown: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Security configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// JSON file mapping key digests to key records.
    pub api_key_file: PathBuf,
    /// Seconds between credential file reloads.
    pub key_cache_ttl_secs: u64,
    /// Use the first `X-Forwarded-For` hop as the client address.
    pub trust_forwarded_for: bool,
    /// Optional hash-chained JSONL audit file.
    pub audit_log: Option<PathBuf>,
    /// Limit per API key and endpoint.
    pub key_rate_limit: KeyRateLimitSection,
    /// Limit per source address and path.
    pub address_rate_limit: AddressRateLimitSection,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            api_key_file: PathBuf::from("/etc/cachepilot/api-keys.json"),
            key_cache_ttl_secs: 30,
            trust_forwarded_for: true,
            audit_log: None,
            key_rate_limit: KeyRateLimitSection::default(),
            address_rate_limit: AddressRateLimitSection::default(),
        }
    }
}

/// Key-scoped rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRateLimitSection {
    /// Enable rate limiting.
    pub enabled: bool,
    /// Requests per window.
    pub requests_per_window: u32,
    /// Window size in seconds.
    pub window_secs: u64,
}

impl Default for KeyRateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 100,
            window_secs: 60,
        }
    }
}

/// Address-scoped rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressRateLimitSection {
    pub enabled: bool,
    /// Requests per window for unmatched paths.
    pub default_limit: u32,
    pub default_window_secs: u64,
    /// Escalation block length.
    pub block_duration_secs: u64,
    /// Cap on tracked `(address, path)` pairs.
    pub max_tracked_subjects: usize,
    /// Per-route overrides; longest prefix wins.
    pub routes: Vec<RouteSection>,
}

impl Default for AddressRateLimitSection {
    fn default() -> Self {
        let defaults = AddressLimitConfig::default();
        Self {
            enabled: true,
            default_limit: defaults.default_limit.limit,
            default_window_secs: defaults.default_limit.window.as_secs(),
            block_duration_secs: defaults.block_duration.as_secs(),
            max_tracked_subjects: defaults.max_tracked_subjects,
            routes: defaults
                .routes
                .iter()
                .map(|rule| RouteSection {
                    prefix: rule.prefix.clone(),
                    limit: rule.limit.limit,
                    window_secs: rule.limit.window.as_secs(),
                })
                .collect(),
        }
    }
}

/// One route override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSection {
    pub prefix: String,
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

/// Executor configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub cli_path: PathBuf,
    pub working_dir: PathBuf,
    pub default_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            cli_path: defaults.cli_path,
            working_dir: defaults.working_dir,
            default_timeout_secs: defaults.default_timeout.as_secs(),
        }
    }
}

/// Data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub tenants_dir: PathBuf,
    pub backups_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        let defaults = ApiSettings::default();
        Self {
            tenants_dir: defaults.tenants_dir,
            backups_dir: defaults.backups_dir,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Runtime environment flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Echo internal error detail in responses. Never enable in production.
    pub debug: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("CACHEPILOT_HOST") {
            self.server.host = host;
        }

        if let Some(port) = var("CACHEPILOT_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Some(path) = var("CACHEPILOT_API_KEY_FILE").filter(|p| !p.is_empty()) {
            self.security.api_key_file = PathBuf::from(path);
        }

        if let Some(path) = var("CACHEPILOT_CLI").filter(|p| !p.is_empty()) {
            self.executor.cli_path = PathBuf::from(path);
        }

        if let Some(level) = var("CACHEPILOT_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }

        if let Some(debug) = var("CACHEPILOT_DEBUG") {
            self.environment.debug = parse_flag(&debug);
        }

        if let Some(dir) = var("TENANTS_DIR").filter(|p| !p.is_empty()) {
            self.paths.tenants_dir = PathBuf::from(dir);
        }

        if let Some(dir) = var("BACKUPS_DIR").filter(|p| !p.is_empty()) {
            self.paths.backups_dir = PathBuf::from(dir);
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }

        if let Some(port) = args.port {
            self.server.port = port;
        }

        if let Some(ref path) = args.key_file {
            self.security.api_key_file = path.clone();
        }

        if args.debug {
            self.environment.debug = true;
        }

        if args.no_rate_limit {
            self.security.key_rate_limit.enabled = false;
            self.security.address_rate_limit.enabled = false;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Config::default();

        // Load from config file if specified
        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        // Apply environment variable overrides
        config.apply_env();

        // Apply CLI argument overrides (highest priority)
        config.apply_args(args);

        Ok(config)
    }

    /// Convert to ServerConfig for the API server.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))?;

        Ok(ServerConfig {
            host: host.to_string(),
            port: self.server.port,
            cors_origins: self.server.cors_origins.clone(),
            graceful_shutdown: self.server.graceful_shutdown,
        })
    }

    /// Layer A settings.
    pub fn key_rate_limit(&self) -> Result<RateLimitConfig, ConfigError> {
        let section = &self.security.key_rate_limit;
        if section.enabled && (section.requests_per_window == 0 || section.window_secs == 0) {
            return Err(ConfigError::InvalidRateLimit("key".to_string()));
        }
        Ok(RateLimitConfig {
            enabled: section.enabled,
            max_requests: section.requests_per_window,
            window: Duration::from_secs(section.window_secs),
            max_tracked_subjects: self.security.address_rate_limit.max_tracked_subjects,
        })
    }

    /// Layer B settings.
    pub fn address_rate_limit(&self) -> Result<AddressLimitConfig, ConfigError> {
        let section = &self.security.address_rate_limit;
        if section.enabled && (section.default_limit == 0 || section.default_window_secs == 0) {
            return Err(ConfigError::InvalidRateLimit("default".to_string()));
        }
        if let Some(bad) = section
            .routes
            .iter()
            .find(|r| r.limit == 0 || r.window_secs == 0 || !r.prefix.starts_with('/'))
        {
            return Err(ConfigError::InvalidRateLimit(bad.prefix.clone()));
        }

        Ok(AddressLimitConfig {
            enabled: section.enabled,
            default_limit: RouteLimit::new(section.default_limit, section.default_window_secs),
            routes: section
                .routes
                .iter()
                .map(|r| RouteRule::new(r.prefix.clone(), r.limit, r.window_secs))
                .collect(),
            block_duration: Duration::from_secs(section.block_duration_secs),
            max_tracked_subjects: section.max_tracked_subjects,
            trust_forwarded_for: self.security.trust_forwarded_for,
        })
    }

    pub fn executor_config(&self) -> Result<ExecutorConfig, ConfigError> {
        if self.executor.default_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(ExecutorConfig {
            cli_path: self.executor.cli_path.clone(),
            working_dir: self.executor.working_dir.clone(),
            default_timeout: Duration::from_secs(self.executor.default_timeout_secs),
        })
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            debug: self.environment.debug,
            tenants_dir: self.paths.tenants_dir.clone(),
            backups_dir: self.paths.backups_dir.clone(),
        }
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.security.key_cache_ttl_secs)
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Invalid host address.
    InvalidHost(String),
    /// A rate limit with a zero limit or window, or a malformed prefix.
    InvalidRateLimit(String),
    /// A zero command timeout.
    InvalidTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidHost(host) => write!(f, "invalid host address: {}", host),
            Self::InvalidRateLimit(route) => write!(f, "invalid rate limit for route: {}", route),
            Self::InvalidTimeout => write!(f, "executor timeout must be at least one second"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(
            config.security.api_key_file,
            PathBuf::from("/etc/cachepilot/api-keys.json")
        );
        assert_eq!(config.security.key_cache_ttl_secs, 30);
        assert!(config.security.key_rate_limit.enabled);
        assert_eq!(config.security.address_rate_limit.block_duration_secs, 900);
        assert_eq!(config.security.address_rate_limit.routes.len(), 4);
        assert_eq!(config.executor.default_timeout_secs, 30);
        assert!(!config.environment.debug);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "server": {
                "host": "0.0.0.0",
                "port": 8080
            },
            "security": {
                "api_key_file": "/srv/keys.json",
                "trust_forwarded_for": false,
                "address_rate_limit": {
                    "routes": [{"prefix": "/api/v1/tenants", "limit": 10}]
                }
            },
            "logging": {"level": "debug", "format": "json"}
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.security.api_key_file, PathBuf::from("/srv/keys.json"));
        assert!(!config.security.trust_forwarded_for);
        assert_eq!(config.logging.format, LogFormat::Json);

        let limits = config.address_rate_limit().unwrap();
        assert_eq!(limits.routes.len(), 1);
        assert_eq!(limits.limit_for("/api/v1/tenants/x").limit, 10);
        assert_eq!(limits.limit_for("/api/v1/tenants/x").window.as_secs(), 60);
        assert!(!limits.trust_forwarded_for);
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{
            "server": {
                "port": 9000
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1"); // Default
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_apply_env_from() {
        let vars: HashMap<&str, &str> = [
            ("CACHEPILOT_PORT", "9100"),
            ("CACHEPILOT_API_KEY_FILE", "/tmp/keys.json"),
            ("CACHEPILOT_CLI", "/usr/local/bin/cachepilot"),
            ("CACHEPILOT_DEBUG", "true"),
            ("TENANTS_DIR", "/data/tenants"),
            ("RUST_LOG", "warn"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.security.api_key_file, PathBuf::from("/tmp/keys.json"));
        assert_eq!(config.executor.cli_path, PathBuf::from("/usr/local/bin/cachepilot"));
        assert!(config.environment.debug);
        assert_eq!(config.paths.tenants_dir, PathBuf::from("/data/tenants"));
        assert_eq!(config.paths.backups_dir, PathBuf::from("/var/cachepilot/backups"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.server.host = "10.0.0.1".to_string();
        let args = Args {
            port: Some(5000),
            key_file: Some(PathBuf::from("/tmp/k.json")),
            no_rate_limit: true,
            debug: true,
            ..Args::default()
        };

        config.apply_args(&args);

        // Unset args leave earlier layers alone.
        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.security.api_key_file, PathBuf::from("/tmp/k.json"));
        assert!(!config.security.key_rate_limit.enabled);
        assert!(!config.security.address_rate_limit.enabled);
        assert!(config.environment.debug);
    }

    #[test]
    fn test_to_server_config() {
        let config = Config::default();
        let server_config = config.to_server_config().unwrap();

        assert_eq!(server_config.host, "127.0.0.1");
        assert_eq!(server_config.port, 8000);
        assert!(server_config.graceful_shutdown);
    }

    #[test]
    fn test_invalid_host() {
        let mut config = Config::default();
        config.server.host = "not-an-ip".to_string();

        let result = config.to_server_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_route_limit() {
        let mut config = Config::default();
        config.security.address_rate_limit.routes.push(RouteSection {
            prefix: "/api/v1/x".into(),
            limit: 0,
            window_secs: 60,
        });
        assert!(matches!(
            config.address_rate_limit(),
            Err(ConfigError::InvalidRateLimit(_))
        ));
    }

    #[test]
    fn test_zero_key_limit_and_timeout_rejected() {
        let mut config = Config::default();
        config.security.key_rate_limit.requests_per_window = 0;
        assert!(matches!(
            config.key_rate_limit(),
            Err(ConfigError::InvalidRateLimit(_))
        ));
        // A disabled layer is never consulted.
        config.security.key_rate_limit.enabled = false;
        assert!(config.key_rate_limit().is_ok());

        let mut config = Config::default();
        config.security.key_rate_limit.window_secs = 0;
        assert!(config.key_rate_limit().is_err());

        let mut config = Config::default();
        config.executor.default_timeout_secs = 0;
        assert!(matches!(
            config.executor_config(),
            Err(ConfigError::InvalidTimeout)
        ));
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        assert_eq!(config.key_rate_limit().unwrap().max_requests, 100);
        assert_eq!(config.key_cache_ttl(), Duration::from_secs(30));
        assert_eq!(
            config.executor_config().unwrap().default_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.address_rate_limit().unwrap().limit_for("/api/v1/system/x").limit,
            30
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"host\""));
        assert!(json.contains("\"api_key_file\""));
        assert!(json.contains("\"compact\""));
    }
}
