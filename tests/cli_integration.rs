//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing, configuration layering and
//! the offline key management flow.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::{tempdir, NamedTempFile};

use cachepilot_gateway::cli::{parse_args_from, Args, KeysCommand};
use cachepilot_gateway::config::Config;
use cachepilot_gateway::security::{scopes, CredentialStore};

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("cachepilot-gateway")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.host.is_none());
    assert!(result.port.is_none());
    assert!(!result.debug);
    assert!(!result.no_rate_limit);
    assert!(result.config.is_none());
    assert!(result.key_file.is_none());
    assert!(result.command.is_none());
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-H",
        "0.0.0.0",
        "-p",
        "8080",
        "--key-file",
        "/tmp/keys.json",
        "-l",
        "debug",
        "--no-rate-limit",
        "--debug",
    ]))
    .unwrap();

    assert_eq!(result.host.unwrap().to_string(), "0.0.0.0");
    assert_eq!(result.port, Some(8080));
    assert_eq!(result.key_file, Some(PathBuf::from("/tmp/keys.json")));
    assert_eq!(result.log_level, Some("debug".to_string()));
    assert!(result.no_rate_limit);
    assert!(result.debug);
}

#[test]
fn test_cli_invalid_port() {
    let result = parse_args_from(args(&["-p", "not-a-number"]));
    assert!(result.is_err());
}

#[test]
fn test_cli_invalid_host() {
    let result = parse_args_from(args(&["-H", "not-an-ip"]));
    assert!(result.is_err());
}

#[test]
fn test_cli_keys_issue_with_scopes() {
    let result = parse_args_from(args(&[
        "--key-file",
        "/tmp/keys.json",
        "keys",
        "issue",
        "grafana",
        "-P",
        "monitoring:read",
        "--permission",
        "tenants:read",
    ]))
    .unwrap();

    assert_eq!(
        result.command,
        Some(KeysCommand::Issue {
            name: "grafana".to_string(),
            permissions: vec!["monitoring:read".to_string(), "tenants:read".to_string()],
        })
    );
}

#[test]
fn test_cli_keys_list_and_revoke() {
    let list = parse_args_from(args(&["keys", "list"])).unwrap();
    assert_eq!(list.command, Some(KeysCommand::List));

    let revoke = parse_args_from(args(&["keys", "revoke", "abc"])).unwrap();
    assert_eq!(
        revoke.command,
        Some(KeysCommand::Revoke {
            key: "abc".to_string()
        })
    );
}

#[test]
fn test_cli_keys_errors() {
    assert!(parse_args_from(args(&["keys"])).is_err());
    assert!(parse_args_from(args(&["keys", "issue"])).is_err());
    assert!(parse_args_from(args(&["keys", "rotate"])).is_err());
    assert!(parse_args_from(args(&["serve"])).is_err());
    assert!(parse_args_from(args(&["keys", "list", "extra"])).is_err());
    assert!(parse_args_from(args(&["-P", "tenants:read"])).is_err());
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let json = r#"{
        "server": {
            "host": "192.168.1.100",
            "port": 9000,
            "graceful_shutdown": false
        },
        "security": {
            "api_key_file": "/srv/cachepilot/keys.json",
            "key_cache_ttl_secs": 5,
            "key_rate_limit": {
                "enabled": true,
                "requests_per_window": 50,
                "window_secs": 30
            },
            "address_rate_limit": {
                "default_limit": 70,
                "block_duration_secs": 60
            }
        },
        "executor": {
            "cli_path": "/usr/local/bin/cachepilot",
            "default_timeout_secs": 10
        },
        "logging": {
            "level": "debug"
        }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.server.host, "192.168.1.100");
    assert_eq!(config.server.port, 9000);
    assert!(!config.server.graceful_shutdown);
    assert_eq!(config.key_cache_ttl(), Duration::from_secs(5));

    let key_limits = config.key_rate_limit().unwrap();
    assert_eq!(key_limits.max_requests, 50);
    assert_eq!(key_limits.window, Duration::from_secs(30));

    let address_limits = config.address_rate_limit().unwrap();
    assert_eq!(address_limits.default_limit.limit, 70);
    assert_eq!(address_limits.block_duration, Duration::from_secs(60));
    // Unspecified routes keep their defaults.
    assert_eq!(address_limits.limit_for("/api/v1/monitoring/stats").limit, 200);

    let executor = config.executor_config().unwrap();
    assert_eq!(executor.cli_path, PathBuf::from("/usr/local/bin/cachepilot"));
    assert_eq!(executor.default_timeout, Duration::from_secs(10));
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_config_priority_cli_over_file() {
    let json = r#"{
        "server": {
            "host": "10.0.0.1",
            "port": 5000
        }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let mut config = Config::from_file(file.path()).unwrap();
    let args = Args {
        host: Some("192.168.1.1".parse().unwrap()),
        port: Some(8080),
        ..Args::default()
    };
    config.apply_args(&args);

    assert_eq!(config.server.host, "192.168.1.1");
    assert_eq!(config.server.port, 8080);
}

#[test]
fn test_config_file_survives_unset_args() {
    let json = r#"{"server": {"host": "10.0.0.1", "port": 5000}}"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let mut config = Config::from_file(file.path()).unwrap();
    config.apply_args(&Args::default());

    assert_eq!(config.server.host, "10.0.0.1");
    assert_eq!(config.server.port, 5000);
}

#[test]
fn test_config_env_between_file_and_cli() {
    let mut config = Config::default();
    config.apply_env_from(|key| match key {
        "CACHEPILOT_PORT" => Some("9001".to_string()),
        "CACHEPILOT_HOST" => Some("10.1.1.1".to_string()),
        _ => None,
    });
    config.apply_args(&Args {
        port: Some(9002),
        ..Args::default()
    });

    assert_eq!(config.server.host, "10.1.1.1");
    assert_eq!(config.server.port, 9002);
}

#[test]
fn test_config_no_rate_limit_disables_both_layers() {
    let mut config = Config::default();
    config.apply_args(&Args {
        no_rate_limit: true,
        ..Args::default()
    });

    assert!(!config.key_rate_limit().unwrap().enabled);
    assert!(!config.address_rate_limit().unwrap().enabled);
}

#[test]
fn test_config_to_server_config() {
    let mut config = Config::default();
    config.apply_args(&Args {
        host: Some("0.0.0.0".parse().unwrap()),
        port: Some(8080),
        ..Args::default()
    });

    let server_config = config.to_server_config().unwrap();

    assert_eq!(server_config.host, "0.0.0.0");
    assert_eq!(server_config.port, 8080);
    assert_eq!(server_config.bind_address(), "0.0.0.0:8080");
}

#[test]
fn test_config_load_missing_file_fails() {
    let args = Args {
        config: Some(PathBuf::from("/nonexistent/cachepilot-gateway.json")),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

// ============================================================================
// Configuration Serialization Tests
// ============================================================================

#[test]
fn test_config_roundtrip() {
    let original = Config::default();
    let json = serde_json::to_string(&original).unwrap();
    let loaded: Config = serde_json::from_str(&json).unwrap();

    assert_eq!(original.server.host, loaded.server.host);
    assert_eq!(original.server.port, loaded.server.port);
    assert_eq!(
        original.security.address_rate_limit.routes,
        loaded.security.address_rate_limit.routes
    );
}

#[test]
fn test_config_partial_deserialization() {
    let json = r#"{"server": {"port": 9999}}"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.server.port, 9999);
    assert_eq!(config.server.host, "127.0.0.1"); // Default
    assert!(config.server.graceful_shutdown); // Default
}

// ============================================================================
// Key Management Flow
// ============================================================================

#[test]
fn test_keys_issue_list_revoke_flow() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("keys.json");

    let store = CredentialStore::open(&path, Duration::ZERO);
    let key = store
        .issue("ci", &[scopes::TENANTS_READ.to_string()])
        .unwrap();

    // A second process sees the key through the file.
    let other = CredentialStore::open(&path, Duration::ZERO);
    let records = other.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "ci");
    assert_eq!(records[0].permissions, vec!["tenants:read".to_string()]);

    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(!on_disk.contains(&key));

    assert!(other.revoke(&key).unwrap());
    assert!(store.validate(&key).unwrap().is_none());
}
