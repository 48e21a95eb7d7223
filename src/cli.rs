//! Command-line interface for cachepilot-gateway.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

/// Offline credential management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// Issue a key and print it once.
    Issue {
        name: String,
        permissions: Vec<String>,
    },
    /// Revoke a raw key.
    Revoke { key: String },
    /// List key metadata.
    List,
}

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Host address to bind to.
    pub host: Option<IpAddr>,
    /// Port to listen on.
    pub port: Option<u16>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Credential file (overrides config file).
    pub key_file: Option<PathBuf>,
    /// Echo internal error detail in responses.
    pub debug: bool,
    /// Disable both rate limiting layers.
    pub no_rate_limit: bool,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
    /// `keys` subcommand; `None` runs the server.
    pub command: Option<KeysCommand>,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut positionals: Vec<String> = Vec::new();
    let mut permissions: Vec<String> = Vec::new();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('H') | Long("host") => {
                let value: String = parser.value()?.parse()?;
                result.host = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("host", value))?,
                );
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Long("key-file") => {
                result.key_file = Some(parser.value()?.parse()?);
            }
            Long("debug") => {
                result.debug = true;
            }
            Long("no-rate-limit") => {
                result.no_rate_limit = true;
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Short('P') | Long("permission") => {
                permissions.push(parser.value()?.parse()?);
            }
            Value(val) => {
                positionals.push(val.to_string_lossy().into());
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    result.command = parse_command(positionals, permissions)?;
    Ok(result)
}

fn parse_command(
    positionals: Vec<String>,
    permissions: Vec<String>,
) -> Result<Option<KeysCommand>, ArgsError> {
    let mut words = positionals.into_iter();
    let stray_permissions = !permissions.is_empty();

    let Some(first) = words.next() else {
        if stray_permissions {
            return Err(ArgsError::UnexpectedArgument("--permission".into()));
        }
        return Ok(None);
    };
    if first != "keys" {
        return Err(ArgsError::UnexpectedArgument(first));
    }

    let action = words.next().ok_or(ArgsError::MissingArgument("keys action"))?;
    let command = match action.as_str() {
        "issue" => KeysCommand::Issue {
            name: words.next().ok_or(ArgsError::MissingArgument("key name"))?,
            permissions,
        },
        "revoke" | "list" if stray_permissions => {
            return Err(ArgsError::UnexpectedArgument("--permission".into()));
        }
        "revoke" => KeysCommand::Revoke {
            key: words.next().ok_or(ArgsError::MissingArgument("key"))?,
        },
        "list" => KeysCommand::List,
        _ => return Err(ArgsError::UnexpectedArgument(action)),
    };

    if let Some(extra) = words.next() {
        return Err(ArgsError::UnexpectedArgument(extra));
    }
    Ok(Some(command))
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"cachepilot-gateway {version}
Security gateway fronting the CachePilot management CLI

USAGE:
    cachepilot-gateway [OPTIONS]
    cachepilot-gateway [OPTIONS] keys issue <NAME> [--permission <SCOPE>]...
    cachepilot-gateway [OPTIONS] keys revoke [--] <KEY>
    cachepilot-gateway [OPTIONS] keys list

OPTIONS:
    -H, --host <ADDR>        Host address to bind [default: 127.0.0.1]
    -p, --port <PORT>        Port to listen on [default: 8000]
    -c, --config <FILE>      Path to configuration file (JSON)
    -l, --log-level <LVL>    Log level (error, warn, info, debug, trace)
        --key-file <FILE>    API key store [default: /etc/cachepilot/api-keys.json]
        --debug              Include internal error detail in responses
        --no-rate-limit      Disable rate limiting
    -P, --permission <SCOPE> Scope for `keys issue` (repeatable) [default: *]
    -h, --help               Print help
    -V, --version            Print version

SCOPES:
    tenants:read, tenants:write, backups:read, backups:write, monitoring:read, *

ENVIRONMENT VARIABLES:
    CACHEPILOT_HOST          Host address (overrides config)
    CACHEPILOT_PORT          Port number (overrides config)
    CACHEPILOT_API_KEY_FILE  API key store (overrides config)
    CACHEPILOT_CLI           Path of the CachePilot CLI
    CACHEPILOT_LOG_LEVEL     Log level (overrides config)
    CACHEPILOT_DEBUG         Set to 1/true for debug error detail
    TENANTS_DIR              Tenant data directory
    BACKUPS_DIR              Backup directory
    RUST_LOG                 Alternative log level setting

EXAMPLES:
    # Start with defaults (localhost:8000)
    cachepilot-gateway

    # Listen on all interfaces behind a reverse proxy
    cachepilot-gateway -H 0.0.0.0 -c /etc/cachepilot/gateway.json

    # Issue a read-only monitoring key
    cachepilot-gateway keys issue grafana --permission monitoring:read
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("cachepilot-gateway {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
    /// Subcommand is missing a required value.
    MissingArgument(&'static str),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
            Self::MissingArgument(what) => write!(f, "missing {}", what),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
