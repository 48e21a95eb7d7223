//! Input validation and argument sanitization.
//!
//! Every value that can reach the privileged CLI passes through one of these
//! functions first. They are pure: no I/O beyond path resolution, no state.

use std::io;
use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Minimum tenant name length.
pub const TENANT_NAME_MIN: usize = 3;
/// Maximum tenant name length.
pub const TENANT_NAME_MAX: usize = 63;

/// Names that can never be used as tenant identifiers.
pub const RESERVED_NAMES: &[&str] = &[
    "test", "prod", "dev", "staging", "localhost", "redis", "admin",
];

/// Inclusive memory limit bounds in megabytes.
pub const MEMORY_MIN_MB: i64 = 64;
pub const MEMORY_MAX_MB: i64 = 65536;

/// Inclusive port bounds. Privileged ports are never handed out.
pub const PORT_MIN: i64 = 1024;
pub const PORT_MAX: i64 = 65535;

/// Ports used by the host itself.
pub const RESERVED_PORTS: &[i64] = &[6379, 8000, 8001, 8080, 8443, 9090];

/// Characters rejected in any argument passed to the CLI.
///
/// This is a denylist. An allowlist such as `^[A-Za-z0-9._-]+$` would be
/// stricter but would also reject tenant passwords containing punctuation.
pub const DANGEROUS_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '\n', '\r', '>', '<', '(', ')', '{', '}', '\0',
];

const BACKUP_NAME_MAX: usize = 255;
const DOMAIN_MAX: usize = 253;
const EMAIL_MAX: usize = 254;
const PASSWORD_MIN: usize = 16;
const CERT_EXTENSIONS: &[&str] = &["pem", "crt", "key"];

static TENANT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$").expect("valid tenant regex"));

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("valid domain regex")
});

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("valid email regex")
});

static BACKUP_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+\.(?:tar\.gz|zip)$").expect("valid backup name regex")
});

static SUSPICIOUS_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\.\./\.\.",
        r"<script",
        r"javascript:",
        r"onclick=",
        r"onerror=",
        r"eval\(",
        r"exec\(",
        r"system\(",
        r"passthru\(",
        r"shell_exec\(",
        r"\$\{",
        r"`[^`]*`",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid suspicious pattern"))
    .collect()
});

/// Validation failures. Messages never contain secrets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required value was empty.
    #[error("{0} must be a non-empty string")]
    Empty(&'static str),

    /// Tenant name length out of bounds.
    #[error("Tenant name must be {TENANT_NAME_MIN}-{TENANT_NAME_MAX} characters long")]
    NameLength(usize),

    /// Tenant name has invalid syntax.
    #[error(
        "Tenant name must start with a letter, contain only lowercase letters, \
         numbers, and hyphens, and not end with a hyphen"
    )]
    NameSyntax,

    /// Tenant name contains `--`.
    #[error("Tenant name cannot contain consecutive hyphens")]
    ConsecutiveHyphens,

    /// Tenant name is reserved.
    #[error("Tenant name '{0}' is reserved")]
    ReservedName(String),

    /// Resolved path escapes its base directory.
    #[error("Path traversal detected")]
    PathTraversal,

    /// Path could not be resolved.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Numeric value below its inclusive minimum.
    #[error("{field} must be at least {min}")]
    BelowMinimum { field: &'static str, min: i64 },

    /// Numeric value above its inclusive maximum.
    #[error("{field} must be {max} or lower")]
    AboveMaximum { field: &'static str, max: i64 },

    /// Port is reserved for system use.
    #[error("Port {0} is reserved for system use")]
    ReservedPort(i64),

    /// Container limit too small for the configured memory limit.
    #[error("docker_limit_mb must be at least 1.5x maxmemory_mb")]
    ContainerLimitTooSmall,

    /// Argument contains a shell metacharacter.
    #[error("Argument contains dangerous character: {0:?}")]
    DangerousCharacter(char),

    /// Argument contains `..`.
    #[error("Argument contains directory traversal pattern")]
    TraversalPattern,

    /// Free-form format failure (domain, email, backup name, ...).
    #[error("{0}")]
    Format(&'static str),

    /// Value too long.
    #[error("{field} too long (max {max} characters)")]
    TooLong { field: &'static str, max: usize },

    /// Password does not meet the strength policy.
    #[error("Password must {0}")]
    WeakPassword(&'static str),

    /// Request carries a suspicious query parameter.
    #[error("Invalid request parameters")]
    SuspiciousInput,
}

/// Validate and normalize a tenant identifier.
///
/// Input is trimmed and lowercased before the checks run.
pub fn sanitize_tenant_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(ValidationError::Empty("Tenant name"));
    }

    if name.len() < TENANT_NAME_MIN || name.len() > TENANT_NAME_MAX {
        return Err(ValidationError::NameLength(name.len()));
    }

    if !TENANT_NAME_RE.is_match(&name) {
        return Err(ValidationError::NameSyntax);
    }

    if name.contains("--") {
        return Err(ValidationError::ConsecutiveHyphens);
    }

    if RESERVED_NAMES.contains(&name.as_str()) {
        return Err(ValidationError::ReservedName(name));
    }

    Ok(name)
}

/// Resolve `path` under `base_dir` and reject anything that escapes it.
///
/// The candidate is joined first and resolved afterwards, so `..` segments
/// and symlinks inside the base are both accounted for.
pub fn sanitize_file_path(
    path: &str,
    base_dir: impl AsRef<Path>,
) -> Result<PathBuf, ValidationError> {
    if path.trim().is_empty() {
        return Err(ValidationError::Empty("Path"));
    }
    let base_dir = base_dir.as_ref();
    if base_dir.as_os_str().is_empty() {
        return Err(ValidationError::Empty("Base directory"));
    }
    if path.contains('\0') {
        return Err(ValidationError::DangerousCharacter('\0'));
    }

    let base = resolve_lenient(base_dir)
        .map_err(|e| ValidationError::InvalidPath(e.kind().to_string()))?;
    let target = resolve_lenient(&base.join(path))
        .map_err(|e| ValidationError::InvalidPath(e.kind().to_string()))?;

    if !target.starts_with(&base) {
        return Err(ValidationError::PathTraversal);
    }

    Ok(target)
}

/// Canonicalize a path that may not fully exist.
///
/// Existing prefixes are canonicalized (following symlinks); missing
/// components are kept lexically. A `..` that climbs back out of the missing
/// part resumes canonicalization from there.
fn resolve_lenient(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut resolved = PathBuf::new();
    // Trailing components of `resolved` that do not exist on disk.
    let mut missing = 0usize;

    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                resolved.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                missing = missing.saturating_sub(1);
            }
            Component::Normal(part) => {
                resolved.push(part);
                if missing > 0 {
                    missing += 1;
                    continue;
                }
                match resolved.canonicalize() {
                    Ok(real) => resolved = real,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => missing = 1,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(resolved)
}

/// Check an integer against inclusive bounds.
pub fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ValidationError> {
    if value < min {
        return Err(ValidationError::BelowMinimum { field, min });
    }
    if value > max {
        return Err(ValidationError::AboveMaximum { field, max });
    }
    Ok(value)
}

/// Validate a memory limit in megabytes.
pub fn validate_memory_limit(mb: i64) -> Result<i64, ValidationError> {
    check_range("Memory limit (MB)", mb, MEMORY_MIN_MB, MEMORY_MAX_MB)
}

/// Validate a Redis memory limit together with its container limit.
pub fn validate_memory_pair(maxmemory_mb: i64, docker_limit_mb: i64) -> Result<(), ValidationError> {
    validate_memory_limit(maxmemory_mb)?;
    validate_memory_limit(docker_limit_mb)?;
    // docker >= 1.5 * maxmemory, kept in integers
    if docker_limit_mb * 2 < maxmemory_mb * 3 {
        return Err(ValidationError::ContainerLimitTooSmall);
    }
    Ok(())
}

/// Validate a port number.
pub fn validate_port(port: i64) -> Result<u16, ValidationError> {
    check_range("Port", port, PORT_MIN, PORT_MAX)?;
    if RESERVED_PORTS.contains(&port) {
        return Err(ValidationError::ReservedPort(port));
    }
    Ok(port as u16)
}

/// Sanitize a single CLI argument.
///
/// Returns the trimmed argument, or an error if it contains a shell
/// metacharacter or a `..` sequence.
pub fn sanitize_command_argument(arg: &str) -> Result<String, ValidationError> {
    if let Some(c) = arg.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(ValidationError::DangerousCharacter(c));
    }

    if arg.contains("..") {
        return Err(ValidationError::TraversalPattern);
    }

    Ok(arg.trim().to_string())
}

/// Validate a DNS name.
pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    let domain = domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(ValidationError::Empty("Domain"));
    }
    if domain.len() > DOMAIN_MAX {
        return Err(ValidationError::TooLong {
            field: "Domain name",
            max: DOMAIN_MAX,
        });
    }
    if !DOMAIN_RE.is_match(&domain) {
        return Err(ValidationError::Format("Invalid domain name format"));
    }
    Ok(())
}

/// Validate an email address.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ValidationError::Empty("Email"));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(ValidationError::Format("Invalid email address format"));
    }
    if email.len() > EMAIL_MAX {
        return Err(ValidationError::TooLong {
            field: "Email address",
            max: EMAIL_MAX,
        });
    }
    Ok(())
}

/// Validate a backup archive file name (no directories).
pub fn validate_backup_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Empty("Backup name"));
    }
    if name.len() > BACKUP_NAME_MAX {
        return Err(ValidationError::TooLong {
            field: "Backup name",
            max: BACKUP_NAME_MAX,
        });
    }
    if !BACKUP_NAME_RE.is_match(name) {
        return Err(ValidationError::Format("Invalid backup file name format"));
    }
    Ok(name.to_string())
}

/// Validate a certificate path under the CA directory.
pub fn validate_tls_cert_path(
    path: &str,
    base_dir: impl AsRef<Path>,
) -> Result<PathBuf, ValidationError> {
    let resolved = sanitize_file_path(path, base_dir)?;
    let allowed = resolved
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| CERT_EXTENSIONS.contains(&e))
        .unwrap_or(false);
    if !allowed {
        return Err(ValidationError::Format("Invalid certificate file extension"));
    }
    Ok(resolved)
}

/// Validate a tenant password against the strength policy.
pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::Empty("Password"));
    }
    if password.chars().count() < PASSWORD_MIN {
        return Err(ValidationError::WeakPassword("be at least 16 characters"));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::WeakPassword("contain lowercase letters"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::WeakPassword("contain uppercase letters"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::WeakPassword("contain numbers"));
    }
    if !password.chars().any(|c| "!@#$%^&*()_+-=[]{};:,.<>?".contains(c)) {
        return Err(ValidationError::WeakPassword("contain special characters"));
    }
    Ok(())
}

/// Check if a query value looks like an injection or traversal probe.
pub fn looks_suspicious(value: &str) -> bool {
    let lower = value.to_lowercase();
    SUSPICIOUS_RE.iter().any(|re| re.is_match(&lower))
}
