//! Security event trail.
//!
//! Every auth decision, abuse escalation and privileged command invocation
//! produces one [`SecurityEvent`]. Events are write-once: sinks receive a
//! shared reference and may only forward or persist it.
//!
//! Two production sinks exist:
//!
//! - [`TracingSink`] writes a structured `tracing` event on the `security`
//!   target, at the level matching the event severity.
//! - [`AuditFileSink`] appends JSONL lines to a file. Each line carries the
//!   SHA-256 of the previous line (`prev_sha256`), so edits or deletions
//!   break the chain and are detected by [`verify_audit_chain`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::Result;

/// Chain link used by the first audit line.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Kinds of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A key was validated.
    AuthSuccess,
    /// A key was missing or did not match.
    AuthFailure,
    /// Repeated auth failures from one address.
    AuthAbuse,
    /// Privileged command exited zero.
    CommandExecuted,
    /// Privileged command was rejected, failed or timed out.
    CommandFailed,
    /// A request was refused by a rate limit.
    RateLimitExceeded,
    /// An address was placed under an escalation block.
    AddressBlocked,
    /// A request carried injection markers and was refused.
    SuspiciousRequest,
    /// An unexpected error reached the HTTP boundary.
    UnhandledError,
}

impl EventType {
    /// Wire name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuthSuccess => "auth_success",
            EventType::AuthFailure => "auth_failure",
            EventType::AuthAbuse => "auth_abuse",
            EventType::CommandExecuted => "command_executed",
            EventType::CommandFailed => "command_failed",
            EventType::RateLimitExceeded => "rate_limit_exceeded",
            EventType::AddressBlocked => "address_blocked",
            EventType::SuspiciousRequest => "suspicious_request",
            EventType::UnhandledError => "unhandled_error",
        }
    }
}

/// One immutable security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub source_address: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl SecurityEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: EventType, source_address: impl Into<String>, severity: Severity) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            source_address: source_address.into(),
            severity,
            details: Map::new(),
        }
    }

    /// Attach a detail field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Look up a detail field.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

/// Destination for security events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SecurityEvent);
}

/// Writes events to the `security` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &SecurityEvent) {
        let details = Value::Object(event.details.clone());
        match event.severity {
            Severity::Info => tracing::info!(
                target: "security",
                event_type = event.event_type.as_str(),
                source_address = %event.source_address,
                %details,
                "Security event"
            ),
            Severity::Warning => tracing::warn!(
                target: "security",
                event_type = event.event_type.as_str(),
                source_address = %event.source_address,
                %details,
                "Security event"
            ),
            Severity::Error => tracing::error!(
                target: "security",
                event_type = event.event_type.as_str(),
                source_address = %event.source_address,
                %details,
                "Security event"
            ),
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Recorded events of one type.
    pub fn of_type(&self, event_type: EventType) -> Vec<SecurityEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &SecurityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// One line of the audit file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLine {
    /// SHA-256 of the previous raw line (hex).
    pub prev_sha256: String,
    #[serde(flatten)]
    pub event: SecurityEvent,
}

/// Append-only, hash-chained JSONL audit file.
#[derive(Debug)]
pub struct AuditFileSink {
    path: PathBuf,
    last_hash: Mutex<String>,
}

impl AuditFileSink {
    /// Open (or create) the audit file and resume its chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let last_hash = if path.exists() {
            let content = fs::read_to_string(&path)?;
            content
                .lines()
                .filter(|l| !l.is_empty())
                .last()
                .map(|l| sha256_hex(l.as_bytes()))
                .unwrap_or_else(|| GENESIS_HASH.to_string())
        } else {
            GENESIS_HASH.to_string()
        };

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &SecurityEvent) -> Result<()> {
        let mut last_hash = self.last_hash.lock().map_err(|_| GatewayError::LockPoisoned)?;

        let line = AuditLine {
            prev_sha256: last_hash.clone(),
            event: event.clone(),
        };
        let json = serde_json::to_string(&line)?;

        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        writeln!(file, "{}", json)?;

        *last_hash = sha256_hex(json.as_bytes());
        Ok(())
    }
}

impl EventSink for AuditFileSink {
    fn record(&self, event: &SecurityEvent) {
        if let Err(e) = self.append(event) {
            tracing::error!(path = %self.path.display(), "Failed to append audit entry: {}", e);
        }
    }
}

/// Check the audit file hash chain.
///
/// Returns the zero-based indices of lines whose link does not match the
/// previous line, or that are not valid audit JSON. Empty means intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
    let mut broken = Vec::new();
    let mut expected = GENESIS_HASH.to_string();

    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<AuditLine>(line) {
            Ok(entry) if entry.prev_sha256 == expected => {}
            _ => broken.push(i),
        }
        expected = sha256_hex(line.as_bytes());
    }

    Ok(broken)
}

/// Hex-encoded SHA-256.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Fan-out handle shared by every component that emits events.
#[derive(Clone)]
pub struct SecurityEventLog {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl SecurityEventLog {
    /// Log that only writes to tracing.
    pub fn new() -> Self {
        Self::with_sinks(vec![Arc::new(TracingSink)])
    }

    /// Log writing to the given sinks.
    pub fn with_sinks(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    /// Tracing plus an in-memory sink, returned for inspection.
    pub fn with_memory() -> (Self, Arc<MemorySink>) {
        let memory = Arc::new(MemorySink::new());
        let log = Self::with_sinks(vec![Arc::new(TracingSink), memory.clone()]);
        (log, memory)
    }

    /// Deliver an event to every sink.
    pub fn emit(&self, event: SecurityEvent) {
        for sink in self.sinks.iter() {
            sink.record(&event);
        }
    }
}

impl Default for SecurityEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecurityEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEventLog")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
