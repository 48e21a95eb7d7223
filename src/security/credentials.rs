//! File-backed API key store.
//!
//! Keys are never persisted in the clear. The store file maps the hex
//! SHA-256 digest of each issued key to its [`KeyRecord`]:
//!
//! ```json
//! {
//!   "3f2a…": {
//!     "name": "ops-dashboard",
//!     "permissions": ["*"],
//!     "created": 1760000000.0,
//!     "last_used": null,
//!     "request_count": 0
//!   }
//! }
//! ```
//!
//! The file is reloaded at most once per cache TTL. Reloads merge usage
//! counters kept in memory, so counts never move backwards, and a malformed
//! file never replaces the last snapshot that parsed.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::events::sha256_hex;
use crate::error::GatewayError;
use crate::Result;

/// Default interval between credential file reloads.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Random bytes in an issued key (256 bits).
pub const KEY_BYTES: usize = 32;

/// Permission that grants every scope.
pub const WILDCARD_PERMISSION: &str = "*";

/// Permission scopes understood by the HTTP surface.
pub mod scopes {
    pub const TENANTS_READ: &str = "tenants:read";
    pub const TENANTS_WRITE: &str = "tenants:write";
    pub const BACKUPS_READ: &str = "backups:read";
    pub const BACKUPS_WRITE: &str = "backups:write";
    pub const MONITORING_READ: &str = "monitoring:read";

    pub const ALL: &[&str] = &[
        TENANTS_READ,
        TENANTS_WRITE,
        BACKUPS_READ,
        BACKUPS_WRITE,
        MONITORING_READ,
    ];
}

fn default_permissions() -> Vec<String> {
    vec![WILDCARD_PERMISSION.to_string()]
}

/// Metadata for one issued key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Hex SHA-256 of the raw key. Held as the map key on disk.
    #[serde(skip)]
    pub digest: String,
    /// Human-readable label.
    pub name: String,
    #[serde(default = "default_permissions")]
    pub permissions: Vec<String>,
    /// Unix timestamp (seconds).
    pub created: f64,
    #[serde(default)]
    pub last_used: Option<f64>,
    #[serde(default)]
    pub request_count: u64,
}

impl KeyRecord {
    /// Whether this key may act within `scope`.
    pub fn allows(&self, scope: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == WILDCARD_PERMISSION || p == scope)
    }
}

/// Hex SHA-256 digest of a raw key.
pub fn digest_key(raw_key: &str) -> String {
    sha256_hex(raw_key.as_bytes())
}

/// Generate a fresh URL-safe key from the OS CSPRNG.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Warn when the credential file is readable or writable by group/other.
///
/// Returns `true` when the mode is acceptable or cannot be inspected.
pub fn check_file_permissions(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    "API keys file has insecure permissions: {:o}. Should be 600.",
                    mode
                );
                return false;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    true
}

#[derive(Debug)]
struct Snapshot {
    keys: HashMap<String, KeyRecord>,
    loaded_at: Option<Instant>,
}

/// Thread-safe credential store backed by a JSON file.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    cache_ttl: Duration,
    snapshot: RwLock<Snapshot>,
    persist: Mutex<()>,
}

impl CredentialStore {
    /// Create a store for `path` and perform the initial load.
    pub fn open(path: impl Into<PathBuf>, cache_ttl: Duration) -> Self {
        let store = Self {
            path: path.into(),
            cache_ttl,
            snapshot: RwLock::new(Snapshot {
                keys: HashMap::new(),
                loaded_at: None,
            }),
            persist: Mutex::new(()),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Read the credential file into memory.
    ///
    /// A missing file yields an empty store. A malformed file keeps the
    /// previous snapshot. Returns the number of keys held afterwards.
    pub fn load(&self) -> usize {
        self.load_at(Instant::now())
    }

    fn load_at(&self, now: Instant) -> usize {
        let Ok(_guard) = self.persist.lock() else {
            return 0;
        };
        self.load_locked(now)
    }

    /// Read and swap in the file contents. Caller holds `persist`.
    fn load_locked(&self, now: Instant) -> usize {
        let parsed = self.read_file();

        let Ok(mut snapshot) = self.snapshot.write() else {
            return 0;
        };
        snapshot.loaded_at = Some(now);

        match parsed {
            Ok(Some(mut keys)) => {
                for (digest, record) in keys.iter_mut() {
                    record.digest = digest.clone();
                    if let Some(current) = snapshot.keys.get(digest) {
                        record.request_count = record.request_count.max(current.request_count);
                        record.last_used = match (record.last_used, current.last_used) {
                            (Some(a), Some(b)) => Some(a.max(b)),
                            (a, b) => a.or(b),
                        };
                    }
                }
                tracing::debug!("Loaded {} API keys from {}", keys.len(), self.path.display());
                snapshot.keys = keys;
            }
            Ok(None) => {
                tracing::warn!("API keys file not found: {}", self.path.display());
                snapshot.keys.clear();
            }
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    "Error loading API keys, keeping {} cached keys: {}",
                    snapshot.keys.len(),
                    e
                );
            }
        }

        snapshot.keys.len()
    }

    fn read_file(&self) -> Result<Option<HashMap<String, KeyRecord>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        check_file_permissions(&self.path);
        let content = fs::read_to_string(&self.path)?;
        let keys = serde_json::from_str(&content)?;
        Ok(Some(keys))
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.snapshot
            .read()
            .map(|s| match s.loaded_at {
                Some(at) => now.saturating_duration_since(at) >= self.cache_ttl,
                None => true,
            })
            .unwrap_or(false)
    }

    fn reload_if_stale(&self, now: Instant) {
        if self.is_stale(now) {
            self.load_at(now);
        }
    }

    /// Write the current snapshot to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let _guard = self.persist.lock().map_err(|_| GatewayError::LockPoisoned)?;
        self.save_locked()
    }

    /// Caller holds `persist`, so no reload can land between a mutation
    /// and its write.
    fn save_locked(&self) -> Result<()> {
        let content = {
            let snapshot = self.snapshot.read().map_err(|_| GatewayError::LockPoisoned)?;
            let ordered: BTreeMap<&String, &KeyRecord> = snapshot.keys.iter().collect();
            serde_json::to_string_pretty(&ordered)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut options = fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            GatewayError::Credentials(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Issue a new key and persist it. The raw key is returned exactly once.
    pub fn issue(&self, name: &str, permissions: &[String]) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::Credentials("key name must not be empty".into()));
        }

        let _guard = self.persist.lock().map_err(|_| GatewayError::LockPoisoned)?;
        let now = Instant::now();
        if self.is_stale(now) {
            self.load_locked(now);
        }

        let raw_key = generate_api_key();
        let digest = digest_key(&raw_key);
        let record = KeyRecord {
            digest: digest.clone(),
            name: name.to_string(),
            permissions: if permissions.is_empty() {
                default_permissions()
            } else {
                permissions.to_vec()
            },
            created: unix_now(),
            last_used: None,
            request_count: 0,
        };

        self.snapshot
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?
            .keys
            .insert(digest.clone(), record);

        if let Err(e) = self.save_locked() {
            if let Ok(mut snapshot) = self.snapshot.write() {
                snapshot.keys.remove(&digest);
            }
            return Err(e);
        }

        tracing::info!("Generated new API key: {}", name);
        Ok(raw_key)
    }

    /// Revoke a key. Returns `false` if it was not present.
    pub fn revoke(&self, raw_key: &str) -> Result<bool> {
        let _guard = self.persist.lock().map_err(|_| GatewayError::LockPoisoned)?;
        let now = Instant::now();
        if self.is_stale(now) {
            self.load_locked(now);
        }

        let digest = digest_key(raw_key);
        let removed = self
            .snapshot
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?
            .keys
            .remove(&digest);

        match removed {
            Some(record) => {
                if let Err(e) = self.save_locked() {
                    if let Ok(mut snapshot) = self.snapshot.write() {
                        snapshot.keys.insert(digest, record);
                    }
                    return Err(e);
                }
                tracing::info!("Revoked API key: {}", record.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up a raw key, recording the use on success.
    pub fn validate(&self, raw_key: &str) -> Result<Option<KeyRecord>> {
        self.validate_at(raw_key, Instant::now())
    }

    /// [`validate`](Self::validate) at an explicit instant.
    pub fn validate_at(&self, raw_key: &str, now: Instant) -> Result<Option<KeyRecord>> {
        self.reload_if_stale(now);

        let digest = digest_key(raw_key);
        let mut snapshot = self.snapshot.write().map_err(|_| GatewayError::LockPoisoned)?;
        Ok(snapshot.keys.get_mut(&digest).map(|record| {
            record.last_used = Some(unix_now());
            record.request_count += 1;
            record.clone()
        }))
    }

    /// All records, oldest first. Digests are never serialized.
    pub fn list(&self) -> Result<Vec<KeyRecord>> {
        self.reload_if_stale(Instant::now());

        let snapshot = self.snapshot.read().map_err(|_| GatewayError::LockPoisoned)?;
        let mut records: Vec<KeyRecord> = snapshot.keys.values().cloned().collect();
        records.sort_by(|a, b| a.created.total_cmp(&b.created));
        Ok(records)
    }

    /// Merge on-disk changes, then persist in-memory usage counters.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.persist.lock().map_err(|_| GatewayError::LockPoisoned)?;
        self.load_locked(Instant::now());
        self.save_locked()
    }

    /// Number of keys currently held in memory.
    pub fn len(&self) -> usize {
        self.snapshot.read().map(|s| s.keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join("api-keys.json"), Duration::ZERO)
    }

    #[test]
    fn test_generated_keys_are_url_safe_and_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_issue_validate_revoke() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let key = store.issue("ops", &[]).unwrap();
        let record = store.validate(&key).unwrap().expect("issued key validates");
        assert_eq!(record.name, "ops");
        assert_eq!(record.permissions, vec!["*".to_string()]);
        assert_eq!(record.request_count, 1);
        assert!(record.last_used.is_some());

        assert!(store.revoke(&key).unwrap());
        assert!(store.validate(&key).unwrap().is_none());
        // Revoking twice is a no-op.
        assert!(!store.revoke(&key).unwrap());
    }

    #[test]
    fn test_raw_key_never_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = store.issue("ci", &[]).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(!content.contains(&key));
        assert!(content.contains(&digest_key(&key)));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.issue("ops", &[]).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(check_file_permissions(store.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_warning_for_world_readable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        assert!(!check_file_permissions(&path));
        // The store still loads; mode is only reported.
        let store = CredentialStore::open(&path, Duration::ZERO);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert!(store.validate("anything").unwrap().is_none());
    }

    #[test]
    fn test_malformed_file_keeps_last_good_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = store.issue("ops", &[]).unwrap();

        fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), 1);
        assert!(store.validate(&key).unwrap().is_some());
    }

    #[test]
    fn test_malformed_file_at_startup_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, "[1, 2").unwrap();

        let store = CredentialStore::open(&path, Duration::ZERO);
        assert!(store.is_empty());
    }

    #[test]
    fn test_reload_picks_up_external_edits() {
        let dir = TempDir::new().unwrap();
        let writer = store_in(&dir);
        let reader = store_in(&dir);

        let key = writer.issue("late", &[]).unwrap();
        // TTL zero: the reader reloads on every lookup.
        assert!(reader.validate(&key).unwrap().is_some());

        writer.revoke(&key).unwrap();
        assert!(reader.validate(&key).unwrap().is_none());
    }

    #[test]
    fn test_reload_respects_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.json");
        let writer = CredentialStore::open(&path, Duration::ZERO);
        let reader = CredentialStore::open(&path, Duration::from_secs(3600));

        let key = writer.issue("late", &[]).unwrap();
        assert!(reader.validate(&key).unwrap().is_none());
        reader.load();
        assert!(reader.validate(&key).unwrap().is_some());
    }

    #[test]
    fn test_reload_never_decreases_usage() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = store.issue("busy", &[]).unwrap();

        for _ in 0..3 {
            store.validate(&key).unwrap();
        }
        // File still holds request_count 0 from issue.
        store.load();
        let record = store.validate(&key).unwrap().unwrap();
        assert_eq!(record.request_count, 4);
    }

    #[test]
    fn test_flush_persists_counters() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = store.issue("busy", &[]).unwrap();
        store.validate(&key).unwrap();
        store.validate(&key).unwrap();
        store.flush().unwrap();

        let fresh = store_in(&dir);
        let listed = fresh.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_count, 2);
    }

    #[test]
    fn test_list_sorted_and_digest_not_serialized() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.issue("first", &[]).unwrap();
        store
            .issue("second", &[scopes::TENANTS_READ.to_string()])
            .unwrap();

        let records = store.list().unwrap();
        assert_eq!(records[0].name, "first");
        assert_eq!(records[1].permissions, vec!["tenants:read".to_string()]);

        let json = serde_json::to_value(&records[0]).unwrap();
        assert!(json.get("digest").is_none());
    }

    #[test]
    fn test_permissions() {
        let record = KeyRecord {
            digest: String::new(),
            name: "ro".into(),
            permissions: vec![scopes::TENANTS_READ.into()],
            created: 0.0,
            last_used: None,
            request_count: 0,
        };
        assert!(record.allows(scopes::TENANTS_READ));
        assert!(!record.allows(scopes::TENANTS_WRITE));

        let admin = KeyRecord {
            permissions: default_permissions(),
            ..record
        };
        assert!(scopes::ALL.iter().all(|s| admin.allows(s)));
    }

    #[test]
    fn test_legacy_record_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.json");
        fs::write(&path, r#"{"abc": {"name": "old", "created": 1.5}}"#).unwrap();

        let store = CredentialStore::open(&path, Duration::ZERO);
        let records = store.list().unwrap();
        assert_eq!(records[0].digest, "abc");
        assert_eq!(records[0].permissions, vec!["*".to_string()]);
        assert_eq!(records[0].request_count, 0);
    }

    #[test]
    fn test_reload_during_issue_and_revoke_keeps_file_consistent() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for i in 0..200 {
            store.issue(&format!("filler-{i}"), &[]).unwrap();
        }

        let stop = AtomicBool::new(false);
        let mut issued = Vec::new();
        let mut revoked = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        store.validate("unrelated").unwrap();
                    }
                });
            }

            for round in 0..30 {
                let key = store.issue(&format!("round-{round}"), &[]).unwrap();
                if round % 2 == 0 {
                    assert!(store.revoke(&key).unwrap());
                    revoked.push(key);
                } else {
                    issued.push(key);
                }
            }
            stop.store(true, Ordering::Relaxed);
        });

        let fresh = store_in(&dir);
        for key in &issued {
            assert!(fresh.validate(key).unwrap().is_some(), "issued key lost");
        }
        for key in &revoked {
            assert!(fresh.validate(key).unwrap().is_none(), "revoked key came back");
        }
        assert_eq!(fresh.len(), 200 + issued.len());
    }

    #[test]
    fn test_concurrent_validate_counts_every_request() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = store.issue("busy", &[]).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        assert!(store.validate(&key).unwrap().is_some());
                    }
                });
            }
        });

        let record = store.validate(&key).unwrap().unwrap();
        assert_eq!(record.request_count, 401);
    }

    #[test]
    fn test_issue_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.issue("  ", &[]).is_err());
        assert!(store.is_empty());
    }
}
