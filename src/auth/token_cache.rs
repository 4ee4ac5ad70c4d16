//! File-backed token cache
//!
//! The cache file is one JSON object mapping cache keys to token records.
//! Every change rewrites the whole file through a temporary file and a
//! rename, while holding an exclusive advisory lock on a sidecar `.lock`
//! file so concurrent processes do not lose each other's writes. Failures
//! are logged and treated as a miss.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::models::{AuthenticationMethod, AuthenticationResult};
use crate::error::CacheError;

/// Records are only served while `now < expires_at - EXPIRY_BUFFER`.
pub const EXPIRY_BUFFER_MINUTES: i64 = 5;

pub const DEFAULT_CACHE_FILE: &str = "token_cache.json";

/// Deterministic cache key built from non-secret identity inputs only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// `discriminator` is the certificate thumbprint for certificate auth
    /// and the username for password auth. Secrets never take part in a key.
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        method: AuthenticationMethod,
        scopes: &[String],
        discriminator: Option<&str>,
    ) -> Self {
        let mut scopes: Vec<String> = scopes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        scopes.sort();
        scopes.dedup();

        CacheKey(format!(
            "{}|{}|{}|{}|{}",
            tenant_id.trim().to_ascii_lowercase(),
            client_id.trim().to_ascii_lowercase(),
            method.as_str(),
            scopes.join(" "),
            discriminator.map(str::trim).unwrap_or("").to_ascii_lowercase()
        ))
    }

    /// Account record for one signed-in user of a tenant/client pair.
    /// Holds that user's latest delegated refresh token so interactive
    /// flows can reacquire silently. With `None` the record belongs to
    /// whoever signed in last and is only read when no user is named.
    pub fn account(tenant_id: &str, client_id: &str, user: Option<&str>) -> Self {
        CacheKey(format!(
            "account|{}|{}|{}",
            tenant_id.trim().to_ascii_lowercase(),
            client_id.trim().to_ascii_lowercase(),
            user.map(str::trim).unwrap_or("").to_ascii_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// One persisted token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCacheRecord {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenCacheRecord {
    fn from_result(result: &AuthenticationResult) -> Option<Self> {
        let access_token = result.token()?;
        Some(Self {
            access_token: access_token.to_string(),
            expires_at: result.expires_at?,
            refresh_token: result.refresh_token.clone(),
            token_type: result.token_type.clone(),
            scope: result.scope.clone(),
        })
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::minutes(EXPIRY_BUFFER_MINUTES)
    }

    pub fn to_result(&self) -> AuthenticationResult {
        AuthenticationResult::success(self.access_token.clone(), self.expires_at)
            .with_refresh_token(self.refresh_token.clone())
            .with_scope(self.scope.clone())
            .with_token_type(self.token_type.clone())
    }
}

type Records = BTreeMap<String, TokenCacheRecord>;

/// Token cache shared by every process of the same user.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
    enabled: bool,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<AuthenticationResult> {
        self.get_at(key, Utc::now())
    }

    /// Cached result for `key` if it is still outside the expiry buffer at `now`.
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<AuthenticationResult> {
        let record = self.get_record(key)?;
        if record.is_usable_at(now) {
            debug!("Token cache hit for {}", key);
            Some(record.to_result())
        } else {
            debug!("Token cache entry for {} is inside the expiry buffer", key);
            None
        }
    }

    /// The raw record regardless of expiry, used to find refresh tokens.
    pub fn get_record(&self, key: &CacheKey) -> Option<TokenCacheRecord> {
        if !self.enabled {
            return None;
        }
        match self.with_lock(false, || self.read_records()) {
            Ok(mut records) => records.remove(key.as_str()),
            Err(e) => {
                warn!("Token cache read failed, continuing without it: {}", e);
                None
            }
        }
    }

    /// Persist a successful result. Returns whether anything was written.
    pub fn set(&self, key: &CacheKey, result: &AuthenticationResult) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(record) = TokenCacheRecord::from_result(result) else {
            debug!("Not caching unsuccessful or empty result for {}", key);
            return false;
        };

        let outcome = self.with_lock(true, || {
            let mut records = self.read_records().unwrap_or_else(|e| {
                warn!("Discarding unreadable token cache: {}", e);
                Records::new()
            });
            records.insert(key.as_str().to_string(), record);
            self.write_records(&records)
        });

        match outcome {
            Ok(()) => {
                debug!("Cached token for {}", key);
                true
            }
            Err(e) => {
                warn!("Token cache write failed: {}", e);
                false
            }
        }
    }

    /// Remove one record. Missing records are not an error.
    pub fn clear(&self, key: &CacheKey) {
        if !self.enabled {
            return;
        }
        let outcome = self.with_lock(true, || {
            let mut records = self.read_records()?;
            if records.remove(key.as_str()).is_some() {
                self.write_records(&records)?;
            }
            Ok(())
        });
        if let Err(e) = outcome {
            warn!("Token cache clear failed: {}", e);
        }
    }

    pub fn clear_all(&self) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.with_lock(true, || self.write_records(&Records::new())) {
            warn!("Token cache clear failed: {}", e);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        match self.with_lock(false, || self.read_records()) {
            Ok(records) => records.into_keys().collect(),
            Err(e) => {
                warn!("Token cache read failed: {}", e);
                Vec::new()
            }
        }
    }

    fn read_records(&self) -> Result<Records, CacheError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Records::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Records::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_records(&self, records: &Records) -> Result<(), CacheError> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| CacheError::Location(format!("{} is not a file path", self.path.display())))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let content = serde_json::to_string_pretty(records)?;
        {
            let mut file = private_file_options().write(true).create(true).truncate(true).open(&tmp_path)?;
            restrict_file(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn with_lock<T>(
        &self,
        exclusive: bool,
        f: impl FnOnce() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir)?;
        }

        let mut lock_name = self.path.as_os_str().to_os_string();
        lock_name.push(".lock");
        let lock_file: File = private_file_options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_name))?;

        if exclusive {
            lock_file.lock()?;
        } else {
            lock_file.lock_shared()?;
        }
        let result = f();
        if let Err(e) = lock_file.unlock() {
            debug!("Token cache unlock failed: {}", e);
        }
        result
    }
}

#[cfg(unix)]
fn private_file_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn private_file_options() -> OpenOptions {
    OpenOptions::new()
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}
