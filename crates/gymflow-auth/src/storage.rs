//! String-keyed persistent store
//!
//! A JSON file mapping namespaced keys to JSON values, the durable
//! equivalent of the dashboard's per-profile browser storage. All writes
//! use atomic temp-file + rename to prevent corruption on crash. A tokio
//! Mutex serializes concurrent mutations from the login, refresh, and
//! logout paths.
//!
//! The file is the single source of truth on cold start: a fresh context
//! (a new tab) hydrates its in-memory view from it at open time. A value
//! that fails to parse on read is treated as absent rather than failing
//! the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Durable key-value store shared by every session component.
///
/// The Mutex serializes all mutations. Reads acquire the lock briefly to
/// clone the requested value, so they never block on an in-flight write
/// for longer than the map access itself.
pub struct KvStore {
    path: PathBuf,
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl KvStore {
    /// Open the store at the given file path.
    ///
    /// A missing file is a cold start: it is created as `{}` so future
    /// opens skip the cold-start path. An unreadable or unparseable file
    /// is an error; the caller decides whether to start fresh.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let values: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), keys = values.len(), "opened persistent store");
            values
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let values = HashMap::new();
            write_atomic(&path, &values).await?;
            values
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Read and deserialize a value.
    ///
    /// Returns `None` for a missing key and for a value that no longer
    /// parses as `T` (a corrupt or legacy-shaped entry must not take the
    /// session down).
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = {
            let state = self.state.lock().await;
            state.get(key)?.clone()
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key, error = %e, "stored value does not parse, treating as absent");
                None
            }
        }
    }

    /// Whether a key currently holds a value.
    pub async fn contains(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state.contains_key(key)
    }

    /// Serialize and store a single value.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Parse(format!("serializing value for {key}: {e}")))?;
        self.set_many(&[(key, value)]).await
    }

    /// Store several keys in one atomic write.
    ///
    /// Multi-key invariants (a token pair, a profile plus its tokens)
    /// depend on this: either every entry lands on disk or none does.
    pub async fn set_many(&self, entries: &[(&str, serde_json::Value)]) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, value) in entries {
            state.insert((*key).to_string(), value.clone());
        }
        debug!(keys = entries.len(), "stored values");
        write_atomic(&self.path, &state).await
    }

    /// Remove a single key. Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.remove_many(&[key]).await
    }

    /// Remove several keys in one atomic write; skips the write entirely
    /// when none of them were present.
    pub async fn remove_many(&self, keys: &[&str]) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut removed = false;
        for key in keys {
            removed |= state.remove(*key).is_some();
        }
        if removed {
            debug!(keys = keys.len(), "removed values");
            write_atomic(&self.path, &state).await?;
        }
        Ok(())
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write the full map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Permissions are 0600 (owner read/write only) since the store holds
/// session tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, serde_json::Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".gymflow-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    // Set 0600 permissions (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}
