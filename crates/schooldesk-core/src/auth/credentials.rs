use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use keyring::Entry;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::UserProfile;

const SERVICE_NAME: &str = "schooldesk";

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const USER_KEY: &str = "user_data";

const ALL_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize user profile: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable backing for the three session entries.
///
/// This is a dumb store: no validation, no network, and `clear` never fails.
/// Only the session manager writes to it.
pub trait CredentialStore: Send + Sync {
    /// Raw read of one entry. Absent and unreadable entries are both `None`.
    fn get(&self, key: &str) -> Option<String>;

    /// Raw write of one entry.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove one entry, succeeding if it was already gone.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Overwrite all three entries.
    ///
    /// The access token is written last, since restore keys off it. If any
    /// write fails the store is cleared rather than left holding a mix of
    /// old and new entries.
    fn save(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &UserProfile,
    ) -> Result<(), StoreError> {
        let user_json = serde_json::to_string(user)?;
        let written = self.set(USER_KEY, &user_json).and_then(|()| {
            match refresh_token {
                Some(token) => self.set(REFRESH_TOKEN_KEY, token)?,
                None => self.remove(REFRESH_TOKEN_KEY)?,
            }
            self.set(ACCESS_TOKEN_KEY, access_token)
        });
        if written.is_err() {
            warn!("Credential write failed part way, clearing stored session");
            self.clear();
        }
        written
    }

    /// Replace only the access token.
    fn save_access_token(&self, access_token: &str) -> Result<(), StoreError> {
        self.set(ACCESS_TOKEN_KEY, access_token)
    }

    fn load_access_token(&self) -> Option<String> {
        self.get(ACCESS_TOKEN_KEY)
    }

    fn load_refresh_token(&self) -> Option<String> {
        self.get(REFRESH_TOKEN_KEY)
    }

    fn load_user(&self) -> Option<UserProfile> {
        let raw = self.get(USER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Cached user profile is unreadable, ignoring it");
                None
            }
        }
    }

    /// Remove all three entries unconditionally.
    fn clear(&self) {
        for key in ALL_KEYS {
            if let Err(e) = self.remove(key) {
                warn!(key, error = %e, "Failed to remove credential entry");
            }
        }
    }
}

/// Credentials kept in the OS keychain, one entry per key.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    /// Use a distinct keychain service, e.g. one per backend profile
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Option<String> {
        let entry = match self.entry(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Failed to open keychain entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read keychain entry");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Credentials kept as plain files in a private directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        if key == USER_KEY {
            self.dir.join(format!("{}.json", key))
        } else {
            self.dir.join(key)
        }
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let path = self.path(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Some(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read credential file");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_private(&path, value).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "Credential file written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// Write `value` to a file only the owner can read, never exposing it
/// under looser permissions.
fn write_private(path: &Path, value: &str) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // `mode` only applies on creation; tighten files left by older versions
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(value.as_bytes())?;
    file.sync_all()
}

/// In-process store, for tests and for hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
