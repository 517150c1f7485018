// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{QuorumError, Result};

/// Key-value persistence for session keys and wallet capabilities.
/// Last write wins; no transactions.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

const LOCK_FILE: &str = ".lock";

/// One file per key under a directory, guarded by an exclusive lock file.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| QuorumError::Storage(format!("Failed to create {}: {e}", dir.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
                warn!(path = ?dir, error = %e, "Failed to set storage directory permissions");
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn default_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|p| p.join("quorum"))
            .ok_or_else(|| QuorumError::Storage("data directory not found".into()))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key != LOCK_FILE
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(QuorumError::Storage(format!("Invalid storage key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> std::io::Result<T>) -> Result<T> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))
            .map_err(|e| QuorumError::Storage(format!("Failed to open lock file: {e}")))?;
        lock.lock_exclusive()
            .map_err(|e| QuorumError::Storage(format!("Failed to lock storage: {e}")))?;

        let result = f();

        FileExt::unlock(&lock)
            .map_err(|e| QuorumError::Storage(format!("Failed to unlock storage: {e}")))?;
        result.map_err(QuorumError::Io)
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        self.with_lock(|| match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("tmp");
        self.with_lock(|| {
            let mut file = File::create(&tmp_path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)
        })?;
        debug!(key, "Stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        self.with_lock(|| match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
    }
}
