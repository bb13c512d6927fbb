use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::Error;

/// Session-scoped key-value storage.
///
/// Holds the persisted session and the pending PKCE exchange. Implementations
/// must survive the redirect to the identity provider and back, and must not
/// be shared between unrelated users.
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the value cannot be persisted.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the removal cannot be persisted.
    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object file.
///
/// Lets a sign-in started in one process be completed by another.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStorage {
    /// Opens the file, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Storage(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the file atomically; the file is readable by its owner only.
    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), Error> {
        let storage_err = |e: &dyn std::fmt::Display| {
            Error::Storage(format!("{}: {e}", self.path.display()))
        };
        let raw = serde_json::to_vec_pretty(entries).map_err(|e| storage_err(&e))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir).map_err(|e| storage_err(&e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| storage_err(&e))?;
        }
        file.write_all(&raw).map_err(|e| storage_err(&e))?;
        file.as_file().sync_all().map_err(|e| storage_err(&e))?;
        file.persist(&self.path).map_err(|e| storage_err(&e.error))?;
        Ok(())
    }
}

impl SessionStorage for JsonFileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries).inspect_err(|_| match previous {
            Some(old) => {
                entries.insert(key.to_owned(), old);
            }
            None => {
                entries.remove(key);
            }
        })
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        self.flush(&entries).inspect_err(|_| {
            entries.insert(key.to_owned(), previous);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_get_set_remove() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k"), None);
        storage.set("k", "v1").unwrap();
        storage.set("k", "v2").unwrap();
        assert_eq!(storage.get("k").as_deref(), Some("v2"));
        storage.remove("k").unwrap();
        storage.remove("k").unwrap();
        assert_eq!(storage.get("k"), None);
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let storage = JsonFileStorage::open(&path).unwrap();
        storage.set("session", r#"{"accessToken":"tok"}"#).unwrap();
        storage.set("pkce", "pending").unwrap();
        storage.remove("pkce").unwrap();
        drop(storage);

        let reopened = JsonFileStorage::open(&path).unwrap();
        assert_eq!(
            reopened.get("session").as_deref(),
            Some(r#"{"accessToken":"tok"}"#)
        );
        assert_eq!(reopened.get("pkce"), None);
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn file_storage_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFileStorage::open(&path).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[cfg(unix)]
    #[test]
    fn file_storage_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let storage = JsonFileStorage::open(&path).unwrap();
        storage.set("session", "token-bearing record").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn failed_flush_keeps_memory_and_disk_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let storage = JsonFileStorage::open(&path).unwrap();
        storage.set("session", "tok").unwrap();

        // a directory at the target path makes every replace fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(storage.remove("session"), Err(Error::Storage(_))));
        assert_eq!(storage.get("session").as_deref(), Some("tok"));
        assert!(matches!(storage.set("pkce", "p"), Err(Error::Storage(_))));
        assert_eq!(storage.get("pkce"), None);
        // missing keys never touch the disk
        storage.remove("absent").unwrap();
    }
}
