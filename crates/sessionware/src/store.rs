//! Durable storage of the session credential across process restarts.
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{
    credential::Credential,
    error::{Error, Result},
};

/// Key/value boundary holding the current credential.
///
/// Implementations are called at most once per login, refresh or logout.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Load the persisted credential, if any.
    ///
    /// # Errors
    /// Fails if the store cannot be read or holds an invalid credential.
    fn load(&self) -> Result<Option<Credential>>;

    /// Persist `credential`, replacing any previous one.
    ///
    /// # Errors
    /// Fails if the store cannot be written.
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Remove the persisted credential. Erasing an empty store succeeds.
    ///
    /// # Errors
    /// Fails if the store cannot be written.
    fn erase(&self) -> Result<()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    credential: Mutex<Option<Credential>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that starts out holding `credential`.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.credential.lock().expect("Non-poisoned lock").clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.credential.lock().expect("Non-poisoned lock") = Some(credential.clone());
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        self.credential.lock().expect("Non-poisoned lock").take();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredential {
    access_token: String,
    refresh_token: String,
}

/// Stores the credential as a JSON file.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash never leaves a half-written credential behind.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn store_error(path: &Path, e: impl fmt::Display) -> Error {
    Error::Store(format!("{}: {e}", path.display()))
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Credential>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error(&self.path, e)),
        };
        let stored: StoredCredential =
            serde_json::from_slice(&contents).map_err(|e| store_error(&self.path, e))?;
        Credential::new(stored.access_token, stored.refresh_token)
            .map(Some)
            .map_err(|e| store_error(&self.path, e))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let stored = StoredCredential {
            access_token: credential.access_token().to_string(),
            refresh_token: credential.refresh_token().to_string(),
        };
        let contents = serde_json::to_vec(&stored).map_err(|e| store_error(&self.path, e))?;
        let temp_path = self.temp_path();
        fs::write(&temp_path, contents).map_err(|e| store_error(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| store_error(&self.path, e))
    }

    fn erase(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert_eq!(store.load().unwrap(), None);

        let credential = Credential::new("A1", "R1").unwrap();
        store.save(&credential).unwrap();
        assert_eq!(store.load().unwrap(), Some(credential));

        store.erase().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let credential = Credential::new("A1", "R1").unwrap();
        FileSessionStore::new(&path).save(&credential).unwrap();

        let contents: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            contents,
            serde_json::json!({"accessToken": "A1", "refreshToken": "R1"})
        );

        let reopened = FileSessionStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(credential));
        assert!(!reopened.temp_path().exists());
    }

    #[test]
    fn test_file_store_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("missing.json"));

        assert_eq!(store.load().unwrap(), None);
        store.erase().unwrap();
    }

    #[test]
    fn test_file_store_rejects_partial_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(
            &path,
            serde_json::json!({"accessToken": "A1", "refreshToken": ""}).to_string(),
        )
        .unwrap();

        assert!(matches!(
            FileSessionStore::new(&path).load(),
            Err(Error::Store(_))
        ));
    }
}
