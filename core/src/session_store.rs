use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::CoreError;

/// Writes `bytes` to a temp file beside `path` and renames it over the target,
/// so readers never observe a half-written file.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}

/// Durable home for the upstream client's settings blob.
pub trait SessionStore {
    fn load(&self) -> Option<Vec<u8>>;
    fn save(&self, blob: &[u8]) -> Result<(), CoreError>;
    fn delete(&self) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), error = %err, "session file unreadable");
                }
                None
            }
        }
    }

    fn save(&self, blob: &[u8]) -> Result<(), CoreError> {
        write_atomically(&self.path, blob)?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    fn delete(&self) -> Result<(), CoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-process store, for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    blob: std::sync::Mutex<Option<Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn with_blob(blob: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: std::sync::Mutex::new(Some(blob.into())),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|guard| guard.clone())
    }

    fn save(&self, blob: &[u8]) -> Result<(), CoreError> {
        let mut guard = self
            .blob
            .lock()
            .map_err(|_| CoreError::InvalidArgument("session store poisoned".to_string()))?;
        *guard = Some(blob.to_vec());
        Ok(())
    }

    fn delete(&self) -> Result<(), CoreError> {
        if let Ok(mut guard) = self.blob.lock() {
            *guard = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_store_roundtrip_and_overwrite() {
        let dir = tempdir().expect("temp");
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));
        assert!(store.load().is_none());

        store.save(b"{\"a\":1}").expect("save");
        assert_eq!(store.load().expect("blob"), b"{\"a\":1}".to_vec());

        store.save(b"{}").expect("overwrite");
        assert_eq!(store.load().expect("blob"), b"{}".to_vec());

        let leftovers = fs::read_dir(store.path().parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().expect("temp");
        let store = FileSessionStore::new(dir.path().join("session.json"));
        store.delete().expect("missing file is fine");
        store.save(b"x").expect("save");
        store.delete().expect("delete");
        assert!(store.load().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemorySessionStore::default();
        assert!(store.load().is_none());
        store.save(b"blob").expect("save");
        assert_eq!(store.load(), Some(b"blob".to_vec()));
        store.delete().expect("delete");
        assert!(store.load().is_none());
    }
}
