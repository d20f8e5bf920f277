//! Directory-backed document store.
//!
//! Each document is a file under the state directory. Writes go to a sibling
//! temp file which is fsynced and then renamed over the target, so a crash
//! leaves either the old or the new document, never a mix.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use crate::storage::traits::{FileStore, StorageError};

/// `FileStore` rooted at a directory.
#[derive(Debug)]
pub struct DirectoryFileStore {
    root: PathBuf,
    sync_on_write: bool,
}

impl DirectoryFileStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns IO failures from directory creation.
    pub fn open(root: &Path, sync_on_write: bool) -> Result<Self, StorageError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            sync_on_write,
        })
    }

    /// The state directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(StorageError::BackendError(format!(
                "document path must be relative and stay inside the state directory: {path:?}"
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl FileStore for DirectoryFileStore {
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = full.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &full)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
