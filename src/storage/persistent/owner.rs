//! Single-owner claim on a state directory.
//!
//! The owner takes an exclusive OS lock on `<dir>/.lock` and writes its pid
//! into it, so a second opener fails with `StorageError::Locked` naming the
//! process that holds the directory. The claim ends when the owner is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{Result as IoResult, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::storage::traits::StorageError;

/// Name of the lock file inside the state directory.
pub const LOCK_FILE: &str = ".lock";

/// Exclusive claim on one state directory.
#[derive(Debug)]
pub struct DirectoryOwner {
    _file: File,
    path: PathBuf,
}

impl DirectoryOwner {
    /// Claims `dir` for this process.
    ///
    /// # Errors
    /// - `StorageError::Locked` if another owner holds the directory
    /// - `StorageError::Io` if the lock file cannot be opened or written
    pub fn claim(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_lock_exclusive(&file)? {
            let holder = fs::read_to_string(&path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(StorageError::Locked(format!("{} (owner pid {holder})", dir.display())));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), pid = std::process::id(), "Claimed state directory");

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Returns `Ok(false)` when another handle already holds the lock.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> IoResult<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> IoResult<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle is owned by `file`; a zeroed OVERLAPPED locks from offset 0.
    let locked = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if locked != 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(any(unix, windows)))]
fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "state directory locking is not supported on this platform",
    ))
}
