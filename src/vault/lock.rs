//! Locks guarding a vault region
//!
//! A region has exactly one reader/writer lock. It is layered:
//!
//! ```text
//! RegionLock
//!   ├─→ parking_lot::RwLock   → orders threads sharing one handle
//!   └─→ flock(<name>.lock)    → orders handles and processes (file-backed only)
//! ```
//!
//! The in-process lock is always taken first, so at most one thread per
//! handle ever waits on the file lock for exclusive access.

use crate::error::Result;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mode of every file backing a region: owner read/write only
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Open `path` read/write, creating it readable by the owner alone
///
/// The mode applies only on creation; an existing file keeps its own.
pub(crate) fn open_private(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }
    Ok(options.open(path)?)
}

/// flock on a lock file, shared between the readers of one handle
struct FileLock {
    file: File,
    path: PathBuf,
    /// Threads of this handle currently holding the shared flock
    shared_holders: Mutex<usize>,
}

impl FileLock {
    fn open(path: &Path) -> Result<Self> {
        let file = open_private(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            shared_holders: Mutex::new(0),
        })
    }

    // flock state belongs to the open file description, not to the thread:
    // the first reader takes it and the last one lets it go.
    fn acquire_shared(&self) -> Result<()> {
        let mut holders = self.shared_holders.lock();
        if *holders == 0 {
            FileExt::lock_shared(&self.file)?;
        }
        *holders += 1;
        Ok(())
    }

    fn release_shared(&self) {
        let mut holders = self.shared_holders.lock();
        *holders -= 1;
        if *holders == 0 {
            self.unlock();
        }
    }

    fn acquire_exclusive(&self) -> Result<()> {
        FileExt::lock_exclusive(&self.file)?;
        Ok(())
    }

    fn unlock(&self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = ?self.path, "Failed to release region file lock: {}", e);
        }
    }
}

/// The single reader/writer lock of a region
pub struct RegionLock {
    local: RwLock<()>,
    file: Option<FileLock>,
}

impl RegionLock {
    /// Lock for a region only reachable from this process
    pub fn in_process() -> Self {
        Self {
            local: RwLock::new(()),
            file: None,
        }
    }

    /// Lock for a region other processes may attach to
    pub fn with_lock_file(path: &Path) -> Result<Self> {
        let file = FileLock::open(path)?;
        debug!(path = ?path, "Opened region lock file");
        Ok(Self {
            local: RwLock::new(()),
            file: Some(file),
        })
    }

    /// Path of the backing lock file, if any
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Block until shared access is granted
    pub fn read(&self) -> Result<SharedLockGuard<'_>> {
        let local = self.local.read();
        if let Some(file) = &self.file {
            file.acquire_shared()?;
        }
        Ok(SharedLockGuard {
            file: self.file.as_ref(),
            _local: local,
        })
    }

    /// Block until exclusive access is granted
    pub fn write(&self) -> Result<ExclusiveLockGuard<'_>> {
        let local = self.local.write();
        if let Some(file) = &self.file {
            file.acquire_exclusive()?;
        }
        Ok(ExclusiveLockGuard {
            file: self.file.as_ref(),
            _local: local,
        })
    }
}

/// Shared hold on a region lock, released on drop
pub struct SharedLockGuard<'a> {
    file: Option<&'a FileLock>,
    _local: RwLockReadGuard<'a, ()>,
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        // The file lock goes first; the local guard drops after this body.
        if let Some(file) = self.file {
            file.release_shared();
        }
    }
}

/// Exclusive hold on a region lock, released on drop
pub struct ExclusiveLockGuard<'a> {
    file: Option<&'a FileLock>,
    _local: RwLockWriteGuard<'a, ()>,
}

impl Drop for ExclusiveLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            file.unlock();
        }
    }
}

/// Serializes region creation between processes
///
/// Held around create-or-attach so that exactly one initializer wins.
/// Released on drop (RAII).
pub struct StartupLock {
    file: File,
    path: PathBuf,
}

impl StartupLock {
    /// Block until the startup lock at `path` is ours
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_private(path)?;
        FileExt::lock_exclusive(&file)?;
        debug!(path = ?path, "Acquired startup lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = ?self.path, "Failed to release startup lock: {}", e);
        }
    }
}
