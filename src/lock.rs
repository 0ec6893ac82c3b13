//! Advisory file locks with holder metadata.
//!
//! Two locks coordinate the engine:
//! - the backup lock, held for the whole of any mutating sync or backup
//!   operation, possibly for minutes;
//! - the obsmarkers lock, held only while touching the pending log, with a
//!   short timeout so transaction hooks never stall behind a sync.
//!
//! A lock is a file created with `O_CREAT|O_EXCL` whose contents identify the
//! holder (host, pid, start time), so a blocked caller can report who to kill
//! instead of failing silently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a lock holder, persisted inside the lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub hostname: String,
    pub pid: u32,
    pub started_at_ms: u64,
}

impl LockMeta {
    fn for_this_process() -> Self {
        let started_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into()),
            pid: std::process::id(),
            started_at_ms,
        }
    }

    /// One-line description for "who is blocking me" messages.
    pub fn describe(&self) -> String {
        format!("pid {} on {}", self.pid, self.hostname)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held at {path:?}{}", holder_suffix(.meta))]
    Held {
        path: PathBuf,
        meta: Option<Box<LockMeta>>,
        meta_error: Option<String>,
    },
    #[error("timed out waiting for lock at {path:?}{}", holder_suffix(.meta))]
    Timeout {
        path: PathBuf,
        meta: Option<Box<LockMeta>>,
    },
    #[error("lock path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("lock metadata corrupted at {path:?}: {source}")]
    MetadataCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    /// The competing holder, when it could be read.
    pub fn holder(&self) -> Option<&LockMeta> {
        match self {
            LockError::Held { meta, .. } | LockError::Timeout { meta, .. } => meta.as_deref(),
            _ => None,
        }
    }
}

fn holder_suffix(meta: &Option<Box<LockMeta>>) -> String {
    match meta {
        Some(meta) => format!(" (held by {})", meta.describe()),
        None => String::new(),
    }
}

/// An exclusive lock over a named resource, released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl FileLock {
    /// Acquire without waiting. Fails with [`LockError::Held`] carrying the
    /// current holder's identity when the lock file already exists.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        reject_symlink(path)?;

        let meta = LockMeta::for_this_process();
        let mut file = match open_new_lock_file(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let (meta, meta_error) = match read_meta(path) {
                    Ok(meta) => (Some(meta), None),
                    Err(err) => (None, Some(err.to_string())),
                };
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    meta: meta.map(Box::new),
                    meta_error,
                });
            }
            Err(err) => return Err(LockError::Io(err)),
        };

        write_meta(&mut file, path, &meta)?;

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            released: false,
        })
    }

    /// Acquire, polling until `timeout` elapses.
    ///
    /// On timeout the error carries the identity of whoever held the lock at
    /// the last attempt.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            let holder = match Self::try_acquire(path) {
                Ok(lock) => return Ok(lock),
                Err(LockError::Held { meta, .. }) => meta,
                Err(err) => return Err(err),
            };
            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    meta: holder,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        if !self.released {
            fs::remove_file(&self.path)?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read the holder metadata of a lock without acquiring it.
///
/// Returns `None` when the lock is not held.
pub fn read_holder(path: &Path) -> Result<Option<LockMeta>, LockError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LockError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(Some(read_meta(path)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LockError::Io(err)),
    }
}

fn ensure_dir(path: &Path) -> Result<(), LockError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                return Err(LockError::Symlink {
                    path: path.to_path_buf(),
                });
            }
            if !meta.is_dir() {
                return Err(LockError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("expected directory at {:?}", path),
                )));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path)?;
        }
        Err(err) => return Err(LockError::Io(err)),
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), LockError> {
    if let Ok(meta) = fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(LockError::Symlink {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn read_meta(path: &Path) -> Result<LockMeta, LockError> {
    reject_symlink(path)?;
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| LockError::MetadataCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_meta(file: &mut fs::File, path: &Path, meta: &LockMeta) -> Result<(), LockError> {
    serde_json::to_writer(&mut *file, meta).map_err(|source| LockError::MetadataCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_all()?;
    Ok(())
}

fn open_new_lock_file(path: &Path) -> io::Result<fs::File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true).mode(0o600);
        options.open(path)
    }
    #[cfg(not(unix))]
    {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }
}
