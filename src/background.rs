//! Background (unattended) backup scheduling.
//!
//! Two gates decide whether an unattended backup may run: the config switch
//! and a persisted disable-until timestamp written by `cloud disable` style
//! commands. When both pass, the attempt still only proceeds if the backup
//! lock is free; a background run never waits behind a foreground command.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Receiver};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::lock::{FileLock, LockError, LockMeta};
use crate::paths;

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Read the persisted disable-until timestamp, if any. A file that fails to
/// parse is treated as absent and logged; it only ever suppresses backups,
/// so on doubt we back up.
pub fn disabled_until(repo_root: &Path) -> Result<Option<SystemTime>, BackgroundError> {
    let path = paths::disabled_until_path(repo_root);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(BackgroundError::Read { path, source }),
    };
    match contents.trim().parse::<u64>() {
        Ok(secs) => Ok(Some(UNIX_EPOCH + Duration::from_secs(secs))),
        Err(_) => {
            warn!(path = %path.display(), "unreadable disable-until file, ignoring");
            Ok(None)
        }
    }
}

/// Persist (or clear, with `None`) the timestamp before which unattended
/// backups stay off. Stored as unix seconds so other tooling can read it.
pub fn set_disabled_until(
    repo_root: &Path,
    until: Option<SystemTime>,
) -> Result<(), BackgroundError> {
    let path = paths::disabled_until_path(repo_root);
    match until {
        Some(when) => {
            let secs = when
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let dir = path.parent().ok_or_else(|| BackgroundError::Write {
                path: path.clone(),
                reason: "missing parent directory".into(),
            })?;
            fs::create_dir_all(dir).map_err(|err| BackgroundError::Write {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            fs::write(&path, format!("{secs}\n")).map_err(|err| BackgroundError::Write {
                path: path.clone(),
                reason: err.to_string(),
            })
        }
        None => match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackgroundError::Write {
                path,
                reason: err.to_string(),
            }),
        },
    }
}

/// Whether an unattended backup may start at `now`.
pub fn autobackup_allowed(
    config: &Config,
    repo_root: &Path,
    now: SystemTime,
) -> Result<bool, BackgroundError> {
    if !config.autobackup.enabled {
        return Ok(false);
    }
    match disabled_until(repo_root)? {
        Some(until) if now < until => {
            debug!(?until, "autobackup disabled until later");
            Ok(false)
        }
        _ => Ok(true),
    }
}

/// Result of asking the scheduler to run a background job.
pub enum BackgroundAttempt<T> {
    /// Autobackup is switched off or inside a disable window.
    Disabled,
    /// A foreground operation holds the backup lock; skipped, not queued.
    LockHeld(Option<LockMeta>),
    /// The job is running on a worker thread; the receiver yields its
    /// result exactly once.
    Dispatched(Receiver<T>),
}

/// Try to start `job` in the background. The backup lock is acquired
/// without waiting and moved into the worker thread, which holds it for the
/// duration of the job.
pub fn dispatch<T, F>(
    config: &Config,
    repo_root: &Path,
    job: F,
) -> Result<BackgroundAttempt<T>, crate::Error>
where
    T: Send + 'static,
    F: FnOnce(&FileLock) -> T + Send + 'static,
{
    if !autobackup_allowed(config, repo_root, SystemTime::now())? {
        return Ok(BackgroundAttempt::Disabled);
    }

    let lock = match FileLock::try_acquire(&paths::backup_lock_path(repo_root)) {
        Ok(lock) => lock,
        Err(LockError::Held { meta, .. }) => {
            debug!("backup lock held, skipping background run");
            return Ok(BackgroundAttempt::LockHeld(meta.map(|meta| *meta)));
        }
        Err(err) => return Err(err.into()),
    };

    let (tx, rx) = channel::bounded(1);
    std::thread::spawn(move || {
        let result = job(&lock);
        drop(lock);
        let _ = tx.send(result);
    });
    Ok(BackgroundAttempt::Dispatched(rx))
}
