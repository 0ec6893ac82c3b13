//! Backup bookmark snapshots.
//!
//! A snapshot records the heads and bookmarks of one repository on one
//! machine at backup time, keyed remotely by (user, hostname, repo root) so
//! backups made from any machine can be enumerated and selectively restored
//! later. A copy of the last pushed snapshot is kept locally as well.
//!
//! Hostname and repo root arrive from user input on restore/delete and are
//! validated against a restrictive character set before they are used to
//! address a backup remotely.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;
use crate::refs::CommitId;
use crate::service::{CloudService, ServiceError};
use crate::state::StateError;

/// Heads plus bookmark mapping at backup time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub heads: Vec<CommitId>,
    pub bookmarks: BTreeMap<String, CommitId>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("hostname {0:?} contains unexpected characters")]
    Hostname(String),
    #[error("repo root {0:?} contains unexpected characters")]
    RepoRoot(String),
    #[error("no backup found for {reporoot} on {hostname}")]
    NoSuchBackup { hostname: String, reporoot: String },
    #[error("multiple backups match; specify hostname and repo root")]
    Ambiguous,
}

/// Hostnames may contain alphanumerics, `-` and `.` only.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    let ok = !hostname.is_empty()
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::Hostname(hostname.to_string()))
    }
}

/// Repo roots additionally allow `_` and `/`.
pub fn validate_reporoot(reporoot: &str) -> Result<(), ValidationError> {
    let ok = !reporoot.is_empty()
        && reporoot
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'/'));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::RepoRoot(reporoot.to_string()))
    }
}

/// The hostname this machine's backups are keyed under.
pub fn backup_hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into())
}

/// Store the snapshot locally and upload it under this machine's identity.
pub fn push_snapshot(
    service: &dyn CloudService,
    repo_root: &Path,
    remote_path: &str,
    user: &str,
    snapshot: &BackupSnapshot,
) -> Result<(), ServiceError> {
    let hostname = backup_hostname();
    let reporoot = repo_root.to_string_lossy();
    service.put_backup_snapshot(user, &hostname, &reporoot, snapshot)?;
    if let Err(err) = write_local_snapshot(repo_root, remote_path, snapshot) {
        // The upload is what matters; a stale local copy only costs a
        // redundant future upload.
        tracing::warn!(error = %err, "failed to record local backup snapshot");
    }
    Ok(())
}

/// Enumerate a user's snapshots, optionally narrowed by hostname/reporoot.
/// Filters are validated before the remote call.
pub fn download_snapshots(
    service: &dyn CloudService,
    user: &str,
    hostname: Option<&str>,
    reporoot: Option<&str>,
) -> Result<BTreeMap<(String, String), BackupSnapshot>, crate::Error> {
    if let Some(hostname) = hostname {
        validate_hostname(hostname)?;
    }
    if let Some(reporoot) = reporoot {
        validate_reporoot(reporoot)?;
    }
    Ok(service.get_backup_snapshots(user, hostname, reporoot)?)
}

/// Pick the single snapshot to restore, failing when the filters match none
/// or more than one.
pub fn select_restore_snapshot(
    snapshots: BTreeMap<(String, String), BackupSnapshot>,
) -> Result<((String, String), BackupSnapshot), ValidationError> {
    let mut iter = snapshots.into_iter();
    let first = iter.next().ok_or(ValidationError::NoSuchBackup {
        hostname: "<any>".into(),
        reporoot: "<any>".into(),
    })?;
    if iter.next().is_some() {
        return Err(ValidationError::Ambiguous);
    }
    Ok(first)
}

/// Delete one snapshot from the server. Identifiers are validated first;
/// nothing remote is touched on bad input.
pub fn delete_snapshot(
    service: &dyn CloudService,
    user: &str,
    hostname: &str,
    reporoot: &str,
) -> Result<(), crate::Error> {
    validate_hostname(hostname)?;
    validate_reporoot(reporoot)?;
    let existing = service.get_backup_snapshots(user, Some(hostname), Some(reporoot))?;
    if !existing.contains_key(&(hostname.to_string(), reporoot.to_string())) {
        return Err(ValidationError::NoSuchBackup {
            hostname: hostname.to_string(),
            reporoot: reporoot.to_string(),
        }
        .into());
    }
    service.delete_backup_snapshot(user, hostname, reporoot)?;
    Ok(())
}

pub fn write_local_snapshot(
    repo_root: &Path,
    remote_path: &str,
    snapshot: &BackupSnapshot,
) -> Result<(), StateError> {
    let path = paths::backup_snapshot_path(repo_root, remote_path);
    let dir = path.parent().ok_or_else(|| StateError::Write {
        path: path.clone(),
        reason: "missing parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    let contents = serde_json::to_vec_pretty(snapshot).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    fs::write(temp.path(), &contents).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    temp.persist(&path).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    Ok(())
}

pub fn read_local_snapshot(
    repo_root: &Path,
    remote_path: &str,
) -> Result<Option<BackupSnapshot>, StateError> {
    let path = paths::backup_snapshot_path(repo_root, remote_path);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StateError::Read { path, source }),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StateError::Corrupt { path, source })
}
