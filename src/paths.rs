//! File layout for per-repository sync state.
//!
//! Everything the engine persists lives under `<repo_root>/.cloudsync/`.
//! State files that are keyed by a workspace or a remote path embed a short
//! content hash of the key so that renames never alias each other.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Root directory for all engine state inside one repository.
pub(crate) fn cloudsync_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(".cloudsync")
}

/// Current workspace membership record.
pub(crate) fn workspace_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("workspace")
}

/// Backup lock file. Serializes all mutating sync/backup operations.
pub(crate) fn backup_lock_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("backup.lock")
}

/// Short-held lock protecting the pending obsmarker log.
pub(crate) fn obsmarkers_lock_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("obsmarkers.lock")
}

/// Pending obsmarker log: appended to by every transaction.
pub(crate) fn pending_obsmarkers_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("pendingobsmarkers.log")
}

/// Syncing obsmarker log: staged for upload by the sync engine.
pub(crate) fn syncing_obsmarkers_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("syncingobsmarkers.log")
}

/// Local sync state for one workspace.
pub(crate) fn sync_state_path(repo_root: &Path, reponame: &str, workspace: &str) -> PathBuf {
    let key = short_hash(&[reponame, workspace]);
    cloudsync_dir(repo_root).join(format!("syncstate.{key}.json"))
}

/// Backed-up head set for one remote path.
pub(crate) fn backup_state_path(repo_root: &Path, remote_path: &str) -> PathBuf {
    let key = short_hash(&[remote_path]);
    cloudsync_dir(repo_root).join(format!("backedupheads.{key}.json"))
}

/// Local copy of the last pushed backup bookmark snapshot.
pub(crate) fn backup_snapshot_path(repo_root: &Path, remote_path: &str) -> PathBuf {
    let key = short_hash(&[remote_path]);
    cloudsync_dir(repo_root).join(format!("backupsnapshot.{key}.json"))
}

/// Autobackup disable-until timestamp (unix seconds).
pub(crate) fn disabled_until_path(repo_root: &Path) -> PathBuf {
    cloudsync_dir(repo_root).join("autobackup.disableduntil")
}

/// Directory holding one marker file per joined (repo, workspace) identity,
/// scanned by the local notification daemon.
pub(crate) fn joined_dir(home: &Path) -> PathBuf {
    home.join(".cloudsync").join("joined")
}

/// Stable 32-hex-char identifier for a tuple of key parts.
pub(crate) fn short_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
