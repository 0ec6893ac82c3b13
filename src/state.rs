//! Local checkpoint of the last successful sync round trip.
//!
//! One record per (repo, workspace). Only the sync engine mutates it, and
//! only after the server has accepted a push or the engine has fully applied
//! a fetched version. Erasing it forces the next sync to reconcile from
//! scratch ("recover").

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;
use crate::refs::{CloudReferences, CommitId, RepoName, WorkspaceName};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read sync state at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sync state corrupted at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write sync state at {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Heads and bookmarks as of the last version this machine observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u64,
    pub heads: Vec<CommitId>,
    pub bookmarks: BTreeMap<String, CommitId>,
}

impl SyncState {
    /// Load the state for a workspace, defaulting to version 0 (never
    /// synced) when no record exists.
    pub fn load(
        repo_root: &Path,
        reponame: &RepoName,
        workspace: &WorkspaceName,
    ) -> Result<Self, StateError> {
        let path = state_path(repo_root, reponame, workspace);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(StateError::Read { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt { path, source })
    }

    /// Persist atomically (write-then-rename), so a crash never leaves a
    /// half-written checkpoint behind.
    pub fn save(
        &self,
        repo_root: &Path,
        reponame: &RepoName,
        workspace: &WorkspaceName,
    ) -> Result<(), StateError> {
        let path = state_path(repo_root, reponame, workspace);
        let dir = path.parent().ok_or_else(|| StateError::Write {
            path: path.clone(),
            reason: "missing parent directory".into(),
        })?;
        fs::create_dir_all(dir).map_err(|err| StateError::Write {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let contents = serde_json::to_vec_pretty(self).map_err(|err| StateError::Write {
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

    /// Record a server-accepted reference set as the new checkpoint.
    pub fn advance_to(&mut self, refs: &CloudReferences) {
        self.version = refs.version;
        self.heads = refs.heads.clone();
        self.bookmarks = refs.bookmarks.clone();
    }

    /// Remove the persisted record so the next sync starts from scratch.
    pub fn erase(
        repo_root: &Path,
        reponame: &RepoName,
        workspace: &WorkspaceName,
    ) -> Result<(), StateError> {
        let path = state_path(repo_root, reponame, workspace);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Read { path, source }),
        }
    }
}

fn state_path(repo_root: &Path, reponame: &RepoName, workspace: &WorkspaceName) -> PathBuf {
    paths::sync_state_path(repo_root, reponame.as_str(), workspace.as_str())
}
