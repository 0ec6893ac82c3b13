//! Backed-up head set for one remote path.
//!
//! Grows monotonically: `update` is a set union and nothing ever removes an
//! entry (short of deleting the file for a full recover). This is the local,
//! offline answer to "is this commit backed up"; the authoritative check
//! queries the service.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths;
use crate::refs::CommitId;
use crate::state::StateError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupStateFile {
    heads: BTreeSet<CommitId>,
}

#[derive(Debug)]
pub struct BackupState {
    path: PathBuf,
    heads: BTreeSet<CommitId>,
}

impl BackupState {
    /// Load the backed-up set for (repo, remote path), empty if absent.
    pub fn open(repo_root: &Path, remote_path: &str) -> Result<Self, StateError> {
        let path = paths::backup_state_path(repo_root, remote_path);
        let heads = match fs::read(&path) {
            Ok(bytes) => {
                let file: BackupStateFile = serde_json::from_slice(&bytes).map_err(|source| {
                    StateError::Corrupt {
                        path: path.clone(),
                        source,
                    }
                })?;
                file.heads
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => return Err(StateError::Read { path, source }),
        };
        Ok(Self { path, heads })
    }

    /// Commits verified present on the remote store.
    pub fn heads(&self) -> &BTreeSet<CommitId> {
        &self.heads
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.heads.contains(id)
    }

    /// Mark commits as confirmed backed up and persist. Union only; the set
    /// never shrinks.
    pub fn update<I>(&mut self, ids: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = CommitId>,
    {
        let before = self.heads.len();
        self.heads.extend(ids);
        if self.heads.len() == before {
            return Ok(());
        }
        self.save()
    }

    fn save(&self) -> Result<(), StateError> {
        let dir = self.path.parent().ok_or_else(|| StateError::Write {
            path: self.path.clone(),
            reason: "missing parent directory".into(),
        })?;
        fs::create_dir_all(dir).map_err(|err| StateError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        let file = BackupStateFile {
            heads: self.heads.clone(),
        };
        let contents = serde_json::to_vec_pretty(&file).map_err(|err| StateError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        let temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| StateError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        fs::write(temp.path(), &contents).map_err(|err| StateError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        temp.persist(&self.path).map_err(|err| StateError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }
}
