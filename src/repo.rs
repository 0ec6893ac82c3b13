//! Narrow interface to the version-control engine.
//!
//! The engine underneath exposes far more than sync needs; this trait pins
//! down exactly the operations the protocol depends on, so the sync engine
//! can be driven by an adapter in production and an in-memory fake in tests.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::refs::CommitId;

/// A repository operation failed. The engine does not interpret these beyond
/// reporting them; retry policy belongs to the caller.
#[derive(Debug, Error)]
#[error("repository operation failed: {message}")]
pub struct RepoError {
    pub message: String,
}

impl RepoError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// One bookmark edit applied in a repository transaction. `None` deletes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookmarkChange {
    pub name: String,
    pub target: Option<CommitId>,
}

pub trait VcsRepo {
    /// Commits with no visible descendants.
    fn visible_heads(&self) -> Result<Vec<CommitId>, RepoError>;

    fn bookmarks(&self) -> Result<BTreeMap<String, CommitId>, RepoError>;

    /// Apply bookmark edits in a single transaction. Edits whose target is
    /// not present locally are the caller's bug; implementations may skip
    /// them with a warning rather than fail the batch.
    fn apply_bookmark_changes(&self, changes: &[BookmarkChange]) -> Result<(), RepoError>;

    /// Fetch the given commits (and ancestors) from the repository's normal
    /// remote. Order matters: the sync engine pulls heads before
    /// bookmark-only targets so bookmark creation never references an absent
    /// commit.
    fn pull(&self, ids: &[CommitId]) -> Result<(), RepoError>;

    /// Is the commit present locally (possibly hidden)?
    fn is_known(&self, id: &CommitId) -> Result<bool, RepoError>;

    /// Ancestry query: is `ancestor` an ancestor of `descendant`? A commit
    /// is an ancestor of itself.
    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool, RepoError>;

    fn working_copy_parent(&self) -> Result<CommitId, RepoError>;

    fn update_working_copy(&self, target: &CommitId) -> Result<(), RepoError>;

    /// Is the commit in the currently visible set?
    fn is_visible(&self, id: &CommitId) -> Result<bool, RepoError>;

    /// Nearest visible descendant of a (possibly hidden) commit, if any.
    fn nearest_visible_descendant(&self, id: &CommitId) -> Result<Option<CommitId>, RepoError>;
}
