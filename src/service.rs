//! Interface to the remote cloud service.
//!
//! The wire protocol, transport, and authentication token handling live
//! outside this crate; the engine depends only on the operations below. Every
//! call may fail with [`ServiceError::Unavailable`], which callers treat as
//! "abort, local state untouched, retry later".

use std::collections::BTreeMap;

use thiserror::Error;

use crate::backup::BackupSnapshot;
use crate::refs::{CloudReferences, CommitId, Obsmarker, RepoName, WorkspaceName};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not authenticated with the cloud service: {0}")]
    Auth(String),
    #[error("cloud service unavailable: {0}")]
    Unavailable(String),
    #[error("cloud service rejected the request: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }
}

/// Result of a conditional reference update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The server applied the write and bumped the version.
    Accepted { version: u64 },
    /// The expected version was stale. When the server echoes its current
    /// reference set the engine re-merges without another fetch; a server
    /// that echoes nothing forces a re-fetch.
    Rejected { current: Option<CloudReferences> },
}

/// Commit-graph view of a workspace, for display by outer tooling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SmartlogView {
    /// (commit, parents) pairs in topological order.
    pub commits: Vec<(CommitId, Vec<CommitId>)>,
    pub bookmarks: BTreeMap<String, CommitId>,
}

/// The remote collaborator the sync engine talks to.
///
/// Updates are linearized by the version compare-and-swap: only one push per
/// version number is ever accepted, and pushing an identical payload against
/// the same expected version twice must yield the same resulting reference
/// set as pushing it once (idempotent under retry of a dropped response).
pub trait CloudService {
    /// Fetch the current reference set, or one at least as new as
    /// `min_version` if the service can wait for it.
    fn get_references(
        &self,
        reponame: &RepoName,
        workspace: &WorkspaceName,
        min_version: u64,
    ) -> Result<CloudReferences, ServiceError>;

    /// Conditionally replace the reference set. Accepted only if the
    /// server's current version equals `expected_version`.
    fn update_references(
        &self,
        reponame: &RepoName,
        workspace: &WorkspaceName,
        expected_version: u64,
        heads: Vec<CommitId>,
        bookmarks: BTreeMap<String, CommitId>,
        obsmarkers: Vec<Obsmarker>,
    ) -> Result<UpdateOutcome, ServiceError>;

    fn get_smartlog(
        &self,
        reponame: &RepoName,
        workspace: &WorkspaceName,
    ) -> Result<SmartlogView, ServiceError>;

    /// Verify the stored credential works. `Err(Auth)` means interactive
    /// re-authentication is needed.
    fn check_auth(&self) -> Result<(), ServiceError>;

    /// Upload commits to the backup store. Returns, per id, whether the
    /// upload succeeded; partial failure is expected and non-fatal.
    fn backup_commits(&self, ids: &[CommitId]) -> Result<Vec<(CommitId, bool)>, ServiceError>;

    /// Authoritative presence check on the remote store, as opposed to the
    /// local cached answer in [`crate::backup::BackupState`].
    fn is_backed_up(&self, ids: &[CommitId]) -> Result<Vec<(CommitId, bool)>, ServiceError>;

    /// Store the backup bookmark snapshot for (user, hostname, reporoot).
    fn put_backup_snapshot(
        &self,
        user: &str,
        hostname: &str,
        reporoot: &str,
        snapshot: &BackupSnapshot,
    ) -> Result<(), ServiceError>;

    /// Enumerate snapshots for a user, optionally narrowed by hostname
    /// and/or reporoot. Keys are (hostname, reporoot).
    fn get_backup_snapshots(
        &self,
        user: &str,
        hostname: Option<&str>,
        reporoot: Option<&str>,
    ) -> Result<BTreeMap<(String, String), BackupSnapshot>, ServiceError>;

    fn delete_backup_snapshot(
        &self,
        user: &str,
        hostname: &str,
        reporoot: &str,
    ) -> Result<(), ServiceError>;
}
