//! Identity atoms and the cloud reference set.
//!
//! CommitId: hex commit identifier
//! RepoName / WorkspaceName: naming for the synchronization namespace
//! CloudReferences: the server's versioned view of a workspace

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvalidId {
    #[error("invalid commit id {raw:?}: {reason}")]
    Commit { raw: String, reason: String },
    #[error("invalid workspace name {raw:?}: {reason}")]
    Workspace { raw: String, reason: String },
    #[error("invalid repo name {raw:?}: {reason}")]
    Repo { raw: String, reason: String },
}

/// Commit identifier - lowercase hex, up to a full 40-character node hash.
///
/// Short prefixes are accepted on parse; the engine always works with
/// whatever length the repository hands it and never abbreviates.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() || s.len() > 40 {
            return Err(InvalidId::Commit {
                raw: s,
                reason: "must be 1-40 characters".into(),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(InvalidId::Commit {
                raw: s,
                reason: "must be lowercase hex".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repository identity shared by every clone that syncs together.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoName(String);

impl RepoName {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Repo {
                raw: s,
                reason: "empty".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoName({:?})", self.0)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named synchronization namespace within one repository identity.
///
/// A local repository is a member of at most one workspace at a time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceName(String);

impl WorkspaceName {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidId::Workspace {
                raw: s,
                reason: "empty".into(),
            });
        }
        Ok(Self(s))
    }

    /// The workspace a user lands in when they don't name one:
    /// `user/<username>/default`.
    pub fn default_for_user(username: &str) -> Self {
        Self(format!("user/{username}/default"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WorkspaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkspaceName({:?})", self.0)
    }
}

impl fmt::Display for WorkspaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit-obsolescence record: `predecessor` was rewritten into
/// `successors` (empty successors means pruned).
///
/// Obsmarkers propagate history-rewrite events between machines. Consumers
/// must tolerate duplicate delivery of an identical record; the transfer
/// queue can legitimately replay one after a crash.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Obsmarker {
    pub predecessor: CommitId,
    pub successors: Vec<CommitId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    pub time_ms: u64,
}

/// The server's authoritative state for a (repo, workspace) pair.
///
/// `version` only ever increases, and a write is accepted only if the
/// caller's expected version matches the server's current one (compare and
/// swap). `version == 0` means the workspace has never been written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudReferences {
    pub version: u64,
    pub heads: Vec<CommitId>,
    pub bookmarks: BTreeMap<String, CommitId>,
    #[serde(default)]
    pub obsmarkers: Vec<Obsmarker>,
}
