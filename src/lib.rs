#![forbid(unsafe_code)]

//! Synchronization and backup coordination engine for cloud workspaces.
//!
//! Many working copies of the same repository stay in sync through a central
//! service: commits and bookmark moves made on one machine become pullable on
//! every other machine joined to the same named workspace. Commits can also be
//! backed up to the service without joining a workspace.
//!
//! The crate owns the coordination protocol only. The remote service transport
//! and the version-control engine itself are external collaborators behind the
//! [`CloudService`] and [`VcsRepo`] traits.

pub mod background;
pub mod backup;
pub mod config;
pub mod error;
pub mod lock;
pub mod obsmarkers;
pub mod ops;
mod paths;
pub mod refs;
pub mod repo;
pub mod service;
pub mod state;
pub mod subscription;
pub mod sync;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::backup::{BackupSnapshot, BackupState};
pub use crate::config::Config;
pub use crate::lock::{FileLock, LockError, LockMeta};
pub use crate::refs::{CloudReferences, CommitId, Obsmarker, RepoName, WorkspaceName};
pub use crate::repo::{BookmarkChange, RepoError, VcsRepo};
pub use crate::service::{CloudService, ServiceError, UpdateOutcome};
pub use crate::state::SyncState;
pub use crate::sync::{SyncOutcome, WorkingCopyAction};
