//! Local backup bookkeeping: which commits are known to be on the remote
//! store, and the per-machine bookmark snapshots used for cross-machine
//! restore.

mod bookmarks;
mod state;

pub use bookmarks::{
    BackupSnapshot, ValidationError, backup_hostname, delete_snapshot, download_snapshots,
    push_snapshot, read_local_snapshot, select_restore_snapshot, validate_hostname,
    validate_reporoot, write_local_snapshot,
};
pub use state::BackupState;
