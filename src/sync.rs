//! Cloud sync reconciliation engine.
//!
//! One sync invocation, run entirely under the backup lock:
//!
//! 1. accept or fetch the server's reference set
//! 2. short-circuit if a requested target version is already satisfied
//! 3. drain pending obsmarkers into the syncing stage
//! 4. pull remote commits this machine lacks (heads first, then
//!    bookmark-only targets, so bookmark creation never references an
//!    absent commit)
//! 5. merge bookmarks (remote wins unless the local value strictly
//!    descends from it) and union heads
//! 6. push the merged state with the expected version attached; on a
//!    stale-version rejection, re-merge against the server's current refs
//!    and retry, bounded
//! 7. on acceptance: clear the syncing stage, checkpoint LocalSyncState,
//!    fold the confirmed heads into the backed-up set
//! 8. reposition the working copy if the merge hid its parent
//!
//! The push is a compare-and-swap on the version, so replaying an identical
//! payload after a dropped response is safe: the next fetch sees our own
//! data echoed back as current.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Transience;
use crate::backup::BackupState;
use crate::lock::FileLock;
use crate::obsmarkers::{self, QueueError};
use crate::refs::{CloudReferences, CommitId, RepoName, WorkspaceName};
use crate::repo::{BookmarkChange, RepoError, VcsRepo};
use crate::service::{CloudService, ServiceError, UpdateOutcome};
use crate::state::{StateError, SyncState};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("lost the push race {attempts} times; workspace needs resync")]
    VersionConflict { attempts: u32 },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl SyncError {
    pub fn transience(&self) -> Transience {
        match self {
            SyncError::VersionConflict { .. } => Transience::Retryable,
            SyncError::Service(err) if err.is_retryable() => Transience::Retryable,
            SyncError::Service(_) => Transience::Permanent,
            SyncError::Repo(_) | SyncError::Queue(_) | SyncError::State(_) => Transience::Unknown,
        }
    }
}

/// What happened to the working copy at the end of a sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkingCopyAction {
    /// Parent still visible; nothing to do.
    Unmoved,
    /// Parent was hidden by the merge; moved to its nearest visible
    /// descendant.
    Moved { from: CommitId, to: CommitId },
    /// Parent was hidden and no visible descendant exists; the user has to
    /// decide where to go.
    NeedsManualAttention { parent: CommitId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Workspace version after this sync.
    pub version: u64,
    /// Whether a push was accepted (false when there was nothing to send).
    pub pushed: bool,
    /// Commits fetched from the remote during the pull phase.
    pub pulled: Vec<CommitId>,
    /// True when a requested target version was already satisfied and the
    /// sync did no work.
    pub skipped: bool,
    pub working_copy: WorkingCopyAction,
}

/// Everything a single sync invocation needs to know.
pub struct SyncRequest<'a> {
    pub repo_root: &'a Path,
    pub reponame: &'a RepoName,
    pub workspace: &'a WorkspaceName,
    /// Remote path keying the local backed-up-heads cache.
    pub remote_path: &'a str,
    pub max_push_retries: u32,
    /// Reference set already fetched by the caller (e.g. rejoin), to avoid
    /// a second round trip.
    pub prefetched: Option<CloudReferences>,
    /// Skip the sync entirely if the local state already reached this
    /// version.
    pub target_version: Option<u64>,
}

/// Run one full reconciliation. The caller must hold the backup lock and
/// passes it as witness; queue operations check the same witness.
pub fn sync(
    mut req: SyncRequest<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    backup_lock: &FileLock,
) -> Result<SyncOutcome, SyncError> {
    let mut state = SyncState::load(req.repo_root, req.reponame, req.workspace)?;

    if let Some(target) = req.target_version
        && state.version >= target
    {
        debug!(
            workspace = %req.workspace,
            version = state.version,
            target,
            "target version already reached, skipping sync"
        );
        return Ok(SyncOutcome {
            version: state.version,
            pushed: false,
            pulled: Vec::new(),
            skipped: true,
            working_copy: WorkingCopyAction::Unmoved,
        });
    }

    let wc_parent = repo.working_copy_parent()?;

    let mut refs = match req.prefetched.take() {
        Some(refs) => refs,
        None => service.get_references(req.reponame, req.workspace, state.version)?,
    };

    obsmarkers::drain_to_syncing(req.repo_root, backup_lock)?;
    let markers = obsmarkers::read_syncing(req.repo_root, backup_lock)?;

    let mut pulled_total = Vec::new();
    let mut attempts = 0u32;
    let (version, pushed) = loop {
        let pulled = pull_phase(repo, &state, &refs)?;
        pulled_total.extend(pulled);

        let local_bookmarks = repo.bookmarks()?;
        let merge = merge_bookmarks(&state, &local_bookmarks, &refs.bookmarks, repo)?;
        if !merge.local_changes.is_empty() {
            repo.apply_bookmark_changes(&merge.local_changes)?;
        }

        let local_heads = repo.visible_heads()?;
        let merged_heads = merge_heads(&refs.heads, &local_heads);

        let heads_unchanged = as_set(&merged_heads) == as_set(&refs.heads);
        if heads_unchanged && merge.merged == refs.bookmarks && markers.is_empty() {
            // Nothing of ours to send; the fetched refs are the new
            // checkpoint.
            obsmarkers::clear_syncing(req.repo_root, backup_lock)?;
            state.advance_to(&refs);
            state.save(req.repo_root, req.reponame, req.workspace)?;
            record_backed_up(&req, &refs.heads)?;
            break (refs.version, false);
        }

        match service.update_references(
            req.reponame,
            req.workspace,
            refs.version,
            merged_heads.clone(),
            merge.merged.clone(),
            markers.clone(),
        )? {
            UpdateOutcome::Accepted { version } => {
                obsmarkers::clear_syncing(req.repo_root, backup_lock)?;
                state.version = version;
                state.heads = merged_heads.clone();
                state.bookmarks = merge.merged;
                state.save(req.repo_root, req.reponame, req.workspace)?;
                record_backed_up(&req, &merged_heads)?;
                info!(
                    workspace = %req.workspace,
                    version,
                    heads = merged_heads.len(),
                    markers = markers.len(),
                    "cloud references updated"
                );
                break (version, true);
            }
            UpdateOutcome::Rejected { current } => {
                attempts += 1;
                if attempts >= req.max_push_retries {
                    return Err(SyncError::VersionConflict { attempts });
                }
                debug!(
                    workspace = %req.workspace,
                    expected = refs.version,
                    attempt = attempts,
                    "push rejected for stale version, re-merging"
                );
                refs = match current {
                    Some(refs) => refs,
                    None => service.get_references(req.reponame, req.workspace, 0)?,
                };
            }
        }
    };

    let working_copy = reconcile_working_copy(repo, &wc_parent)?;

    Ok(SyncOutcome {
        version,
        pushed,
        pulled: pulled_total,
        skipped: false,
        working_copy,
    })
}

/// Fetch remote commits this machine is missing: heads first, then commits
/// referenced only by bookmarks. Nothing is pulled when the remote version
/// is not ahead of our checkpoint.
fn pull_phase(
    repo: &dyn VcsRepo,
    state: &SyncState,
    refs: &CloudReferences,
) -> Result<Vec<CommitId>, SyncError> {
    if refs.version <= state.version {
        return Ok(Vec::new());
    }

    let mut pulled = Vec::new();

    let mut missing_heads = Vec::new();
    for head in &refs.heads {
        if !repo.is_known(head)? {
            missing_heads.push(head.clone());
        }
    }
    if !missing_heads.is_empty() {
        repo.pull(&missing_heads)?;
        pulled.extend(missing_heads);
    }

    let head_set: BTreeSet<&CommitId> = refs.heads.iter().collect();
    let mut missing_targets = Vec::new();
    for target in refs.bookmarks.values() {
        if !head_set.contains(target) && !missing_targets.contains(target) && !repo.is_known(target)? {
            missing_targets.push(target.clone());
        }
    }
    if !missing_targets.is_empty() {
        repo.pull(&missing_targets)?;
        pulled.extend(missing_targets);
    }

    Ok(pulled)
}

struct BookmarkMerge {
    /// The bookmark mapping to push.
    merged: BTreeMap<String, CommitId>,
    /// Edits to apply to the local repository.
    local_changes: Vec<BookmarkChange>,
}

/// Last-writer-plus-ancestry merge, not a three-way merge:
///
/// - both sides moved a bookmark: remote wins unless the local target is a
///   strict descendant of the remote one, in which case the local value is
///   kept and re-pushed;
/// - only local has it: it is added (new) or, if the last checkpoint had it,
///   it was deleted remotely and the deletion is applied locally;
/// - only remote has it: it is adopted locally (new) or, if the last
///   checkpoint had it, it was deleted locally and the deletion is pushed.
///
/// A local target that loses to the remote stays visible as an extra head;
/// the commit is never lost, only the pointer.
fn merge_bookmarks(
    state: &SyncState,
    local: &BTreeMap<String, CommitId>,
    remote: &BTreeMap<String, CommitId>,
    repo: &dyn VcsRepo,
) -> Result<BookmarkMerge, SyncError> {
    let mut merged = BTreeMap::new();
    let mut local_changes = Vec::new();

    let mut names: BTreeSet<&String> = local.keys().collect();
    names.extend(remote.keys());
    names.extend(state.bookmarks.keys());

    for name in names {
        let last = state.bookmarks.get(name);
        match (local.get(name), remote.get(name)) {
            (Some(loc), Some(rem)) if loc == rem => {
                merged.insert(name.clone(), loc.clone());
            }
            (Some(loc), Some(rem)) => {
                let keep_local = repo.is_ancestor(rem, loc)? && loc != rem;
                if keep_local {
                    merged.insert(name.clone(), loc.clone());
                } else {
                    merged.insert(name.clone(), rem.clone());
                    local_changes.push(BookmarkChange {
                        name: name.clone(),
                        target: Some(rem.clone()),
                    });
                    warn!(
                        bookmark = %name,
                        local = %loc,
                        remote = %rem,
                        "bookmark diverged, remote value wins"
                    );
                }
            }
            (Some(loc), None) => {
                if last.is_some() {
                    // Deleted remotely since our checkpoint.
                    local_changes.push(BookmarkChange {
                        name: name.clone(),
                        target: None,
                    });
                } else {
                    merged.insert(name.clone(), loc.clone());
                }
            }
            (None, Some(rem)) => {
                if last.is_some() {
                    // Deleted locally since our checkpoint; push the
                    // deletion by leaving it out of the merged set.
                } else {
                    merged.insert(name.clone(), rem.clone());
                    local_changes.push(BookmarkChange {
                        name: name.clone(),
                        target: Some(rem.clone()),
                    });
                }
            }
            (None, None) => {}
        }
    }

    Ok(BookmarkMerge {
        merged,
        local_changes,
    })
}

/// Union of remote and local heads, remote order first, local-only heads
/// appended in their repository order.
fn merge_heads(remote: &[CommitId], local: &[CommitId]) -> Vec<CommitId> {
    let mut merged = remote.to_vec();
    let seen: BTreeSet<&CommitId> = remote.iter().collect();
    for head in local {
        if !seen.contains(head) {
            merged.push(head.clone());
        }
    }
    merged
}

fn as_set(heads: &[CommitId]) -> BTreeSet<&CommitId> {
    heads.iter().collect()
}

fn record_backed_up(req: &SyncRequest<'_>, heads: &[CommitId]) -> Result<(), StateError> {
    let mut backup = BackupState::open(req.repo_root, req.remote_path)?;
    backup.update(heads.iter().cloned())
}

/// Move the working copy off a commit the merge hid. Runs after all locks
/// over shared structures are settled; only the working copy itself changes.
fn reconcile_working_copy(
    repo: &dyn VcsRepo,
    old_parent: &CommitId,
) -> Result<WorkingCopyAction, SyncError> {
    if repo.is_visible(old_parent)? {
        return Ok(WorkingCopyAction::Unmoved);
    }
    match repo.nearest_visible_descendant(old_parent)? {
        Some(dest) => {
            repo.update_working_copy(&dest)?;
            info!(from = %old_parent, to = %dest, "moved working copy off hidden commit");
            Ok(WorkingCopyAction::Moved {
                from: old_parent.clone(),
                to: dest,
            })
        }
        None => {
            warn!(
                parent = %old_parent,
                "working copy parent was hidden and has no visible descendant"
            );
            Ok(WorkingCopyAction::NeedsManualAttention {
                parent: old_parent.clone(),
            })
        }
    }
}
