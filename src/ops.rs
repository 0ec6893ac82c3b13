//! Operator-facing operations: join/leave/rejoin, sync, recover, backup,
//! restore, and autobackup control.
//!
//! Each operation here is one user-visible command. They own lock
//! acquisition and the orchestration of the sync engine, the backup store,
//! and the subscription manager; the modules underneath stay policy-free.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::background;
use crate::backup::{self, BackupSnapshot, BackupState, backup_hostname};
use crate::config::Config;
use crate::lock::{FileLock, LockError};
use crate::paths;
use crate::refs::{CommitId, RepoName, WorkspaceName};
use crate::repo::{BookmarkChange, VcsRepo};
use crate::service::CloudService;
use crate::state::{StateError, SyncState};
use crate::subscription::{Subscription, SubscriptionManager};
use crate::sync::{self, SyncOutcome, SyncRequest};
use crate::{Error, Result};

/// Shared inputs for every operation.
pub struct OpContext<'a> {
    pub repo_root: &'a Path,
    pub config: &'a Config,
    /// Account the backup snapshots are keyed under.
    pub user: &'a str,
    /// Set after a restore: the next unattended backup would race the
    /// freshly pulled commits, so hooks consult this and stand down once.
    pub ignore_autobackup: bool,
}

impl<'a> OpContext<'a> {
    pub fn new(repo_root: &'a Path, config: &'a Config, user: &'a str) -> Self {
        Self {
            repo_root,
            config,
            user,
            ignore_autobackup: false,
        }
    }

    fn reponame(&self) -> Result<RepoName> {
        Ok(self.config.require_reponame()?)
    }

    fn acquire_backup_lock(&self) -> Result<FileLock> {
        Ok(FileLock::acquire(
            &paths::backup_lock_path(self.repo_root),
            self.config.sync.lock_timeout(),
        )?)
    }

    fn subscriptions(&self) -> SubscriptionManager {
        SubscriptionManager::new(&self.config.subscription)
    }
}

/// The workspace this repository is joined to, if any.
pub fn current_workspace(repo_root: &Path) -> Result<Option<WorkspaceName>> {
    let path = paths::workspace_path(repo_root);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StateError::Read { path, source }.into()),
    };
    let name = WorkspaceName::new(contents.trim()).map_err(|err| {
        crate::config::ConfigError::Invalid {
            name: "workspace",
            reason: err.to_string(),
        }
    })?;
    Ok(Some(name))
}

fn set_workspace(repo_root: &Path, workspace: &WorkspaceName) -> Result<()> {
    let path = paths::workspace_path(repo_root);
    let dir = path.parent().ok_or_else(|| StateError::Write {
        path: path.clone(),
        reason: "missing parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|err| StateError::Write {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    fs::write(&path, format!("{workspace}\n")).map_err(|err| StateError::Write {
        path,
        reason: err.to_string(),
    })?;
    Ok(())
}

fn clear_workspace(repo_root: &Path) -> Result<()> {
    let path = paths::workspace_path(repo_root);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::Read { path, source }.into()),
    }
}

/// Join a workspace and run the first sync against it.
///
/// Joining erases any previous sync checkpoint so the engine reconciles
/// from scratch rather than against the state of a different workspace.
pub fn join(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    workspace: &WorkspaceName,
) -> Result<SyncOutcome> {
    let reponame = ctx.reponame()?;
    let lock = ctx.acquire_backup_lock()?;
    service.check_auth()?;

    let refs = service.get_references(&reponame, workspace, 0)?;
    info!(workspace = %workspace, version = refs.version, "joining workspace");

    SyncState::erase(ctx.repo_root, &reponame, workspace)?;
    set_workspace(ctx.repo_root, workspace)?;

    let outcome = run_sync(ctx, repo, service, &reponame, workspace, &lock, Some(refs), None)?;

    ctx.subscriptions()
        .join(&Subscription::new(ctx.repo_root, &reponame, workspace));
    Ok(outcome)
}

/// Leave the current workspace. Idempotent: leaving when not joined is a
/// successful no-op, reported through the return value.
pub fn leave(ctx: &OpContext<'_>) -> Result<Option<WorkspaceName>> {
    let reponame = ctx.reponame()?;
    let Some(workspace) = current_workspace(ctx.repo_root)? else {
        return Ok(None);
    };
    let _lock = ctx.acquire_backup_lock()?;

    ctx.subscriptions()
        .leave(&Subscription::new(ctx.repo_root, &reponame, &workspace));
    SyncState::erase(ctx.repo_root, &reponame, &workspace)?;
    clear_workspace(ctx.repo_root)?;
    info!(workspace = %workspace, "left workspace");
    Ok(Some(workspace))
}

/// Re-join the user's default workspace if it exists on the server.
///
/// Used by tooling that notices a repository has cloud config but no
/// membership. A workspace that was never written to (version 0) is not
/// worth joining automatically; the fetched references are reused by the
/// sync so the server is only asked once.
pub fn rejoin(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    username: &str,
) -> Result<Option<SyncOutcome>> {
    if current_workspace(ctx.repo_root)?.is_some() {
        return Ok(None);
    }
    let reponame = ctx.reponame()?;
    let workspace = WorkspaceName::default_for_user(username);

    let refs = service.get_references(&reponame, &workspace, 0)?;
    if refs.version == 0 {
        info!(workspace = %workspace, "no populated default workspace to rejoin");
        return Ok(None);
    }

    let lock = ctx.acquire_backup_lock()?;
    SyncState::erase(ctx.repo_root, &reponame, &workspace)?;
    set_workspace(ctx.repo_root, &workspace)?;
    let outcome = run_sync(
        ctx,
        repo,
        service,
        &reponame,
        &workspace,
        &lock,
        Some(refs),
        None,
    )?;
    ctx.subscriptions()
        .join(&Subscription::new(ctx.repo_root, &reponame, &workspace));
    Ok(Some(outcome))
}

/// Run one sync of the joined workspace. `target_version` lets a
/// notification-driven caller skip the round trip when the local state
/// already caught up.
pub fn sync_command(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    target_version: Option<u64>,
) -> Result<SyncOutcome> {
    let reponame = ctx.reponame()?;
    let workspace = require_workspace(ctx.repo_root)?;
    let lock = ctx.acquire_backup_lock()?;
    run_sync(ctx, repo, service, &reponame, &workspace, &lock, None, target_version)
}

/// Sync invoked by automation rather than a user.
///
/// Stands down quietly when unattended backups are switched off, inside a
/// disable window, or right after a restore (`ignore_autobackup`), and never
/// waits on the backup lock: a busy lock means a foreground operation is
/// already moving state, so the attempt is skipped, not queued. Explicit
/// commands use [`sync_command`], which waits and reports lock errors.
pub fn background_sync(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    target_version: Option<u64>,
) -> Result<Option<SyncOutcome>> {
    if ctx.ignore_autobackup {
        return Ok(None);
    }
    if !background::autobackup_allowed(ctx.config, ctx.repo_root, SystemTime::now())? {
        return Ok(None);
    }
    let reponame = ctx.reponame()?;
    let workspace = require_workspace(ctx.repo_root)?;
    let lock = match FileLock::try_acquire(&paths::backup_lock_path(ctx.repo_root)) {
        Ok(lock) => lock,
        Err(LockError::Held { meta, .. }) => {
            match meta {
                Some(meta) => debug!(holder = %meta.describe(), "backup lock busy, skipping unattended sync"),
                None => debug!("backup lock busy, skipping unattended sync"),
            }
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    run_sync(ctx, repo, service, &reponame, &workspace, &lock, None, target_version).map(Some)
}

/// Throw away the local sync checkpoint and reconcile from scratch. The
/// escape hatch for a checkpoint that no longer matches reality.
pub fn recover(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
) -> Result<SyncOutcome> {
    let reponame = ctx.reponame()?;
    let workspace = require_workspace(ctx.repo_root)?;
    let lock = ctx.acquire_backup_lock()?;
    warn!(workspace = %workspace, "erasing sync checkpoint for recovery");
    SyncState::erase(ctx.repo_root, &reponame, &workspace)?;
    run_sync(ctx, repo, service, &reponame, &workspace, &lock, None, None)
}

#[allow(clippy::too_many_arguments)]
fn run_sync(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    reponame: &RepoName,
    workspace: &WorkspaceName,
    lock: &FileLock,
    prefetched: Option<crate::refs::CloudReferences>,
    target_version: Option<u64>,
) -> Result<SyncOutcome> {
    let request = SyncRequest {
        repo_root: ctx.repo_root,
        reponame,
        workspace,
        remote_path: &ctx.config.remote_path,
        max_push_retries: ctx.config.sync.max_push_retries,
        prefetched,
        target_version,
    };
    Ok(sync::sync(request, repo, service, lock)?)
}

fn require_workspace(repo_root: &Path) -> Result<WorkspaceName> {
    current_workspace(repo_root)?.ok_or_else(|| {
        Error::Config(crate::config::ConfigError::Missing("workspace"))
    })
}

/// Result of one backup pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupOutcome {
    pub backed_up: Vec<CommitId>,
    pub failed: Vec<CommitId>,
}

impl BackupOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Back up commits the remote store does not have yet: the given revisions,
/// or every visible head when none are named.
///
/// Partial failure is recorded, not fatal: commits that did upload are
/// remembered so the next pass only retries the failures. A fully backed-up
/// repository also refreshes its bookmark snapshot on the server.
pub fn backup(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    revisions: Option<&[CommitId]>,
) -> Result<BackupOutcome> {
    let _lock = ctx.acquire_backup_lock()?;

    let heads = match revisions {
        Some(revisions) => revisions.to_vec(),
        None => repo.visible_heads()?,
    };
    let mut state = BackupState::open(ctx.repo_root, &ctx.config.remote_path)?;

    let mut need = Vec::new();
    for head in &heads {
        if !is_covered(repo, &state, head)? {
            need.push(head.clone());
        }
    }

    let mut outcome = BackupOutcome::default();
    if !need.is_empty() {
        info!(count = need.len(), "backing up heads");
        for (id, ok) in service.backup_commits(&need)? {
            if ok {
                outcome.backed_up.push(id);
            } else {
                outcome.failed.push(id);
            }
        }
        state.update(outcome.backed_up.iter().cloned())?;
    }

    if outcome.is_complete() && revisions.is_none() {
        // Only a full pass may refresh the snapshot; a named-revision backup
        // does not know the whole head set.
        push_backup_snapshot(ctx, repo, service, &state, &heads)?;
    } else if !outcome.is_complete() {
        warn!(
            failed = outcome.failed.len(),
            "backup incomplete, snapshot not refreshed"
        );
    }
    Ok(outcome)
}

/// A commit is covered when some confirmed-backed-up head descends from it.
fn is_covered(repo: &dyn VcsRepo, state: &BackupState, id: &CommitId) -> Result<bool> {
    if state.contains(id) {
        return Ok(true);
    }
    for backed_up in state.heads() {
        if repo.is_ancestor(id, backed_up)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn push_backup_snapshot(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    state: &BackupState,
    heads: &[CommitId],
) -> Result<()> {
    let mut bookmarks = BTreeMap::new();
    for (name, target) in repo.bookmarks()? {
        if is_covered(repo, state, &target)? {
            bookmarks.insert(name, target);
        }
    }
    let snapshot = BackupSnapshot {
        heads: heads.to_vec(),
        bookmarks,
    };
    backup::push_snapshot(
        service,
        ctx.repo_root,
        &ctx.config.remote_path,
        ctx.user,
        &snapshot,
    )?;
    Ok(())
}

/// Answer "is this commit backed up" per id.
///
/// The local answer is ancestry against the confirmed-backed-up set and
/// costs no network; `remote` asks the store itself and folds positive
/// answers back into the local cache.
pub fn is_backed_up(
    ctx: &OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    ids: &[CommitId],
    remote: bool,
) -> Result<Vec<(CommitId, bool)>> {
    if remote {
        let answers = service.is_backed_up(ids)?;
        let mut state = BackupState::open(ctx.repo_root, &ctx.config.remote_path)?;
        state.update(
            answers
                .iter()
                .filter(|(_, ok)| *ok)
                .map(|(id, _)| id.clone()),
        )?;
        return Ok(answers);
    }

    let state = BackupState::open(ctx.repo_root, &ctx.config.remote_path)?;
    let mut answers = Vec::with_capacity(ids.len());
    for id in ids {
        answers.push((id.clone(), is_covered(repo, &state, id)?));
    }
    Ok(answers)
}

/// Server-side commit graph of the joined workspace, for display.
pub fn smartlog(
    ctx: &OpContext<'_>,
    service: &dyn CloudService,
) -> Result<crate::service::SmartlogView> {
    let reponame = ctx.reponame()?;
    let workspace = require_workspace(ctx.repo_root)?;
    Ok(service.get_smartlog(&reponame, &workspace)?)
}

/// Enumerate this user's backup snapshots, optionally narrowed by hostname
/// and repo root.
pub fn list_backups(
    ctx: &OpContext<'_>,
    service: &dyn CloudService,
    hostname: Option<&str>,
    reporoot: Option<&str>,
) -> Result<BTreeMap<(String, String), BackupSnapshot>> {
    backup::download_snapshots(service, ctx.user, hostname, reporoot)
}

/// Restore one backup into this repository: pull its commits, recreate its
/// bookmarks, and mark everything as already backed up.
///
/// The filters must select exactly one snapshot. On success the context is
/// flagged to skip the next unattended backup, which would otherwise race
/// the pull.
pub fn restore_backup(
    ctx: &mut OpContext<'_>,
    repo: &dyn VcsRepo,
    service: &dyn CloudService,
    hostname: Option<&str>,
    reporoot: Option<&str>,
) -> Result<BackupSnapshot> {
    let snapshots = backup::download_snapshots(service, ctx.user, hostname, reporoot)?;
    let ((from_host, from_root), snapshot) = backup::select_restore_snapshot(snapshots)?;

    let _lock = ctx.acquire_backup_lock()?;
    info!(
        hostname = %from_host,
        reporoot = %from_root,
        heads = snapshot.heads.len(),
        "restoring backup"
    );

    // Heads first, then commits referenced only by bookmarks, so bookmark
    // recreation never points at an absent commit.
    let mut missing = Vec::new();
    for head in &snapshot.heads {
        if !repo.is_known(head)? {
            missing.push(head.clone());
        }
    }
    if !missing.is_empty() {
        repo.pull(&missing)?;
    }
    let mut bookmark_only = Vec::new();
    for target in snapshot.bookmarks.values() {
        if !snapshot.heads.contains(target)
            && !bookmark_only.contains(target)
            && !repo.is_known(target)?
        {
            bookmark_only.push(target.clone());
        }
    }
    if !bookmark_only.is_empty() {
        repo.pull(&bookmark_only)?;
    }

    let mut changes = Vec::new();
    for (name, target) in &snapshot.bookmarks {
        if repo.is_known(target)? {
            changes.push(BookmarkChange {
                name: name.clone(),
                target: Some(target.clone()),
            });
        } else {
            warn!(bookmark = %name, target = %target, "skipping bookmark with unresolvable target");
        }
    }
    if !changes.is_empty() {
        repo.apply_bookmark_changes(&changes)?;
    }

    let mut state = BackupState::open(ctx.repo_root, &ctx.config.remote_path)?;
    state.update(snapshot.heads.iter().cloned())?;
    backup::write_local_snapshot(ctx.repo_root, &ctx.config.remote_path, &snapshot)?;

    ctx.ignore_autobackup = true;
    Ok(snapshot)
}

/// Delete one backup snapshot from the server. Warns, but proceeds, when it
/// belongs to this machine and repository.
pub fn delete_backup(
    ctx: &OpContext<'_>,
    service: &dyn CloudService,
    hostname: &str,
    reporoot: &str,
) -> Result<()> {
    if hostname == backup_hostname() && Path::new(reporoot) == ctx.repo_root {
        warn!("deleting the backup of this repository on this machine");
    }
    backup::delete_snapshot(service, ctx.user, hostname, reporoot)
}

/// Turn unattended backups back on by clearing the disable window.
pub fn enable_autobackup(ctx: &OpContext<'_>) -> Result<()> {
    background::set_disabled_until(ctx.repo_root, None)?;
    info!("autobackup enabled");
    Ok(())
}

/// Suppress unattended backups for `duration` from now.
///
/// A backup already running keeps its lock and finishes; the window only
/// stops new ones from starting. The holder, if any, is named so the user
/// knows what is still in flight.
pub fn disable_autobackup(ctx: &OpContext<'_>, duration: Duration) -> Result<SystemTime> {
    let until = SystemTime::now() + duration;
    background::set_disabled_until(ctx.repo_root, Some(until))?;
    if let Some(meta) = crate::lock::read_holder(&paths::backup_lock_path(ctx.repo_root))? {
        warn!(
            holder = %meta.describe(),
            "a backup is still running and will finish"
        );
    }
    info!(?until, "autobackup disabled");
    Ok(until)
}
