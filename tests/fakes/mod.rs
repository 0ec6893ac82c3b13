//! In-memory collaborators for protocol tests: a cloud service with real
//! compare-and-swap semantics and a repository with a real (if tiny) DAG.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cloudsync::backup::BackupSnapshot;
use cloudsync::refs::{CloudReferences, CommitId, Obsmarker, RepoName, WorkspaceName};
use cloudsync::repo::{BookmarkChange, RepoError, VcsRepo};
use cloudsync::service::{CloudService, ServiceError, SmartlogView, UpdateOutcome};

/// Route library events through the test writer so a failing scenario
/// prints what the engine did next to its assertion output. `RUST_LOG`
/// overrides the default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cloudsync=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn id(s: &str) -> CommitId {
    CommitId::parse(s).unwrap()
}

pub fn marker(pred: &str, succ: &str) -> Obsmarker {
    Obsmarker {
        predecessor: id(pred),
        successors: vec![id(succ)],
        operation: Some("amend".into()),
        user: Some("alice".into()),
        time_ms: 1_700_000_000_000,
    }
}

type PreUpdateHook = Box<dyn FnOnce(&mut CloudReferences) + Send>;

/// Service fake with the same linearization rule as the real one: a write is
/// accepted only when the expected version matches, and the version then
/// moves forward by one.
#[derive(Default)]
pub struct InMemoryService {
    refs: Mutex<CloudReferences>,
    backed_up: Mutex<BTreeSet<CommitId>>,
    /// Commit uploads that should fail, to exercise partial backup.
    fail_uploads: Mutex<BTreeSet<CommitId>>,
    snapshots: Mutex<BTreeMap<(String, String), BackupSnapshot>>,
    /// Run before each update's version check, to interleave a concurrent
    /// writer at exactly the racy moment.
    pre_update_hooks: Mutex<Vec<PreUpdateHook>>,
    pub fetches: AtomicU64,
    pub updates: AtomicU64,
    pub upload_calls: AtomicU64,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn references(&self) -> CloudReferences {
        self.refs.lock().unwrap().clone()
    }

    /// Seed the server state directly, bypassing the version check.
    pub fn set_references(&self, refs: CloudReferences) {
        *self.refs.lock().unwrap() = refs;
    }

    /// Apply a write as if another machine pushed it right now.
    pub fn write_as_other_machine(
        &self,
        heads: Vec<CommitId>,
        bookmarks: BTreeMap<String, CommitId>,
    ) {
        let mut refs = self.refs.lock().unwrap();
        refs.version += 1;
        refs.heads = heads;
        refs.bookmarks = bookmarks;
    }

    /// Interleave `hook` before the version check of the next update.
    pub fn on_next_update(&self, hook: impl FnOnce(&mut CloudReferences) + Send + 'static) {
        self.pre_update_hooks.lock().unwrap().push(Box::new(hook));
    }

    pub fn fail_upload_of(&self, commit: &CommitId) {
        self.fail_uploads.lock().unwrap().insert(commit.clone());
    }

    pub fn allow_upload_of(&self, commit: &CommitId) {
        self.fail_uploads.lock().unwrap().remove(commit);
    }

    pub fn backed_up_commits(&self) -> BTreeSet<CommitId> {
        self.backed_up.lock().unwrap().clone()
    }

    pub fn put_snapshot_raw(&self, hostname: &str, reporoot: &str, snapshot: BackupSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert((hostname.to_string(), reporoot.to_string()), snapshot);
    }
}

impl CloudService for InMemoryService {
    fn get_references(
        &self,
        _reponame: &RepoName,
        _workspace: &WorkspaceName,
        _min_version: u64,
    ) -> Result<CloudReferences, ServiceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.refs.lock().unwrap().clone())
    }

    fn update_references(
        &self,
        _reponame: &RepoName,
        _workspace: &WorkspaceName,
        expected_version: u64,
        heads: Vec<CommitId>,
        bookmarks: BTreeMap<String, CommitId>,
        obsmarkers: Vec<Obsmarker>,
    ) -> Result<UpdateOutcome, ServiceError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut refs = self.refs.lock().unwrap();
        if let Some(hook) = self.pre_update_hooks.lock().unwrap().pop() {
            hook(&mut refs);
        }
        if refs.version != expected_version {
            return Ok(UpdateOutcome::Rejected {
                current: Some(refs.clone()),
            });
        }
        refs.version += 1;
        refs.heads = heads;
        refs.bookmarks = bookmarks;
        refs.obsmarkers.extend(obsmarkers);
        Ok(UpdateOutcome::Accepted {
            version: refs.version,
        })
    }

    fn get_smartlog(
        &self,
        _reponame: &RepoName,
        _workspace: &WorkspaceName,
    ) -> Result<SmartlogView, ServiceError> {
        let refs = self.refs.lock().unwrap();
        Ok(SmartlogView {
            commits: refs.heads.iter().map(|h| (h.clone(), Vec::new())).collect(),
            bookmarks: refs.bookmarks.clone(),
        })
    }

    fn check_auth(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn backup_commits(&self, ids: &[CommitId]) -> Result<Vec<(CommitId, bool)>, ServiceError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_uploads.lock().unwrap();
        let mut backed_up = self.backed_up.lock().unwrap();
        let mut results = Vec::new();
        for id in ids {
            if fail.contains(id) {
                results.push((id.clone(), false));
            } else {
                backed_up.insert(id.clone());
                results.push((id.clone(), true));
            }
        }
        Ok(results)
    }

    fn is_backed_up(&self, ids: &[CommitId]) -> Result<Vec<(CommitId, bool)>, ServiceError> {
        let backed_up = self.backed_up.lock().unwrap();
        Ok(ids
            .iter()
            .map(|id| (id.clone(), backed_up.contains(id)))
            .collect())
    }

    fn put_backup_snapshot(
        &self,
        _user: &str,
        hostname: &str,
        reporoot: &str,
        snapshot: &BackupSnapshot,
    ) -> Result<(), ServiceError> {
        self.put_snapshot_raw(hostname, reporoot, snapshot.clone());
        Ok(())
    }

    fn get_backup_snapshots(
        &self,
        _user: &str,
        hostname: Option<&str>,
        reporoot: Option<&str>,
    ) -> Result<BTreeMap<(String, String), BackupSnapshot>, ServiceError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|((host, root), _)| {
                hostname.is_none_or(|h| h == host) && reporoot.is_none_or(|r| r == root)
            })
            .map(|(key, snap)| (key.clone(), snap.clone()))
            .collect())
    }

    fn delete_backup_snapshot(
        &self,
        _user: &str,
        hostname: &str,
        reporoot: &str,
    ) -> Result<(), ServiceError> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(&(hostname.to_string(), reporoot.to_string()));
        Ok(())
    }
}

#[derive(Clone)]
struct FakeCommit {
    parents: Vec<CommitId>,
    hidden: bool,
}

struct RepoInner {
    commits: BTreeMap<CommitId, FakeCommit>,
    bookmarks: BTreeMap<String, CommitId>,
    wc_parent: CommitId,
}

/// Repository fake backed by an explicit DAG. Commits can live only on the
/// "remote" side until pulled, which is how pulls are observable.
pub struct FakeRepo {
    inner: Mutex<RepoInner>,
    /// Commits fetchable by `pull`, with their parents and visibility.
    remote: Mutex<BTreeMap<CommitId, FakeCommit>>,
}

impl FakeRepo {
    /// A repository containing a single visible root commit, which is also
    /// the working copy parent.
    pub fn with_root(root: &str) -> Self {
        let root = id(root);
        let mut commits = BTreeMap::new();
        commits.insert(
            root.clone(),
            FakeCommit {
                parents: Vec::new(),
                hidden: false,
            },
        );
        Self {
            inner: Mutex::new(RepoInner {
                commits,
                bookmarks: BTreeMap::new(),
                wc_parent: root,
            }),
            remote: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_commit(&self, commit: &str, parents: &[&str]) {
        self.inner.lock().unwrap().commits.insert(
            id(commit),
            FakeCommit {
                parents: parents.iter().map(|p| id(p)).collect(),
                hidden: false,
            },
        );
    }

    /// Make a commit available on the pull remote without adding it locally.
    pub fn add_remote_commit(&self, commit: &str, parents: &[&str]) {
        self.remote.lock().unwrap().insert(
            id(commit),
            FakeCommit {
                parents: parents.iter().map(|p| id(p)).collect(),
                hidden: false,
            },
        );
    }

    pub fn hide(&self, commit: &str) {
        if let Some(c) = self.inner.lock().unwrap().commits.get_mut(&id(commit)) {
            c.hidden = true;
        }
    }

    pub fn set_bookmark(&self, name: &str, target: &str) {
        self.inner
            .lock()
            .unwrap()
            .bookmarks
            .insert(name.to_string(), id(target));
    }

    pub fn set_working_copy(&self, commit: &str) {
        self.inner.lock().unwrap().wc_parent = id(commit);
    }

    pub fn has_commit(&self, commit: &str) -> bool {
        self.inner.lock().unwrap().commits.contains_key(&id(commit))
    }

    fn ancestors_of(commits: &BTreeMap<CommitId, FakeCommit>, from: &CommitId) -> BTreeSet<CommitId> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![from.clone()];
        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = commits.get(&current) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }
}

impl VcsRepo for FakeRepo {
    fn visible_heads(&self) -> Result<Vec<CommitId>, RepoError> {
        let inner = self.inner.lock().unwrap();
        let mut non_heads = BTreeSet::new();
        for commit in inner.commits.values() {
            if commit.hidden {
                continue;
            }
            for parent in &commit.parents {
                non_heads.insert(parent.clone());
            }
        }
        Ok(inner
            .commits
            .iter()
            .filter(|(id, c)| !c.hidden && !non_heads.contains(*id))
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn bookmarks(&self) -> Result<BTreeMap<String, CommitId>, RepoError> {
        Ok(self.inner.lock().unwrap().bookmarks.clone())
    }

    fn apply_bookmark_changes(&self, changes: &[BookmarkChange]) -> Result<(), RepoError> {
        let mut inner = self.inner.lock().unwrap();
        for change in changes {
            match &change.target {
                Some(target) => {
                    inner.bookmarks.insert(change.name.clone(), target.clone());
                }
                None => {
                    inner.bookmarks.remove(&change.name);
                }
            }
        }
        Ok(())
    }

    fn pull(&self, ids: &[CommitId]) -> Result<(), RepoError> {
        let remote = self.remote.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        for wanted in ids {
            if !remote.contains_key(wanted) {
                return Err(RepoError::new(format!("{wanted} not found on remote")));
            }
            for ancestor in Self::ancestors_of(&remote, wanted) {
                if let Some(commit) = remote.get(&ancestor) {
                    inner.commits.entry(ancestor).or_insert_with(|| commit.clone());
                }
            }
        }
        Ok(())
    }

    fn is_known(&self, id: &CommitId) -> Result<bool, RepoError> {
        Ok(self.inner.lock().unwrap().commits.contains_key(id))
    }

    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool, RepoError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::ancestors_of(&inner.commits, descendant).contains(ancestor))
    }

    fn working_copy_parent(&self) -> Result<CommitId, RepoError> {
        Ok(self.inner.lock().unwrap().wc_parent.clone())
    }

    fn update_working_copy(&self, target: &CommitId) -> Result<(), RepoError> {
        self.inner.lock().unwrap().wc_parent = target.clone();
        Ok(())
    }

    fn is_visible(&self, id: &CommitId) -> Result<bool, RepoError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .commits
            .get(id)
            .is_some_and(|c| !c.hidden))
    }

    fn nearest_visible_descendant(&self, from: &CommitId) -> Result<Option<CommitId>, RepoError> {
        let inner = self.inner.lock().unwrap();
        // Breadth-first over children, nearest first.
        let mut frontier = vec![from.clone()];
        let mut seen = BTreeSet::new();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in frontier.drain(..) {
                if !seen.insert(node.clone()) {
                    continue;
                }
                if node != *from
                    && inner.commits.get(&node).is_some_and(|c| !c.hidden)
                {
                    return Ok(Some(node));
                }
                for (child_id, child) in &inner.commits {
                    if child.parents.contains(&node) {
                        next.push(child_id.clone());
                    }
                }
            }
            frontier = next;
        }
        Ok(None)
    }
}
