//! Joined-workspace markers for the local notification daemon.
//!
//! A separate daemon process watches a directory of marker files, one per
//! (repo root, repo name, workspace) triple, and holds a server subscription
//! for each. This module only manages the marker files and pokes the daemon
//! over loopback TCP to rescan; it never talks to the service itself.
//!
//! Subscription upkeep is best effort. A missed poke or an unreachable
//! daemon degrades to polling, so join never fails the operation that
//! triggered it.

use std::fs;
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SubscriptionConfig;
use crate::paths;
use crate::refs::{RepoName, WorkspaceName};

const POKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Contents of one marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub repo_root: PathBuf,
    pub repo_name: String,
    pub workspace: String,
}

impl Subscription {
    pub fn new(repo_root: &Path, reponame: &RepoName, workspace: &WorkspaceName) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            repo_name: reponame.as_str().to_string(),
            workspace: workspace.as_str().to_string(),
        }
    }
}

pub struct SubscriptionManager {
    config: SubscriptionConfig,
    joined_dir: PathBuf,
}

impl SubscriptionManager {
    pub fn new(config: &SubscriptionConfig) -> Self {
        let joined_dir = match &config.joined_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
                paths::joined_dir(&home)
            }
        };
        Self {
            config: config.clone(),
            joined_dir,
        }
    }

    fn marker_path(&self, sub: &Subscription) -> PathBuf {
        let root = sub.repo_root.to_string_lossy();
        let key = paths::short_hash(&[&root, &sub.repo_name, &sub.workspace]);
        self.joined_dir.join(key)
    }

    /// Record a joined workspace and wake the daemon. Failures are logged
    /// and swallowed; join must never block or fail the calling operation.
    /// With subscriptions disabled any stale marker is removed instead.
    pub fn join(&self, sub: &Subscription) {
        if !self.config.enabled {
            self.remove_marker(sub);
            return;
        }
        if let Err(err) = self.write_marker(sub) {
            warn!(
                workspace = %sub.workspace,
                error = %err,
                "could not record workspace subscription"
            );
            return;
        }
        self.poke_daemon();
    }

    /// Remove the marker for a workspace this repository left. Quiet: a
    /// missing marker or daemon is the desired end state anyway.
    pub fn leave(&self, sub: &Subscription) {
        self.remove_marker(sub);
        self.poke_daemon();
    }

    /// Whether a marker currently exists for this subscription. Also probes
    /// the daemon and warns when it is down, since a marker without a daemon
    /// means the workspace is silently falling back to polling.
    pub fn check(&self, sub: &Subscription) -> bool {
        let joined = self.marker_path(sub).exists();
        if joined && !self.daemon_reachable() {
            warn!(
                port = self.config.daemon_port,
                "subscribed but the notification daemon is not running"
            );
        }
        joined
    }

    fn daemon_reachable(&self) -> bool {
        TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, self.config.daemon_port)).is_ok()
    }

    fn write_marker(&self, sub: &Subscription) -> io::Result<()> {
        fs::create_dir_all(&self.joined_dir)?;
        let contents = toml::to_string(sub)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let path = self.marker_path(sub);
        fs::write(&path, contents)?;
        debug!(path = %path.display(), "wrote subscription marker");
        Ok(())
    }

    fn remove_marker(&self, sub: &Subscription) {
        let path = self.marker_path(sub);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed subscription marker"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not remove subscription marker");
            }
        }
    }

    /// Ask the daemon to rescan the joined directory. One short-lived
    /// loopback connection carrying a one-line JSON command; no reply is
    /// awaited. An unreachable daemon just means it will pick the change up
    /// on its next start.
    fn poke_daemon(&self) {
        let port = self.config.daemon_port;
        let addr = (std::net::Ipv4Addr::LOCALHOST, port);
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(port, error = %err, "notification daemon not reachable");
                return;
            }
        };
        let _ = stream.set_write_timeout(Some(POKE_TIMEOUT));
        let command = serde_json::json!(["restart_subscriptions", {}]);
        let mut stream = stream;
        if let Err(err) = writeln!(stream, "{command}") {
            debug!(port, error = %err, "failed to poke notification daemon");
        }
    }
}
