//! Two-stage obsmarker transfer queue.
//!
//! Transactions that rewrite history must record obsmarkers without ever
//! blocking on a sync in progress, and sync must be able to clear uploaded
//! markers without racing those transactions. The queue therefore has two
//! stages:
//!
//! - *pending*: appended to by transaction completion hooks, under a short
//!   lock of its own;
//! - *syncing*: at the start of a sync, pending records move here; the file
//!   is read and cleared only under the backup lock, after upload succeeds.
//!
//! A crash between "append to syncing" and "delete pending" re-delivers the
//! same records on the next drain. That is deliberate: duplicates are
//! tolerated by content, loss is not. [`read_syncing`] dedupes before
//! returning.
//!
//! Each log file is a one-line JSON format header followed by one JSON record
//! per line. A missing or unreadable pending file reads as zero records.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::lock::{FileLock, LockError};
use crate::paths;
use crate::refs::Obsmarker;

/// How long a transaction hook will wait for the pending-log lock before
/// giving up. Appends are tiny, so contention beyond this means something is
/// wedged.
pub const QUEUE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const LOG_FORMAT: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LogHeader {
    format: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("obsmarker log lock: {0}")]
    Lock(#[from] LockError),
    #[error("unsupported obsmarker log format {found} (expected {LOG_FORMAT})")]
    UnsupportedFormat { found: u32 },
    #[error("failed to encode obsmarker: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Append markers to the pending log.
///
/// Safe to call from a transaction completion hook: takes only the short
/// queue lock, never the backup lock. Creates the log with a format header
/// when it does not exist yet.
pub fn append_pending(repo_root: &Path, markers: &[Obsmarker]) -> Result<(), QueueError> {
    if markers.is_empty() {
        return Ok(());
    }
    let _lock = FileLock::acquire(&paths::obsmarkers_lock_path(repo_root), QUEUE_LOCK_TIMEOUT)?;
    append_records(&paths::pending_obsmarkers_path(repo_root), markers)
}

/// Move all pending markers to the syncing log.
///
/// The caller must hold the backup lock; the `_backup_lock` witness enforces
/// that. The pending log is read and deleted under the queue lock, so
/// concurrent `append_pending` calls are never torn. If this crashes after
/// appending to syncing but before deleting pending, the next drain re-appends
/// the same records; readers dedupe.
pub fn drain_to_syncing(repo_root: &Path, _backup_lock: &FileLock) -> Result<(), QueueError> {
    let _lock = FileLock::acquire(&paths::obsmarkers_lock_path(repo_root), QUEUE_LOCK_TIMEOUT)?;

    let pending_path = paths::pending_obsmarkers_path(repo_root);
    let markers = read_log_tolerant(&pending_path);
    if !markers.is_empty() {
        append_records(&paths::syncing_obsmarkers_path(repo_root), &markers)?;
    }
    match fs::remove_file(&pending_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(QueueError::Io(err)),
    }
    Ok(())
}

/// All markers currently staged for upload, deduplicated by content in
/// first-seen order.
pub fn read_syncing(repo_root: &Path, _backup_lock: &FileLock) -> Result<Vec<Obsmarker>, QueueError> {
    let mut markers = read_log_tolerant(&paths::syncing_obsmarkers_path(repo_root));
    let mut seen = std::collections::HashSet::new();
    markers.retain(|m| seen.insert(m.clone()));
    Ok(markers)
}

/// Delete the syncing log. Call only after the remote upload of exactly those
/// records has been confirmed.
pub fn clear_syncing(repo_root: &Path, _backup_lock: &FileLock) -> Result<(), QueueError> {
    match fs::remove_file(paths::syncing_obsmarkers_path(repo_root)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(QueueError::Io(err)),
    }
}

fn append_records(path: &Path, markers: &[Obsmarker]) -> Result<(), QueueError> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = Vec::new();
    if file.metadata()?.len() == 0 {
        serde_json::to_writer(&mut buf, &LogHeader { format: LOG_FORMAT })
            .map_err(QueueError::Encode)?;
        buf.push(b'\n');
    }
    for marker in markers {
        serde_json::to_writer(&mut buf, marker).map_err(QueueError::Encode)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

/// Read a log, treating a missing file as empty and skipping lines that do
/// not decode. Losing a marker is a correctness bug; refusing to sync over a
/// torn trailing line is not, so unreadable lines only warn.
fn read_log_tolerant(path: &Path) -> Vec<Obsmarker> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable obsmarker log, treating as empty");
            return Vec::new();
        }
    };

    let mut markers = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        // Header lines may repeat when an interrupted drain appended a
        // fresh header mid-file.
        if let Ok(header) = serde_json::from_str::<LogHeader>(line) {
            if header.format != LOG_FORMAT {
                warn!(
                    path = %path.display(),
                    found = header.format,
                    "unknown obsmarker log format, skipping header"
                );
            }
            continue;
        }
        match serde_json::from_str::<Obsmarker>(line) {
            Ok(marker) => markers.push(marker),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %err,
                    "skipping undecodable obsmarker record"
                );
            }
        }
    }
    markers
}
