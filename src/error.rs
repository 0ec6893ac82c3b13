use thiserror::Error;

use crate::backup::ValidationError;
use crate::background::BackgroundError;
use crate::config::ConfigError;
use crate::lock::LockError;
use crate::obsmarkers::QueueError;
use crate::repo::RepoError;
use crate::service::ServiceError;
use crate::state::StateError;
use crate::sync::SyncError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the component errors; components keep their own
/// error types at the seams.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Background(#[from] BackgroundError),
}

impl Error {
    /// Whether a later retry of the whole operation may succeed.
    ///
    /// Lock contention is retryable by a human (wait for the holder) but
    /// never retried automatically; it is classified `Unknown` so callers
    /// must decide. Configuration, validation, and auth failures are
    /// permanent until the user changes something.
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) | Error::Validation(_) => Transience::Permanent,
            Error::Service(err) if err.is_retryable() => Transience::Retryable,
            Error::Service(_) => Transience::Permanent,
            Error::Sync(err) => err.transience(),
            Error::Lock(_) => Transience::Unknown,
            Error::Queue(_) | Error::State(_) | Error::Repo(_) | Error::Background(_) => {
                Transience::Unknown
            }
        }
    }
}
