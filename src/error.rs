use std::io;

/// A centralized error type for scheduler, runtime and backend operations.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// The task pool is at capacity. This is a specific, recoverable state:
    /// let a tick run so finished tasks release their slots, then spawn again.
    #[error("task pool is full, cannot spawn")]
    TaskPoolFull,

    /// The backend job pool is at capacity. Recoverable: reap completions
    /// before queueing more I/O.
    #[error("job pool is full, cannot queue I/O")]
    JobPoolFull,

    /// An I/O error escaped the backend itself (registration failures and the
    /// like). Per-operation failures travel inside `OpResult` sentinels
    /// instead and never surface here.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<nix::errno::Errno> for RuntimeError {
    fn from(errno: nix::errno::Errno) -> Self {
        RuntimeError::Io(errno.into())
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::TaskPoolFull, Self::TaskPoolFull) => true,
            (Self::JobPoolFull, Self::JobPoolFull) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
