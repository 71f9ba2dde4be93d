//! Backend-independent asynchronous I/O contract.
//!
//! A backend turns queued operations into kernel readiness or completion
//! events. The epoll backend in this crate is the reference implementation;
//! io_uring and kqueue are the anticipated siblings behind the same
//! [`AsyncIo`] seam, which is why the runtime only ever talks to a
//! `Box<dyn AsyncIo>`.

use crate::error::RuntimeError;
use crate::task::TaskIndex;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// Exports
pub(crate) mod sys;

pub mod epoll;
pub use epoll::EpollBackend;

/// Tagged outcome of one queued operation.
///
/// Operation failures travel in-band as sentinels (`Fd(-1)`, `Socket(-1)`,
/// `Value(-1)`, `Value(0)` for a peer reset); the runtime never translates
/// them, user tasks inspect the payload themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpResult {
    /// No payload: first entry of a task, or a timer/close completion.
    #[default]
    None,

    /// Synthetic completion produced by [`Waker::wake`]. Never delivered to
    /// a task; it only unblocks a waiting reap.
    Wake,

    /// Byte count or operation status.
    Value(i64),

    /// File descriptor produced by an open.
    Fd(RawFd),

    /// Socket produced by an accept.
    Socket(RawFd),

    /// Metadata produced by a stat.
    Stat(FileStat),
}

/// Metadata snapshot of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub changed: SystemTime,
}

/// `(task, result)` pair harvested from a backend by [`AsyncIo::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub task: TaskIndex,
    pub result: OpResult,
}

/// Sizing knobs shared by every backend.
#[derive(Debug, Clone, Copy)]
pub struct AioConfig {
    /// Maximum number of in-flight jobs.
    pub max_jobs: usize,

    /// Upper bound on completions returned by a single reap.
    pub reap_batch: usize,
}

/// Cloneable cross-thread handle that unblocks a backend's `reap`.
///
/// This is the only operation that may be called from a thread other than
/// the one owning the runtime. The underlying eventfd stays alive for as
/// long as any handle does, so waking a runtime that already went away is
/// harmless.
#[derive(Debug, Clone)]
pub struct Waker {
    event_fd: Arc<OwnedFd>,
}

impl Waker {
    pub(crate) fn new(event_fd: Arc<OwnedFd>) -> Self {
        Self { event_fd }
    }

    /// Interrupt a blocked reap on the owning backend.
    pub fn wake(&self) -> io::Result<()> {
        sys::write_u64(self.event_fd.as_raw_fd(), 1).map_err(io::Error::from)
    }
}

/// Operation queue every OS backend implements.
///
/// Each `queue_*` call registers `task` as awaiting exactly one completion;
/// the runtime guarantees the task is already in the waiting state when it
/// invokes these from the suspension path. Queue calls fail with
/// [`RuntimeError::JobPoolFull`] at capacity, which is recoverable after a
/// reap.
pub trait AsyncIo {
    /// Arm a one-shot relative timer.
    fn queue_timer(&mut self, task: TaskIndex, delay: Duration) -> Result<(), RuntimeError>;

    /// Open `path` read-write. Completes with `Fd(fd)` or `Fd(-1)`.
    fn queue_open(&mut self, task: TaskIndex, path: &Path) -> Result<(), RuntimeError>;

    /// Stat an open descriptor. Completes with `Stat(..)` or `Value(-1)`.
    fn queue_stat(&mut self, task: TaskIndex, fd: RawFd) -> Result<(), RuntimeError>;

    /// Read at `offset` (falling back to a stream read for non-seekable
    /// descriptors). Completes with the byte count or `Value(-1)`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and untouched until the task is resumed.
    unsafe fn queue_read(
        &mut self,
        task: TaskIndex,
        fd: RawFd,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), RuntimeError>;

    /// Write at `offset`, mirroring [`AsyncIo::queue_read`].
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and untouched until the task is resumed.
    unsafe fn queue_write(
        &mut self,
        task: TaskIndex,
        fd: RawFd,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), RuntimeError>;

    /// Close a descriptor. Always completes with `None`.
    fn queue_close(&mut self, task: TaskIndex, fd: RawFd) -> Result<(), RuntimeError>;

    /// Accept one connection. Completes with `Socket(fd)` or `Socket(-1)`.
    fn queue_accept(&mut self, task: TaskIndex, socket: RawFd) -> Result<(), RuntimeError>;

    /// Drive a non-blocking connect to `addr`. Completes with `Value(1)` on
    /// success or `Value(-1)` on failure.
    fn queue_connect(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        addr: SocketAddr,
    ) -> Result<(), RuntimeError>;

    /// Receive once. Completes with the byte count, `Value(0)` on peer
    /// reset, or `Value(-1)`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and untouched until the task is resumed.
    unsafe fn queue_recv(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        buf: &mut [u8],
    ) -> Result<(), RuntimeError>;

    /// Send once, mirroring [`AsyncIo::queue_recv`].
    ///
    /// # Safety
    ///
    /// `buf` must stay valid and untouched until the task is resumed.
    unsafe fn queue_send(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        buf: &[u8],
    ) -> Result<(), RuntimeError>;

    /// Cross-thread wake handle for this backend.
    fn waker(&self) -> Waker;

    /// Hand pending work to the kernel. A no-op for readiness-based
    /// backends, meaningful for submission-based ones.
    fn submit(&mut self) -> Result<(), RuntimeError>;

    /// Harvest ready completions into `completions`, never pushing past its
    /// capacity.
    ///
    /// With `wait` unset this is a single non-blocking pass that may come
    /// back empty. With `wait` set it blocks until at least one completion
    /// is available — unless fallback-blocking work is outstanding, in which
    /// case the backend polls instead of blocking so that work keeps
    /// progressing.
    fn reap(&mut self, completions: &mut Vec<Completion>, wait: bool) -> Result<(), RuntimeError>;

    /// Number of outstanding jobs, excluding permanent internal ones. The
    /// runtime uses this to tell quiescence apart from waiting on I/O.
    fn pending(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // Wake handles cross threads; everything else stays on the owning one.
    assert_impl_all!(Waker: Send, Sync, Clone);
    assert_impl_all!(Completion: Copy);

    #[test]
    fn test_opresult_default_is_none() {
        assert_eq!(OpResult::default(), OpResult::None);
    }
}
