use crate::aio::{AioConfig, Completion, EpollBackend};
use nix::errno::Errno;
use std::os::fd::{FromRawFd, OwnedFd};

pub(crate) fn backend(max_jobs: usize, reap_batch: usize) -> EpollBackend {
    EpollBackend::try_new(&AioConfig {
        max_jobs,
        reap_batch,
    })
    .expect("failed to create epoll backend")
}

/// Caller-owned completion buffer sized like the runtime sizes its own.
pub(crate) fn completion_buf(reap_batch: usize) -> Vec<Completion> {
    Vec::with_capacity(reap_batch)
}

/// Non-blocking IPv4 TCP socket, unconnected.
pub(crate) fn tcp_socket() -> OwnedFd {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    let fd = Errno::result(fd).expect("socket failed");

    // Safety: a successful socket(2) hands us sole ownership of the fd.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Non-blocking pipe pair `(read, write)`.
pub(crate) fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    Errno::result(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
        .expect("pipe2 failed");

    // Safety: a successful pipe2(2) hands us sole ownership of both ends.
    (unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
        OwnedFd::from_raw_fd(fds[1])
    })
}
