//! epoll-backed implementation of the [`AsyncIo`] contract.
//!
//! Readiness-driven operations (timer, accept, connect, recv, send) register
//! their descriptor with epoll, level-triggered, with the job's pool index as
//! user-data. Operations the kernel only exposes as blocking (open, stat,
//! read, write, close) go on a fallback list instead and are drained against
//! non-blocking descriptors on every reap pass.

use crate::aio::{AioConfig, AsyncIo, Completion, OpResult, Waker, sys};
use crate::error::RuntimeError;
use crate::pool::Pool;
use crate::task::TaskIndex;
use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, SockFlag, SockaddrStorage, accept4, connect, recv, send};
use std::collections::VecDeque;
use std::ffi::CString;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Slot permanently holding the wake job. Installed at init, never released,
/// and doubles as the epoll user-data of the wake eventfd.
const WAKE_JOB: usize = 0;

const OPEN_FLAGS: libc::c_int = libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC;

/// Read-side readiness: timer, accept, recv.
const INTEREST_IN: u32 = libc::EPOLLIN as u32;

/// Write-side readiness: connect, send.
const INTEREST_OUT: u32 = libc::EPOLLOUT as u32;

/// Borrowed read buffer captured as a raw pointer. The queueing caller
/// guarantees it outlives the operation.
#[derive(Debug)]
struct RawBufMut {
    ptr: *mut u8,
    len: usize,
}

impl RawBufMut {
    fn capture(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// # Safety
    ///
    /// Only valid while the captured buffer is alive and unaliased, i.e.
    /// between queueing and the owning task's resumption.
    unsafe fn as_slice_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

/// Borrowed write buffer; same contract as [`RawBufMut`].
#[derive(Debug)]
struct RawBuf {
    ptr: *const u8,
    len: usize,
}

impl RawBuf {
    fn capture(buf: &[u8]) -> Self {
        Self {
            ptr: buf.as_ptr(),
            len: buf.len(),
        }
    }

    /// # Safety
    ///
    /// Same validity window as [`RawBufMut::as_slice_mut`].
    unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Backend-side record of one in-flight operation.
#[derive(Debug)]
struct Job {
    /// Task that will receive this job's completion.
    task: TaskIndex,
    kind: JobKind,
}

#[derive(Debug)]
enum JobKind {
    Wake,
    Timer(OwnedFd),
    Open(CString),
    Stat(RawFd),
    Read {
        fd: RawFd,
        buf: RawBufMut,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: RawBuf,
        offset: u64,
    },
    Close(RawFd),
    Accept(RawFd),
    Connect {
        socket: RawFd,
        addr: SockaddrStorage,
    },
    Recv {
        socket: RawFd,
        buf: RawBufMut,
    },
    Send {
        socket: RawFd,
        buf: RawBuf,
    },
}

pub struct EpollBackend {
    epoll: OwnedFd,

    /// Shared with every `Waker` handle; registered level-triggered EPOLLIN
    /// under `WAKE_JOB`.
    wake_fd: Arc<OwnedFd>,

    /// Staging buffer for `epoll_wait`; its length is the reap batch bound.
    events: Vec<libc::epoll_event>,

    /// One extra slot on top of `max_jobs` reserves `WAKE_JOB`.
    jobs: Pool<Job>,

    /// Jobs whose operation has no native epoll form. Retried against
    /// non-blocking descriptors once per reap pass.
    blocking: VecDeque<usize>,
}

impl EpollBackend {
    pub fn try_new(cfg: &AioConfig) -> Result<Self, RuntimeError> {
        let epoll = sys::epoll_create()?;
        let wake_fd = Arc::new(sys::eventfd()?);

        let mut jobs = Pool::with_capacity(cfg.max_jobs + 1);
        jobs.insert_at(
            WAKE_JOB,
            Job {
                task: WAKE_JOB,
                kind: JobKind::Wake,
            },
        );

        let mut event = libc::epoll_event {
            events: INTEREST_IN,
            u64: WAKE_JOB as u64,
        };
        sys::epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            wake_fd.as_raw_fd(),
            Some(&mut event),
        )?;

        Ok(Self {
            epoll,
            wake_fd,
            events: vec![
                libc::epoll_event { events: 0, u64: 0 };
                cfg.reap_batch
            ],
            jobs,
            blocking: VecDeque::new(),
        })
    }

    /// Borrow a job slot, hinted by the owning task index so repeat
    /// suspensions of the same task tend to reuse the same slot.
    fn add_job(&mut self, task: TaskIndex, kind: JobKind) -> Result<usize, RuntimeError> {
        self.jobs
            .insert_hint(task, Job { task, kind })
            .map_err(|_| RuntimeError::JobPoolFull)
    }

    fn queue_blocking(&mut self, task: TaskIndex, kind: JobKind) -> Result<(), RuntimeError> {
        let index = self.add_job(task, kind)?;
        self.blocking.push_back(index);
        Ok(())
    }

    fn queue_readiness(
        &mut self,
        task: TaskIndex,
        fd: RawFd,
        interest: u32,
        kind: JobKind,
    ) -> Result<(), RuntimeError> {
        let index = self.add_job(task, kind)?;
        if let Err(e) = self.register(fd, index, interest) {
            self.jobs.release(index);
            return Err(e);
        }
        Ok(())
    }

    fn register(&self, fd: RawFd, index: usize, interest: u32) -> Result<(), RuntimeError> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: index as u64,
        };

        // Level-triggered registrations persist across operations, so a
        // socket switching between read and write interest must update its
        // set rather than duplicate-add.
        match sys::epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            Some(&mut event),
        ) {
            Err(Errno::EEXIST) => {
                trace!(fd, "interest already present, modifying");
                sys::epoll_ctl(
                    self.epoll.as_raw_fd(),
                    libc::EPOLL_CTL_MOD,
                    fd,
                    Some(&mut event),
                )
                .map_err(RuntimeError::from)
            }
            other => other.map_err(RuntimeError::from),
        }
    }

    fn unregister(epoll: &OwnedFd, fd: RawFd) {
        // The owner may already have closed the descriptor behind our back;
        // a failed delete leaves nothing to clean up either way.
        let _ = sys::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, None);
    }

    /// One retry pass over the fallback list. Capacity is peeked before each
    /// pop so a saturated completion buffer never silently discards a job.
    fn drain_blocking(&mut self, completions: &mut Vec<Completion>, budget: usize) {
        for _ in 0..self.blocking.len() {
            if completions.len() == budget {
                break;
            }

            let index = self
                .blocking
                .pop_front()
                .expect("fallback list shrank mid-pass");
            match self.try_blocking(index) {
                // Still would block: back of the queue, next pass retries.
                None => self.blocking.push_back(index),
                Some(result) => {
                    let job = self.jobs.release(index);
                    completions.push(Completion {
                        task: job.task,
                        result,
                    });
                }
            }
        }
    }

    /// Attempt one fallback operation. `None` means it would still block.
    fn try_blocking(&mut self, index: usize) -> Option<OpResult> {
        let job = self.jobs.get(index);
        match &job.kind {
            JobKind::Open(path) => match sys::open(path, OPEN_FLAGS) {
                Err(Errno::EAGAIN) => None,
                Err(_) => Some(OpResult::Fd(-1)),
                Ok(fd) => Some(OpResult::Fd(fd)),
            },
            JobKind::Stat(fd) => Some(match sys::fstat(*fd) {
                Ok(stat) => OpResult::Stat(stat.into()),
                Err(_) => OpResult::Value(-1),
            }),
            JobKind::Read { fd, buf, offset } => {
                // Safety: the queueing caller keeps the buffer alive until
                // the owning task resumes.
                let slice = unsafe { buf.as_slice_mut() };
                let res = match sys::pread(*fd, slice, *offset) {
                    // Not seekable: fall back to a stream read.
                    Err(Errno::ESPIPE) => sys::read(*fd, slice),
                    other => other,
                };
                match res {
                    Err(Errno::EAGAIN) => None,
                    Err(_) => Some(OpResult::Value(-1)),
                    Ok(n) => Some(OpResult::Value(n as i64)),
                }
            }
            JobKind::Write { fd, buf, offset } => {
                // Safety: same contract as the read arm.
                let slice = unsafe { buf.as_slice() };
                let res = match sys::pwrite(*fd, slice, *offset) {
                    Err(Errno::ESPIPE) => sys::write(*fd, slice),
                    other => other,
                };
                match res {
                    Err(Errno::EAGAIN) => None,
                    Err(_) => Some(OpResult::Value(-1)),
                    Ok(n) => Some(OpResult::Value(n as i64)),
                }
            }
            JobKind::Close(fd) => {
                let _ = sys::close(*fd);
                Some(OpResult::None)
            }
            kind => unreachable!("job {index} ({kind:?}) is not a fallback operation"),
        }
    }

    fn handle_event(
        &mut self,
        flags: u32,
        data: u64,
        completions: &mut Vec<Completion>,
    ) -> Result<(), RuntimeError> {
        let index = data as usize;

        // `None` keeps the job alive: either it is the permanent wake job or
        // the operation would still block and the level-triggered
        // registration will fire again.
        let mut result = None;

        {
            let job = self.jobs.get_mut(index);
            let task = job.task;

            match &mut job.kind {
                JobKind::Wake => {
                    // Drain the counter so the level-triggered eventfd goes
                    // quiet; the job itself is permanent.
                    let _ = sys::read_u64(self.wake_fd.as_raw_fd());
                    completions.push(Completion {
                        task,
                        result: OpResult::Wake,
                    });
                }
                JobKind::Timer(timer) => {
                    let fd = timer.as_raw_fd();
                    let _ = sys::read_u64(fd);
                    Self::unregister(&self.epoll, fd);
                    result = Some(OpResult::None);
                }
                JobKind::Accept(socket) => {
                    match accept4(*socket, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                        // Another reader may have raced us on the
                        // level-triggered registration; wait for the next
                        // connection.
                        Err(Errno::EAGAIN) => {}
                        Err(_) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Socket(-1));
                        }
                        Ok(fd) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Socket(fd));
                        }
                    }
                }
                JobKind::Connect { socket, addr } => {
                    debug_assert!(
                        flags & (INTEREST_OUT | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
                        "connect job woken without write-side readiness"
                    );
                    match connect(*socket, &*addr) {
                        Ok(()) | Err(Errno::EISCONN) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(1));
                        }
                        // Still connecting; the next EPOLLOUT settles it.
                        Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) | Err(Errno::EAGAIN) => {}
                        Err(_) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(-1));
                        }
                    }
                }
                JobKind::Recv { socket, buf } => {
                    // Safety: buffer validity is the queueing caller's
                    // contract.
                    let slice = unsafe { buf.as_slice_mut() };
                    match recv(*socket, slice, MsgFlags::empty()) {
                        Err(Errno::EAGAIN) => {}
                        Err(Errno::ECONNRESET) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(0));
                        }
                        Err(_) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(-1));
                        }
                        Ok(n) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(n as i64));
                        }
                    }
                }
                JobKind::Send { socket, buf } => {
                    // Safety: buffer validity is the queueing caller's
                    // contract.
                    let slice = unsafe { buf.as_slice() };
                    match send(*socket, slice, MsgFlags::empty()) {
                        Err(Errno::EAGAIN) => {}
                        Err(Errno::ECONNRESET) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(0));
                        }
                        Err(_) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(-1));
                        }
                        Ok(n) => {
                            Self::unregister(&self.epoll, *socket);
                            result = Some(OpResult::Value(n as i64));
                        }
                    }
                }
                kind => unreachable!("job {index} ({kind:?}) has no epoll registration"),
            }
        }

        if let Some(result) = result {
            let job = self.jobs.release(index);
            completions.push(Completion {
                task: job.task,
                result,
            });
        }
        Ok(())
    }
}

impl AsyncIo for EpollBackend {
    fn queue_timer(&mut self, task: TaskIndex, delay: Duration) -> Result<(), RuntimeError> {
        // A zero expiration would disarm the timerfd instead of firing it.
        let delay = delay.max(Duration::from_nanos(1));

        let timer = sys::timerfd_create()?;
        sys::timerfd_arm(timer.as_raw_fd(), delay)?;

        let fd = timer.as_raw_fd();
        self.queue_readiness(task, fd, INTEREST_IN, JobKind::Timer(timer))
    }

    fn queue_open(&mut self, task: TaskIndex, path: &Path) -> Result<(), RuntimeError> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| RuntimeError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        self.queue_blocking(task, JobKind::Open(path))
    }

    fn queue_stat(&mut self, task: TaskIndex, fd: RawFd) -> Result<(), RuntimeError> {
        self.queue_blocking(task, JobKind::Stat(fd))
    }

    unsafe fn queue_read(
        &mut self,
        task: TaskIndex,
        fd: RawFd,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), RuntimeError> {
        let buf = RawBufMut::capture(buf);
        self.queue_blocking(task, JobKind::Read { fd, buf, offset })
    }

    unsafe fn queue_write(
        &mut self,
        task: TaskIndex,
        fd: RawFd,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), RuntimeError> {
        let buf = RawBuf::capture(buf);
        self.queue_blocking(task, JobKind::Write { fd, buf, offset })
    }

    fn queue_close(&mut self, task: TaskIndex, fd: RawFd) -> Result<(), RuntimeError> {
        self.queue_blocking(task, JobKind::Close(fd))
    }

    fn queue_accept(&mut self, task: TaskIndex, socket: RawFd) -> Result<(), RuntimeError> {
        self.queue_readiness(task, socket, INTEREST_IN, JobKind::Accept(socket))
    }

    fn queue_connect(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        addr: SocketAddr,
    ) -> Result<(), RuntimeError> {
        let addr = SockaddrStorage::from(addr);
        self.queue_readiness(task, socket, INTEREST_OUT, JobKind::Connect { socket, addr })
    }

    unsafe fn queue_recv(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        buf: &mut [u8],
    ) -> Result<(), RuntimeError> {
        let buf = RawBufMut::capture(buf);
        self.queue_readiness(task, socket, INTEREST_IN, JobKind::Recv { socket, buf })
    }

    unsafe fn queue_send(
        &mut self,
        task: TaskIndex,
        socket: RawFd,
        buf: &[u8],
    ) -> Result<(), RuntimeError> {
        let buf = RawBuf::capture(buf);
        self.queue_readiness(task, socket, INTEREST_OUT, JobKind::Send { socket, buf })
    }

    fn waker(&self) -> Waker {
        Waker::new(Arc::clone(&self.wake_fd))
    }

    fn submit(&mut self) -> Result<(), RuntimeError> {
        // Readiness-based: there is nothing to hand to the kernel.
        Ok(())
    }

    fn reap(&mut self, completions: &mut Vec<Completion>, wait: bool) -> Result<(), RuntimeError> {
        debug_assert!(completions.is_empty(), "reap requires a drained buffer");
        let budget = self.events.len().min(completions.capacity());

        loop {
            self.drain_blocking(completions, budget);

            let room = budget - completions.len();
            if room > 0 {
                // Fallback work outstanding means we must keep polling it, so
                // never park in the kernel while the list is non-empty.
                let busy_wait = !wait || !self.blocking.is_empty();
                let timeout_ms = if busy_wait || !completions.is_empty() {
                    0
                } else {
                    -1
                };

                let ready = match sys::epoll_wait(
                    self.epoll.as_raw_fd(),
                    &mut self.events[..room],
                    timeout_ms,
                ) {
                    // A signal is not an event; the next pass observes it.
                    Err(Errno::EINTR) => 0,
                    other => other?,
                };

                for i in 0..ready {
                    if completions.len() == budget {
                        // Saturated mid-batch. Registrations are
                        // level-triggered, so unconsumed events re-deliver on
                        // the next reap.
                        break;
                    }
                    let (flags, data) = {
                        let event = &self.events[i];
                        (event.events, event.u64)
                    };
                    self.handle_event(flags, data, completions)?;
                }
            }

            if !wait || !completions.is_empty() {
                return Ok(());
            }
        }
    }

    fn pending(&self) -> usize {
        // The permanent wake job does not count as outstanding work.
        self.jobs.len() - 1
    }
}
