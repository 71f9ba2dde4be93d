//! Thin shims over the raw syscalls the epoll backend needs.
//!
//! These stay on `libc` plus `Errno::result`: the fallback drain works on
//! borrowed descriptors it does not own and must observe `EAGAIN` verbatim,
//! and the epoll/eventfd/timerfd plumbing wants exact control over flags and
//! user-data.

use crate::aio::FileStat;
use nix::errno::Errno;
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn eventfd() -> Result<OwnedFd, Errno> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    // Safety: a successful eventfd(2) hands us sole ownership of the fd.
    Errno::result(fd).map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn epoll_create() -> Result<OwnedFd, Errno> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    // Safety: as in `eventfd`.
    Errno::result(fd).map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn epoll_ctl(
    epoll: RawFd,
    op: libc::c_int,
    fd: RawFd,
    event: Option<&mut libc::epoll_event>,
) -> Result<(), Errno> {
    let event = event.map_or(std::ptr::null_mut(), |e| e as *mut _);
    Errno::result(unsafe { libc::epoll_ctl(epoll, op, fd, event) }).map(drop)
}

pub(crate) fn epoll_wait(
    epoll: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: libc::c_int,
) -> Result<usize, Errno> {
    let n = unsafe {
        libc::epoll_wait(
            epoll,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout_ms,
        )
    };
    Errno::result(n).map(|n| n as usize)
}

/// Non-blocking monotonic timerfd, unarmed.
pub(crate) fn timerfd_create() -> Result<OwnedFd, Errno> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    // Safety: as in `eventfd`.
    Errno::result(fd).map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arm a timerfd for a single expiration `delay` from now.
pub(crate) fn timerfd_arm(fd: RawFd, delay: Duration) -> Result<(), Errno> {
    let zero = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let spec = libc::itimerspec {
        it_interval: zero,
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    Errno::result(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) }).map(drop)
}

pub(crate) fn open(path: &CStr, flags: libc::c_int) -> Result<RawFd, Errno> {
    Errno::result(unsafe { libc::openat(libc::AT_FDCWD, path.as_ptr(), flags) })
}

pub(crate) fn fstat(fd: RawFd) -> Result<libc::stat, Errno> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe { libc::fstat(fd, stat.as_mut_ptr()) })?;
    Ok(unsafe { stat.assume_init() })
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
    let n = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            offset as libc::off_t,
        )
    };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> Result<usize, Errno> {
    let n = unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t) };
    Errno::result(n).map(|n| n as usize)
}

pub(crate) fn close(fd: RawFd) -> Result<(), Errno> {
    Errno::result(unsafe { libc::close(fd) }).map(drop)
}

impl From<libc::stat> for FileStat {
    fn from(stat: libc::stat) -> Self {
        Self {
            size: stat.st_size as u64,
            mode: stat.st_mode as u32,
            accessed: unix_time(stat.st_atime, stat.st_atime_nsec),
            modified: unix_time(stat.st_mtime, stat.st_mtime_nsec),
            changed: unix_time(stat.st_ctime, stat.st_ctime_nsec),
        }
    }
}

fn unix_time(secs: libc::time_t, nanos: libc::c_long) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
}

/// One 8-byte counter read, as eventfd and timerfd expect.
pub(crate) fn read_u64(fd: RawFd) -> Result<u64, Errno> {
    let mut buf = [0u8; 8];
    read(fd, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

pub(crate) fn write_u64(fd: RawFd, value: u64) -> Result<(), Errno> {
    write(fd, &value.to_ne_bytes()).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::Write as _;
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_eventfd_roundtrip() {
        let fd = eventfd().unwrap();

        write_u64(fd.as_raw_fd(), 3).unwrap();
        write_u64(fd.as_raw_fd(), 4).unwrap();
        assert_eq!(read_u64(fd.as_raw_fd()).unwrap(), 7);

        // Drained and non-blocking, so the next read reports empty.
        assert_eq!(read_u64(fd.as_raw_fd()), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_open_pread_fstat() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abcdef").unwrap();

        let path = CString::new(tmp.path().as_os_str().as_bytes()).unwrap();
        let fd = open(&path, libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC).unwrap();

        let stat = fstat(fd).unwrap();
        assert_eq!(stat.st_size, 6);

        let mut buf = [0u8; 3];
        assert_eq!(pread(fd, &mut buf, 3).unwrap(), 3);
        assert_eq!(&buf, b"def");

        close(fd).unwrap();
        assert!(matches!(fstat(fd), Err(Errno::EBADF)));
    }
}
