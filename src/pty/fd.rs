//! Raw descriptor helpers
//!
//! Small wrappers over the `nix` calls the allocator, launcher and I/O channel
//! share. Everything here works on borrowed descriptors; ownership stays with
//! the caller's `OwnedFd`.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;

use super::WindowSize;

/// Mark a descriptor close-on-exec so sibling children never inherit it.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Returns whether `FD_CLOEXEC` is set on the descriptor.
#[cfg(test)]
pub(crate) fn is_cloexec(fd: RawFd) -> Result<bool, Errno> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    Ok(flags.contains(FdFlag::FD_CLOEXEC))
}

/// Toggle `O_NONBLOCK` on the open file description behind `fd`.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), Errno> {
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Returns whether `O_NONBLOCK` is set.
#[cfg(test)]
pub(crate) fn is_nonblocking(fd: RawFd) -> Result<bool, Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    Ok(flags.contains(OFlag::O_NONBLOCK))
}

/// Apply window geometry with TIOCSWINSZ. The kernel raises SIGWINCH in the
/// foreground process group of the terminal.
pub(crate) fn set_window_size(fd: RawFd, size: WindowSize) -> Result<(), Errno> {
    let winsize = size.to_winsize();
    // SAFETY: TIOCSWINSZ reads a `winsize` struct that outlives the call.
    Errno::result(unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &winsize) })?;
    Ok(())
}

/// Query window geometry with TIOCGWINSZ.
pub(crate) fn window_size(fd: RawFd) -> Result<WindowSize, Errno> {
    // SAFETY: winsize is plain old data; zeroed is a valid value.
    let mut winsize: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes into the struct we own.
    Errno::result(unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut winsize) })?;
    Ok(WindowSize::new(winsize.ws_row, winsize.ws_col))
}

/// Single `read(2)`, retried on EINTR.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match unistd::read(fd, buf) {
            Err(Errno::EINTR) => continue,
            result => return result.map_err(io::Error::from),
        }
    }
}

/// Single `write(2)`, retried on EINTR.
pub(crate) fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    loop {
        match unistd::write(fd, buf) {
            Err(Errno::EINTR) => continue,
            result => return result.map_err(io::Error::from),
        }
    }
}

/// Wait until `fd` accepts writes or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout.
pub(crate) fn wait_writable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), Errno> {
    unistd::pipe2(OFlag::O_CLOEXEC)
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
///
/// Without `pipe2` the flags are set after the fact, so callers must hold
/// [`FORK_LOCK`](super::FORK_LOCK).
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn pipe_cloexec() -> Result<(OwnedFd, OwnedFd), Errno> {
    use std::os::fd::AsRawFd;

    let (read_end, write_end) = unistd::pipe()?;
    set_cloexec(read_end.as_raw_fd())?;
    set_cloexec(write_end.as_raw_fd())?;
    Ok((read_end, write_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, AsRawFd};

    #[test]
    fn test_pipe_is_cloexec() {
        let (rx, tx) = pipe_cloexec().unwrap();
        assert!(is_cloexec(rx.as_raw_fd()).unwrap());
        assert!(is_cloexec(tx.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_pipe_read_write() {
        let (rx, tx) = pipe_cloexec().unwrap();
        assert_eq!(write(tx.as_fd(), b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = read(rx.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_toggle_nonblocking() {
        let (rx, _tx) = pipe_cloexec().unwrap();
        assert!(!is_nonblocking(rx.as_raw_fd()).unwrap());

        set_nonblocking(rx.as_raw_fd(), true).unwrap();
        assert!(is_nonblocking(rx.as_raw_fd()).unwrap());

        let mut buf = [0u8; 4];
        let err = read(rx.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        set_nonblocking(rx.as_raw_fd(), false).unwrap();
        assert!(!is_nonblocking(rx.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_set_cloexec_on_plain_pipe() {
        let (rx, _tx) = unistd::pipe().unwrap();
        assert!(!is_cloexec(rx.as_raw_fd()).unwrap());
        set_cloexec(rx.as_raw_fd()).unwrap();
        assert!(is_cloexec(rx.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_wait_writable_on_empty_pipe() {
        let (_rx, tx) = pipe_cloexec().unwrap();
        assert!(wait_writable(tx.as_fd(), Duration::from_millis(100)).unwrap());
    }
}
