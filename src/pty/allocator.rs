//! PTY pair allocation
//!
//! Opens a master/slave pair with the requested window geometry applied
//! before anything attaches to the slave, so a shell never observes a
//! default size.
//!
//! Both descriptors are close-on-exec from the moment they exist. On Linux
//! and Android they are opened with `O_CLOEXEC`; elsewhere `openpty` is
//! followed by `FD_CLOEXEC` while [`FORK_LOCK`](super::FORK_LOCK) is held, so
//! no concurrent [`launch`](super::launch) can fork in between.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::pty::Winsize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::fd;

/// Default terminal dimensions
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Maximum terminal dimensions
pub const MAX_ROWS: u16 = 1000;
pub const MAX_COLS: u16 = 1000;

/// Errors that can occur while allocating a PTY pair
#[derive(Error, Debug)]
pub enum AllocError {
    /// Descriptor or PTY table limits reached. Retrying is pointless until
    /// other sessions are closed.
    #[error("PTY resources exhausted: {0}")]
    ResourceExhausted(#[source] Errno),

    #[error("Permission denied opening PTY device: {0}")]
    PermissionDenied(#[source] Errno),

    #[error("PTY device unavailable: {0}")]
    Unavailable(#[source] Errno),

    #[error("Invalid window geometry {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },

    #[error("Failed to configure PTY descriptor: {0}")]
    Configure(#[source] Errno),
}

impl AllocError {
    fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::EMFILE | Errno::ENFILE | Errno::ENOSPC | Errno::EAGAIN | Errno::ENOMEM => {
                AllocError::ResourceExhausted(errno)
            }
            Errno::EACCES | Errno::EPERM => AllocError::PermissionDenied(errno),
            other => AllocError::Unavailable(other),
        }
    }
}

/// Result type for allocation
pub type AllocResult<T> = Result<T, AllocError>;

/// Terminal window geometry, in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl WindowSize {
    /// Create a new window size. Rows come first, as in `winsize`.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Both dimensions are non-zero and within the supported maximum.
    pub fn is_valid(&self) -> bool {
        (1..=MAX_ROWS).contains(&self.rows) && (1..=MAX_COLS).contains(&self.cols)
    }

    pub(crate) fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A freshly allocated master/slave pair.
///
/// Both descriptors are close-on-exec. The pair is consumed by
/// [`launch`](super::launch), which hands the slave to the child and keeps
/// only the master.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
    size: WindowSize,
}

impl PtyPair {
    /// Geometry requested at allocation time
    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// Geometry as currently reported by the kernel
    pub fn window_size(&self) -> Result<WindowSize, Errno> {
        fd::window_size(self.master.as_raw_fd())
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn slave_fd(&self) -> RawFd {
        self.slave.as_raw_fd()
    }

    pub(crate) fn into_parts(self) -> (OwnedFd, OwnedFd, WindowSize) {
        (self.master, self.slave, self.size)
    }
}

/// Allocate a PTY pair with the given geometry.
pub fn allocate(rows: u16, cols: u16) -> AllocResult<PtyPair> {
    let size = WindowSize::new(rows, cols);
    if !size.is_valid() {
        return Err(AllocError::InvalidGeometry { rows, cols });
    }

    let (master, slave) = open_pair(size)?;

    debug!(
        master = master.as_raw_fd(),
        slave = slave.as_raw_fd(),
        rows,
        cols,
        "Allocated PTY pair"
    );

    Ok(PtyPair {
        master,
        slave,
        size,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pair(size: WindowSize) -> AllocResult<(OwnedFd, OwnedFd)> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    use nix::fcntl::{open, OFlag};
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
    use nix::sys::stat::Mode;

    let flags = OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC;
    let master = posix_openpt(flags).map_err(AllocError::from_errno)?;
    grantpt(&master).map_err(AllocError::from_errno)?;
    unlockpt(&master).map_err(AllocError::from_errno)?;
    let slave_name = ptsname_r(&master).map_err(AllocError::from_errno)?;

    // SAFETY: `into_raw_fd` gives up the only owner of the master descriptor.
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    let slave = open(slave_name.as_str(), flags, Mode::empty()).map_err(AllocError::from_errno)?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    fd::set_window_size(master.as_raw_fd(), size).map_err(AllocError::Configure)?;
    Ok((master, slave))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pair(size: WindowSize) -> AllocResult<(OwnedFd, OwnedFd)> {
    use std::sync::PoisonError;

    use nix::pty::openpty;

    let _fork_guard = super::FORK_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let pty = openpty(Some(&size.to_winsize()), None).map_err(AllocError::from_errno)?;
    fd::set_cloexec(pty.master.as_raw_fd()).map_err(AllocError::Configure)?;
    fd::set_cloexec(pty.slave.as_raw_fd()).map_err(AllocError::Configure)?;
    Ok((pty.master, pty.slave))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_default() {
        let size = WindowSize::default();
        assert_eq!(size.rows, 24);
        assert_eq!(size.cols, 80);
        assert!(size.is_valid());
    }

    #[test]
    fn test_window_size_validation() {
        assert!(!WindowSize::new(0, 80).is_valid());
        assert!(!WindowSize::new(24, 0).is_valid());
        assert!(!WindowSize::new(MAX_ROWS + 1, 80).is_valid());
        assert!(WindowSize::new(1, 1).is_valid());
        assert!(WindowSize::new(MAX_ROWS, MAX_COLS).is_valid());
    }

    #[test]
    fn test_allocate_reports_requested_geometry() {
        for (rows, cols) in [(24, 80), (1, 1), (40, 120), (200, 500)] {
            let pair = allocate(rows, cols).unwrap();
            assert_eq!(pair.size(), WindowSize::new(rows, cols));
            assert_eq!(pair.window_size().unwrap(), WindowSize::new(rows, cols));
        }
    }

    #[test]
    fn test_allocate_rejects_zero_dimensions() {
        let result = allocate(0, 80);
        assert!(matches!(
            result,
            Err(AllocError::InvalidGeometry { rows: 0, cols: 80 })
        ));

        let result = allocate(24, 0);
        assert!(matches!(result, Err(AllocError::InvalidGeometry { .. })));
    }

    #[test]
    fn test_allocated_descriptors_are_cloexec() {
        let pair = allocate(24, 80).unwrap();
        assert!(fd::is_cloexec(pair.master_fd()).unwrap());
        assert!(fd::is_cloexec(pair.slave_fd()).unwrap());
        assert_ne!(pair.master_fd(), pair.slave_fd());
    }

    #[test]
    fn test_errno_classification() {
        assert!(matches!(
            AllocError::from_errno(Errno::EMFILE),
            AllocError::ResourceExhausted(_)
        ));
        assert!(matches!(
            AllocError::from_errno(Errno::EACCES),
            AllocError::PermissionDenied(_)
        ));
        assert!(matches!(
            AllocError::from_errno(Errno::ENOENT),
            AllocError::Unavailable(_)
        ));
    }

    #[test]
    fn test_window_size_display() {
        assert_eq!(WindowSize::new(24, 80).to_string(), "24x80");
    }
}
