//! Shell process launch
//!
//! Forks a child attached to the slave side of a [`PtyPair`] and execs the
//! shell in it. The parent keeps the master and the child pid and wraps them
//! in a [`Session`].
//!
//! Exec failure is asynchronous. `launch` returns as soon as the fork
//! succeeds; if `execvp` later fails in the child, the child writes the stage
//! and errno to a close-on-exec report pipe and exits with
//! [`EXEC_FAILURE_STATUS`]. The session observes this when it reaps the child
//! and ends in `Failed(ExecFailed)`. A successful exec closes the pipe
//! unwritten, so a shell that itself exits with 127 is still `Exited(127)`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{fork, ForkResult};
use thiserror::Error;
use tracing::{info, warn};

use super::{fd, PtyPair, FORK_LOCK};
use crate::session::{FailureReason, IoMode, Session};

/// Exit status of a child that could not exec the shell
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// Default grace period between the terminate signal and SIGKILL
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Default bound on how long `send` waits for a full PTY buffer to drain
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while launching a shell
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The OS could not create the process.
    #[error("Failed to fork shell process: {0}")]
    ForkFailed(#[source] Errno),

    /// The child could not exec the shell. Never returned by [`launch`];
    /// produced from a session's terminal state by
    /// [`SessionState::launch_error`](crate::session::SessionState::launch_error).
    #[error("Failed to exec shell: {}", errno_message(.errno))]
    ExecFailed { errno: i32 },

    /// The child failed to attach the terminal or change directory before
    /// exec. Produced the same way as [`ExecFailed`](Self::ExecFailed).
    #[error("Failed to prepare shell process: {}", errno_message(.errno))]
    SetupFailed { errno: i32 },

    #[error("Invalid launch argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to create exec report pipe: {0}")]
    ReportPipe(#[source] Errno),

    #[error("Failed to configure PTY master: {0}")]
    Configure(#[source] Errno),
}

fn errno_message(errno: &i32) -> String {
    io::Error::from_raw_os_error(*errno).to_string()
}

/// Result type for launch
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Per-session behaviour chosen at launch time
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    /// Blocking or non-blocking reads and writes on the master
    pub io_mode: IoMode,
    /// Bytes appended to every `send`
    pub line_terminator: Vec<u8>,
    /// Signal sent first by `terminate`
    pub terminate_signal: Signal,
    /// How long `terminate` waits before escalating to SIGKILL
    pub terminate_grace: Duration,
    /// Upper bound for a non-blocking `send` waiting on a full buffer
    pub write_timeout: Duration,
    /// Working directory for the shell
    pub working_dir: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            io_mode: IoMode::default(),
            line_terminator: b"\n".to_vec(),
            terminate_signal: Signal::SIGHUP,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            working_dir: None,
        }
    }
}

impl LaunchOptions {
    pub fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    pub fn with_line_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn with_terminate_signal(mut self, signal: Signal) -> Self {
        self.terminate_signal = signal;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Stage at which the child gave up, as written to the report pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum ChildStage {
    Setup = 1,
    Exec = 2,
}

/// Wire format of the exec report: stage then errno, native endian
pub(crate) const CHILD_REPORT_LEN: usize = 8;

fn encode_child_report(stage: ChildStage, errno: i32) -> [u8; CHILD_REPORT_LEN] {
    let mut report = [0u8; CHILD_REPORT_LEN];
    report[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
    report[4..].copy_from_slice(&errno.to_ne_bytes());
    report
}

/// Decode a report written by a failed child.
pub(crate) fn decode_child_report(report: &[u8]) -> Option<FailureReason> {
    if report.len() != CHILD_REPORT_LEN {
        return None;
    }
    let stage = i32::from_ne_bytes(report[..4].try_into().ok()?);
    let errno = i32::from_ne_bytes(report[4..].try_into().ok()?);
    match stage {
        s if s == ChildStage::Setup as i32 => Some(FailureReason::SetupFailed { errno }),
        s if s == ChildStage::Exec as i32 => Some(FailureReason::ExecFailed { errno }),
        _ => None,
    }
}

/// argv for the child, built before fork so the child never allocates
struct ChildArgv {
    args: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl ChildArgv {
    fn new<S: AsRef<str>>(shell: &str, args: &[S]) -> LaunchResult<Self> {
        if shell.is_empty() {
            return Err(LaunchError::InvalidArgument("shell path is empty".to_string()));
        }

        let mut cstrings = Vec::with_capacity(args.len() + 1);
        cstrings.push(to_cstring(shell)?);
        for arg in args {
            cstrings.push(to_cstring(arg.as_ref())?);
        }

        let mut ptrs: Vec<*const libc::c_char> = cstrings.iter().map(|c| c.as_ptr()).collect();
        ptrs.push(std::ptr::null());

        Ok(Self {
            args: cstrings,
            ptrs,
        })
    }

    fn program(&self) -> *const libc::c_char {
        self.args[0].as_ptr()
    }

    fn argv(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

fn to_cstring(value: &str) -> LaunchResult<CString> {
    CString::new(value)
        .map_err(|_| LaunchError::InvalidArgument(format!("contains NUL byte: {value:?}")))
}

fn path_to_cstring(path: &Path) -> LaunchResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        LaunchError::InvalidArgument(format!("contains NUL byte: {}", path.display()))
    })
}

/// Descriptors the child needs to rearrange before exec
#[derive(Clone, Copy)]
struct ChildFds {
    master: RawFd,
    slave: RawFd,
    report_rx: RawFd,
    report_tx: RawFd,
}

/// Launch `shell` with `args` on the slave side of `pair`.
///
/// `shell` is resolved through `PATH` (e.g. `"sh"` or `"su"`); it is also
/// passed as argv[0]. On success the returned session is `Running` and owns
/// the master. Exec failure is not reported here; see the module docs.
pub fn launch<S: AsRef<str>>(
    pair: PtyPair,
    shell: &str,
    args: &[S],
    options: LaunchOptions,
) -> LaunchResult<Session> {
    let argv = ChildArgv::new(shell, args)?;
    let cwd = options
        .working_dir
        .as_deref()
        .map(path_to_cstring)
        .transpose()?;

    let (master, slave, size) = pair.into_parts();
    fd::set_nonblocking(master.as_raw_fd(), options.io_mode == IoMode::NonBlocking)
        .map_err(LaunchError::Configure)?;

    let fork_guard = FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let (report_rx, report_tx) = fd::pipe_cloexec().map_err(LaunchError::ReportPipe)?;
    fd::set_nonblocking(report_rx.as_raw_fd(), true).map_err(LaunchError::ReportPipe)?;

    let child_fds = ChildFds {
        master: master.as_raw_fd(),
        slave: slave.as_raw_fd(),
        report_rx: report_rx.as_raw_fd(),
        report_tx: report_tx.as_raw_fd(),
    };

    // SAFETY: the child branch only makes async-signal-safe libc calls on
    // memory prepared above, and always ends in exec or _exit.
    let forked = unsafe { fork() };
    if !matches!(forked, Ok(ForkResult::Child)) {
        drop(fork_guard);
    }

    match forked {
        Err(errno) => {
            warn!(shell, %errno, "Failed to fork shell process");
            Err(LaunchError::ForkFailed(errno))
        }
        Ok(ForkResult::Child) => {
            // SAFETY: we are the freshly forked child.
            unsafe { exec_child(child_fds, &argv, cwd.as_ref()) }
        }
        Ok(ForkResult::Parent { child }) => {
            // The slave now lives only in the child; the write end of the
            // report pipe must close here or a failed exec would never EOF.
            drop(slave);
            drop(report_tx);

            info!(
                pid = child.as_raw(),
                shell,
                rows = size.rows,
                cols = size.cols,
                mode = ?options.io_mode,
                "Launched shell"
            );

            let mut session = Session::new(child, master, report_rx, options);
            session.mark_running();
            Ok(session)
        }
    }
}

/// Child side of the fork. Never returns.
///
/// # Safety
///
/// Must only be called in the child right after `fork`.
unsafe fn exec_child(fds: ChildFds, argv: &ChildArgv, cwd: Option<&CString>) -> ! {
    libc::close(fds.master);
    libc::close(fds.report_rx);

    if libc::setsid() < 0 {
        child_fail(fds.report_tx, ChildStage::Setup);
    }

    // Make the slave our controlling terminal. Some platforms do this
    // implicitly on first open after setsid, so failure is tolerated.
    libc::ioctl(fds.slave, libc::TIOCSCTTY as _, 0);

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if fds.slave == target {
            // dup2 onto itself keeps FD_CLOEXEC; clear it by hand.
            if libc::fcntl(fds.slave, libc::F_SETFD, 0) < 0 {
                child_fail(fds.report_tx, ChildStage::Setup);
            }
        } else if libc::dup2(fds.slave, target) < 0 {
            child_fail(fds.report_tx, ChildStage::Setup);
        }
    }
    if fds.slave > libc::STDERR_FILENO {
        libc::close(fds.slave);
    }

    if let Some(dir) = cwd {
        if libc::chdir(dir.as_ptr()) < 0 {
            child_fail(fds.report_tx, ChildStage::Setup);
        }
    }

    // The Rust runtime ignores SIGPIPE and the parent may block signals;
    // both would otherwise be inherited by the shell.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    libc::execvp(argv.program(), argv.argv());
    child_fail(fds.report_tx, ChildStage::Exec)
}

/// Report `errno` for `stage` to the parent and exit.
///
/// # Safety
///
/// Child-only; see [`exec_child`].
unsafe fn child_fail(report_tx: RawFd, stage: ChildStage) -> ! {
    let errno = Errno::last() as i32;
    let report = encode_child_report(stage, errno);
    libc::write(
        report_tx,
        report.as_ptr().cast::<libc::c_void>(),
        report.len(),
    );
    libc::_exit(EXEC_FAILURE_STATUS)
}
