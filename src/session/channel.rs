//! Session I/O channel
//!
//! A [`Session`] owns the PTY master and the child pid of one launched shell.
//! It carries the lifecycle state machine and is the only place the child is
//! reaped, so a pid is waited on exactly once and the master is closed
//! exactly once.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{FailureReason, SessionState};
use crate::pty::{
    decode_child_report, fd, LaunchOptions, WindowSize, CHILD_REPORT_LEN, EXEC_FAILURE_STATUS,
};

/// Default number of bytes requested per read
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Cap on output kept from the master after the shell is gone
pub const RESIDUAL_LIMIT: usize = 64 * 1024;

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

type SignalSender = fn(Pid, Signal) -> nix::Result<()>;

/// Errors that can occur during session I/O
#[derive(Error, Debug)]
pub enum IoError {
    /// The session is no longer running. Retrying will not help.
    #[error("Session channel is closed")]
    ChannelClosed,

    #[error("Failed to write to session: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("Failed to read from session: {0}")]
    ReadFailed(#[source] io::Error),

    /// Non-blocking mode only. Safe to retry.
    #[error("Operation would block")]
    WouldBlock,

    #[error("Failed to resize terminal: {0}")]
    ResizeFailed(#[source] Errno),

    #[error("Invalid window geometry {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },

    #[error("Failed to terminate shell: {0}")]
    TerminateFailed(#[source] Errno),
}

impl IoError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IoError::WouldBlock)
    }
}

/// Result type for session I/O
pub type IoResult<T> = Result<T, IoError>;

/// How reads and writes on the master behave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Calls wait for the descriptor.
    Blocking,
    /// Calls return [`IoError::WouldBlock`] instead of waiting.
    #[default]
    NonBlocking,
}

/// A launched shell attached to a PTY master
#[derive(Debug)]
pub struct Session {
    pid: Pid,
    /// `None` once the channel is closed
    master: Option<OwnedFd>,
    /// Read end of the exec report pipe, until the child is reaped
    exec_report: Option<OwnedFd>,
    state: SessionState,
    options: LaunchOptions,
    residual: Vec<u8>,
    terminate_requested: bool,
    send_signal: SignalSender,
}

impl Session {
    pub(crate) fn new(
        pid: Pid,
        master: OwnedFd,
        exec_report: OwnedFd,
        options: LaunchOptions,
    ) -> Self {
        Self {
            pid,
            master: Some(master),
            exec_report: Some(exec_report),
            state: SessionState::Starting,
            options,
            residual: Vec::new(),
            terminate_requested: false,
            send_signal: kill::<Signal>,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        if self.state == SessionState::Starting {
            self.state = SessionState::Running;
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Last observed state. Does not touch the child; see [`poll_status`](Self::poll_status).
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn io_mode(&self) -> IoMode {
        self.options.io_mode
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Borrow the master for I/O. The child is polled first, so a shell
    /// that already exited is reported as `ChannelClosed`.
    fn live_master(&mut self) -> IoResult<RawFd> {
        if self.poll_status() != SessionState::Running {
            return Err(IoError::ChannelClosed);
        }
        self.master
            .as_ref()
            .map(|master| master.as_raw_fd())
            .ok_or(IoError::ChannelClosed)
    }

    /// Send `bytes` followed by the line terminator as one write.
    pub fn send(&mut self, bytes: &[u8]) -> IoResult<()> {
        self.live_master()?;
        let master = self.master.as_ref().ok_or(IoError::ChannelClosed)?;

        let mut frame = Vec::with_capacity(bytes.len() + self.options.line_terminator.len());
        frame.extend_from_slice(bytes);
        frame.extend_from_slice(&self.options.line_terminator);

        match write_frame(master.as_fd(), &frame, self.options.write_timeout) {
            Ok(()) => {
                debug!("Sent {} bytes to pid {}", frame.len(), self.pid);
                Ok(())
            }
            Err(IoError::WriteFailed(e)) => {
                // EIO/EPIPE usually means the shell is gone; pick that up now.
                self.poll_status();
                Err(IoError::WriteFailed(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Read at most `max_bytes` of shell output.
    ///
    /// `Ok(empty)` means end of stream. Bytes are returned as read, so a
    /// chunk may end inside a multi-byte character.
    pub fn receive(&mut self, max_bytes: usize) -> IoResult<Vec<u8>> {
        let master = self.live_master()?;
        if max_bytes == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; max_bytes];
        match fd::read(master, &mut buf) {
            Ok(0) => {
                self.on_eof();
                Ok(Vec::new())
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(IoError::WouldBlock),
            // Linux reports EIO on the master once every slave fd is closed
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                self.on_eof();
                Ok(Vec::new())
            }
            Err(e) => Err(IoError::ReadFailed(e)),
        }
    }

    fn on_eof(&mut self) {
        debug!("End of output from pid {}", self.pid);
        self.poll_status();
    }

    /// Change the terminal geometry. The shell gets SIGWINCH.
    pub fn resize(&mut self, rows: u16, cols: u16) -> IoResult<()> {
        let master = self.live_master()?;
        let size = WindowSize::new(rows, cols);
        if !size.is_valid() {
            return Err(IoError::InvalidGeometry { rows, cols });
        }

        fd::set_window_size(master, size).map_err(IoError::ResizeFailed)?;
        debug!("Resized pid {} to {}", self.pid, size);
        Ok(())
    }

    /// Current terminal geometry as reported by the kernel
    pub fn window_size(&mut self) -> IoResult<WindowSize> {
        let master = self.live_master()?;
        fd::window_size(master).map_err(IoError::ResizeFailed)
    }

    /// Check whether the shell has terminated, without blocking.
    ///
    /// On the first observed termination any output still buffered in the
    /// master is kept (see [`take_residual_output`](Self::take_residual_output))
    /// and the master is closed.
    pub fn poll_status(&mut self) -> SessionState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let Some(state) = self.reap(Some(WaitPidFlag::WNOHANG)) {
            self.finish(state);
        }
        self.state
    }

    /// Stop the shell.
    ///
    /// Sends the configured terminate signal, waits out the grace period and
    /// then escalates to SIGKILL. A no-op on a session that already ended.
    pub fn terminate(&mut self) -> IoResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if let Some(state) = self.reap(Some(WaitPidFlag::WNOHANG)) {
            self.finish(state);
            return Ok(());
        }

        self.terminate_requested = true;
        let signal = self.options.terminate_signal;
        info!("Terminating pid {} with {}", self.pid, signal.as_str());

        match (self.send_signal)(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                // Set-uid shells (su) refuse our signals; hanging up the
                // terminal still reaches them.
                warn!(
                    "Not permitted to signal pid {}, closing PTY master instead",
                    self.pid
                );
                self.release_master();
            }
            Err(errno) => return Err(IoError::TerminateFailed(errno)),
        }

        if let Some(state) = self.wait_for_exit(self.options.terminate_grace) {
            self.finish(state);
            return Ok(());
        }

        warn!(
            "Pid {} still alive after {:?}, sending SIGKILL",
            self.pid, self.options.terminate_grace
        );
        match (self.send_signal)(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                warn!("Failed to kill pid {}: {}", self.pid, errno);
                return Err(IoError::TerminateFailed(errno));
            }
        }

        let state = self
            .reap(None)
            .unwrap_or(SessionState::Failed(FailureReason::Lost));
        self.finish(state);
        Ok(())
    }

    fn wait_for_exit(&mut self, grace: Duration) -> Option<SessionState> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(state) = self.reap(Some(WaitPidFlag::WNOHANG)) {
                return Some(state);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(TERMINATE_POLL_INTERVAL);
        }
    }

    /// Wait on the child. `None` while it is still alive.
    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Option<SessionState> {
        loop {
            match waitpid(self.pid, flags) {
                Ok(WaitStatus::StillAlive) => return None,
                Ok(WaitStatus::Exited(_, code)) => return Some(self.classify_exit(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    let reason = if self.terminate_requested {
                        FailureReason::Terminated(signal)
                    } else {
                        FailureReason::Signaled(signal)
                    };
                    return Some(SessionState::Failed(reason));
                }
                // Stop/continue notifications; the child is still there
                Ok(_) if flags.is_some() => return None,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!("Pid {} was reaped elsewhere", self.pid);
                    return Some(SessionState::Failed(FailureReason::Lost));
                }
                Err(errno) => {
                    warn!("waitpid failed for pid {}: {}", self.pid, errno);
                    return Some(SessionState::Failed(FailureReason::Lost));
                }
            }
        }
    }

    /// Tell an exec failure apart from a shell that exited with the same code.
    fn classify_exit(&mut self, code: i32) -> SessionState {
        if code == EXEC_FAILURE_STATUS {
            if let Some(reason) = self.read_exec_report() {
                return SessionState::Failed(reason);
            }
        }
        SessionState::Exited(code)
    }

    fn read_exec_report(&mut self) -> Option<FailureReason> {
        let report = self.exec_report.take()?;
        let mut buf = [0u8; CHILD_REPORT_LEN];
        let mut filled = 0;
        while filled < buf.len() {
            match fd::read(report.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
        decode_child_report(&buf[..filled])
    }

    /// Record the terminal state and release everything tied to the child.
    fn finish(&mut self, state: SessionState) {
        self.drain_residual();
        self.release_master();
        self.exec_report = None;
        self.state = state;

        match state {
            SessionState::Exited(code) => info!("Shell pid {} exited with code {}", self.pid, code),
            SessionState::Failed(reason) => warn!("Shell pid {} {}", self.pid, reason),
            _ => {}
        }
    }

    fn drain_residual(&mut self) {
        let Some(master) = self.master.as_ref().map(|m| m.as_raw_fd()) else {
            return;
        };
        // A grandchild may still hold the slave open; never block here.
        let _ = fd::set_nonblocking(master, true);

        let mut buf = [0u8; DEFAULT_READ_CHUNK];
        while self.residual.len() < RESIDUAL_LIMIT {
            match fd::read(master, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = RESIDUAL_LIMIT - self.residual.len();
                    self.residual.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
        if !self.residual.is_empty() {
            debug!(
                "Kept {} bytes of residual output from pid {}",
                self.residual.len(),
                self.pid
            );
        }
    }

    fn release_master(&mut self) {
        if let Some(master) = self.master.take() {
            debug!("Closing PTY master {} for pid {}", master.as_raw_fd(), self.pid);
            drop(master);
        }
    }

    /// Output drained from the master after the shell terminated. Returned
    /// once; later calls get an empty buffer.
    pub fn take_residual_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.residual)
    }

    pub fn residual_output(&self) -> &[u8] {
        &self.residual
    }
}

/// Write all of `frame`, waiting up to `timeout` whenever the master is full.
fn write_frame(master: BorrowedFd<'_>, frame: &[u8], timeout: Duration) -> IoResult<()> {
    let deadline = Instant::now() + timeout;
    let mut written = 0;
    while written < frame.len() {
        match fd::write(master, &frame[written..]) {
            Ok(0) => return Err(IoError::WriteFailed(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let ready = !remaining.is_zero()
                    && fd::wait_writable(master, remaining).map_err(IoError::WriteFailed)?;
                if !ready {
                    if written == 0 {
                        return Err(IoError::WouldBlock);
                    }
                    return Err(IoError::WriteFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("partial write: {} of {} bytes", written, frame.len()),
                    )));
                }
            }
            Err(e) => return Err(IoError::WriteFailed(e)),
        }
    }
    Ok(())
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.is_live() {
            if let Err(e) = self.terminate() {
                warn!("Failed to terminate pid {} on drop: {}", self.pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{allocate, launch};

    fn spawn(args: &[&str], options: LaunchOptions) -> Session {
        let pair = allocate(24, 80).unwrap();
        launch(pair, "sh", args, options).unwrap()
    }

    fn spawn_shell() -> Session {
        spawn(&[], LaunchOptions::default())
    }

    /// Collect output until `needle` shows up, the session ends, or 5s pass.
    fn read_until(session: &mut Session, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut output = Vec::new();
        while Instant::now() < deadline {
            match session.receive(DEFAULT_READ_CHUNK) {
                Ok(chunk) if !chunk.is_empty() => output.extend_from_slice(&chunk),
                Ok(_) if session.state().is_terminal() => break,
                Ok(_) | Err(IoError::WouldBlock) => {
                    std::thread::sleep(Duration::from_millis(10))
                }
                Err(_) => break,
            }
            if String::from_utf8_lossy(&output).contains(needle) {
                break;
            }
        }
        output.extend(session.take_residual_output());
        String::from_utf8_lossy(&output).into_owned()
    }

    fn wait_terminal(session: &mut Session) -> SessionState {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let state = session.poll_status();
            if state.is_terminal() {
                return state;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        session.state()
    }

    #[test]
    fn test_running_after_launch() {
        let mut session = spawn_shell();
        assert!(session.is_running());
        assert_eq!(session.io_mode(), IoMode::NonBlocking);
        assert_eq!(session.poll_status(), SessionState::Running);
    }

    #[test]
    fn test_send_and_receive() {
        let mut session = spawn_shell();
        session.send(b"echo $((40+2))").unwrap();
        let output = read_until(&mut session, "42");
        assert!(output.contains("42"), "output was {output:?}");
    }

    #[test]
    fn test_receive_zero_bytes() {
        let mut session = spawn_shell();
        assert!(session.receive(0).unwrap().is_empty());
        assert!(session.is_running());
    }

    #[test]
    fn test_terminate_reaps_child() {
        let mut session = spawn_shell();
        let pid = session.pid();

        session.terminate().unwrap();

        assert!(session.state().is_terminal());
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_terminate_twice() {
        let mut session = spawn_shell();
        session.terminate().unwrap();
        let state = session.state();
        session.terminate().unwrap();
        assert_eq!(session.state(), state);
    }

    #[test]
    fn test_terminate_escalates_to_sigkill() {
        let options = LaunchOptions::default().with_terminate_grace(Duration::from_millis(100));
        let mut session = spawn(
            &["-c", "trap '' HUP; echo ready; while :; do sleep 1; done"],
            options,
        );
        let output = read_until(&mut session, "ready");
        assert!(output.contains("ready"));

        session.terminate().unwrap();
        assert_eq!(
            session.state(),
            SessionState::Failed(FailureReason::Terminated(Signal::SIGKILL))
        );
    }

    #[test]
    fn test_closed_channel_after_terminate() {
        let mut session = spawn_shell();
        session.terminate().unwrap();

        assert!(matches!(session.send(b"echo hi"), Err(IoError::ChannelClosed)));
        assert!(matches!(session.receive(16), Err(IoError::ChannelClosed)));
        assert!(matches!(session.resize(30, 100), Err(IoError::ChannelClosed)));
        assert!(!IoError::ChannelClosed.is_retryable());
    }

    #[test]
    fn test_resize() {
        let mut session = spawn_shell();
        session.resize(40, 120).unwrap();
        assert_eq!(session.window_size().unwrap(), WindowSize::new(40, 120));

        assert!(matches!(
            session.resize(0, 120),
            Err(IoError::InvalidGeometry { rows: 0, cols: 120 })
        ));
    }

    #[test]
    fn test_exit_code() {
        let mut session = spawn(&["-c", "exit 3"], LaunchOptions::default());
        assert_eq!(wait_terminal(&mut session), SessionState::Exited(3));
        assert_eq!(session.state().exit_code(), Some(3));
    }

    #[test]
    fn test_shell_exit_127_is_plain_exit() {
        let mut session = spawn(&["-c", "exit 127"], LaunchOptions::default());
        let state = wait_terminal(&mut session);
        assert_eq!(state, SessionState::Exited(127));
        assert!(!state.is_startup_failure());
    }

    #[test]
    fn test_signaled_shell() {
        let mut session = spawn(&["-c", "kill -9 $$"], LaunchOptions::default());
        assert_eq!(
            wait_terminal(&mut session),
            SessionState::Failed(FailureReason::Signaled(Signal::SIGKILL))
        );
    }

    #[test]
    fn test_exec_failure() {
        let pair = allocate(24, 80).unwrap();
        let args: [&str; 0] = [];
        let mut session = launch(
            pair,
            "definitely-not-a-real-shell-binary",
            &args,
            LaunchOptions::default(),
        )
        .unwrap();

        let state = wait_terminal(&mut session);
        assert_eq!(
            state,
            SessionState::Failed(FailureReason::ExecFailed {
                errno: libc::ENOENT
            })
        );
        assert!(state.is_startup_failure());
        assert!(matches!(session.send(b"ls"), Err(IoError::ChannelClosed)));
    }

    #[test]
    fn test_blocking_mode() {
        let options = LaunchOptions::default().with_io_mode(IoMode::Blocking);
        let mut session = spawn(&["-c", "printf hello"], options);
        assert_eq!(session.io_mode(), IoMode::Blocking);

        let output = read_until(&mut session, "hello");
        assert!(output.contains("hello"), "output was {output:?}");
    }

    #[test]
    fn test_residual_output_kept() {
        let mut session = spawn(&["-c", "printf residual-data"], LaunchOptions::default());
        wait_terminal(&mut session);

        let residual = String::from_utf8(session.take_residual_output()).unwrap();
        assert!(residual.contains("residual-data"), "residual was {residual:?}");
        assert!(session.take_residual_output().is_empty());
    }

    #[test]
    fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let name = canonical
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let options = LaunchOptions::default().with_working_dir(&canonical);
        let mut session = spawn(&["-c", "pwd"], options);

        let output = read_until(&mut session, &name);
        assert!(output.contains(&name), "output was {output:?}");
    }

    #[test]
    fn test_send_to_exited_shell_is_closed() {
        let mut session = spawn(&["-c", "exit 0"], LaunchOptions::default());
        std::thread::sleep(Duration::from_millis(300));

        assert!(matches!(session.send(b"echo hi"), Err(IoError::ChannelClosed)));
        assert_eq!(session.state(), SessionState::Exited(0));
        assert!(matches!(session.send(b"echo hi"), Err(IoError::ChannelClosed)));
        assert!(matches!(session.window_size(), Err(IoError::ChannelClosed)));
    }

    #[test]
    fn test_idle_receive_would_block() {
        let mut session = spawn(&["-c", "read line"], LaunchOptions::default());
        std::thread::sleep(Duration::from_millis(100));

        let err = session.receive(DEFAULT_READ_CHUNK).unwrap_err();
        assert!(matches!(err, IoError::WouldBlock));
        assert!(err.is_retryable());
        assert!(session.is_running());
    }

    #[test]
    fn test_write_times_out_when_shell_stops_reading() {
        let options = LaunchOptions::default().with_write_timeout(Duration::from_millis(200));
        let mut session = spawn(&["-c", "stty raw -echo; echo ready; sleep 5"], options);
        let output = read_until(&mut session, "ready");
        assert!(output.contains("ready"));

        // Far more than the kernel buffers for a terminal nobody reads
        let payload = b"xxxxxxxxxxxxxxx\n".repeat(256 * 1024);
        match session.send(&payload) {
            Err(IoError::WriteFailed(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected a timed out write, got {other:?}"),
        }
        assert!(session.is_running());
    }

    #[test]
    fn test_terminate_without_permission_hangs_up() {
        let mut session = spawn_shell();
        session.send_signal = |_, _| Err(Errno::EPERM);
        let pid = session.pid();

        // Closing the master hangs up the terminal, which ends the shell
        session.terminate().unwrap();

        assert!(session.master.is_none());
        assert!(session.state().is_terminal());
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_terminate_without_permission_reports_failure() {
        let options = LaunchOptions::default().with_terminate_grace(Duration::from_millis(100));
        let mut session = spawn(
            &["-c", "trap '' HUP; echo ready; while :; do sleep 1; done"],
            options,
        );
        let output = read_until(&mut session, "ready");
        assert!(output.contains("ready"));
        session.send_signal = |_, _| Err(Errno::EPERM);

        assert!(matches!(
            session.terminate(),
            Err(IoError::TerminateFailed(Errno::EPERM))
        ));
        assert!(session.master.is_none());
        assert!(matches!(session.send(b"ls"), Err(IoError::ChannelClosed)));

        kill(session.pid(), Signal::SIGKILL).unwrap();
        assert_eq!(
            wait_terminal(&mut session),
            SessionState::Failed(FailureReason::Terminated(Signal::SIGKILL))
        );
    }

    #[test]
    fn test_drop_terminates_shell() {
        let session = spawn_shell();
        let pid = session.pid();
        drop(session);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }
}
