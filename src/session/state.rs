//! Session lifecycle states

use std::fmt;
use std::io;

use nix::sys::signal::Signal;

use crate::pty::LaunchError;

/// Why a session ended without a normal exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The child could not exec the shell.
    ExecFailed { errno: i32 },
    /// The child could not attach to the PTY before exec.
    SetupFailed { errno: i32 },
    /// The shell was killed by a signal nobody here sent.
    Signaled(Signal),
    /// The shell was killed at our request.
    Terminated(Signal),
    /// The pid was already reaped elsewhere; the real status is unknown.
    Lost,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ExecFailed { errno } => {
                write!(f, "exec failed: {}", io::Error::from_raw_os_error(*errno))
            }
            FailureReason::SetupFailed { errno } => {
                write!(f, "setup failed: {}", io::Error::from_raw_os_error(*errno))
            }
            FailureReason::Signaled(signal) => write!(f, "killed by {}", signal.as_str()),
            FailureReason::Terminated(signal) => write!(f, "terminated with {}", signal.as_str()),
            FailureReason::Lost => write!(f, "exit status lost"),
        }
    }
}

/// Lifecycle state of a session.
///
/// `Starting -> Running -> Exited | Failed`. Terminal states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exited(i32),
    Failed(FailureReason),
}

impl SessionState {
    /// Starting or running
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }

    /// Exit code of a normal exit
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionState::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// The shell never got to run.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            SessionState::Failed(FailureReason::ExecFailed { .. })
                | SessionState::Failed(FailureReason::SetupFailed { .. })
        )
    }

    /// Startup failure as a [`LaunchError`], for callers that report exec
    /// failure alongside synchronous launch errors.
    pub fn launch_error(&self) -> Option<LaunchError> {
        match self {
            SessionState::Failed(FailureReason::ExecFailed { errno }) => {
                Some(LaunchError::ExecFailed { errno: *errno })
            }
            SessionState::Failed(FailureReason::SetupFailed { errno }) => {
                Some(LaunchError::SetupFailed { errno: *errno })
            }
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Exited(code) => write!(f, "exited with code {code}"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
