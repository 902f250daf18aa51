//! PTY-backed interactive shell sessions
//!
//! Allocates pseudo-terminals, launches shells on them and tracks each
//! shell's lifecycle explicitly, from launch through exit or failure.
//!
//! - [`pty`]: PTY pair allocation and shell launch
//! - [`session`]: the per-shell I/O channel, its state machine and the async
//!   [`SessionManager`](session::SessionManager)
//! - [`output`]: UTF-8 reassembly and session transcripts
//! - [`config`]: TOML configuration and shell presets

#[cfg(not(unix))]
compile_error!("ptyshell requires a Unix platform");

pub mod config;
pub mod output;
pub mod pty;
pub mod session;

pub use config::{ConfigError, ShellConfig, ShellPreset};
pub use output::{Transcript, Utf8Decoder};
pub use pty::{allocate, launch, AllocError, LaunchError, LaunchOptions, PtyPair, WindowSize};
pub use session::{
    FailureReason, IoError, IoMode, ManagerError, Session, SessionEvent, SessionHandle,
    SessionManager, SessionState, ShellCommand, StartupError,
};
