//! PTY management module
//!
//! Allocates master/slave pairs and launches shells attached to them.
//! Uses nix and libc directly so the child side of the fork stays under our
//! control.

use std::sync::Mutex;

pub(crate) mod fd;
mod allocator;
mod launcher;

pub use allocator::*;
pub use launcher::*;

pub(crate) use launcher::{decode_child_report, CHILD_REPORT_LEN};

/// Held around every `fork`, and around any descriptor setup that cannot set
/// close-on-exec atomically, so a child never inherits another session's PTY.
pub(crate) static FORK_LOCK: Mutex<()> = Mutex::new(());
