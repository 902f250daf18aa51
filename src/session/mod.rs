//! Shell session management module
//!
//! A [`Session`] is one shell on one PTY. The [`SessionManager`] keeps any
//! number of them behind opaque handles for async callers.

mod channel;
mod manager;
mod state;

pub use channel::*;
pub use manager::*;
pub use state::*;
