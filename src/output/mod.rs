//! Output handling module
//!
//! Turns raw shell output into text and keeps a per-session transcript.

mod transcript;
mod utf8;

pub use transcript::*;
pub use utf8::*;
