//! Configuration module
//!
//! Handles loading shell settings and presets.

mod shell;

pub use shell::*;

/// Configuration directory and file names
pub const CONFIG_DIR: &str = ".ptyshell";
pub const CONFIG_FILE: &str = "config.toml";
