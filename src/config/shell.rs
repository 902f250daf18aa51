//! Shell configuration
//!
//! Loads shell settings and presets from .ptyshell/config.toml

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CONFIG_DIR, CONFIG_FILE};
use crate::output::DEFAULT_TRANSCRIPT_LIMIT;
use crate::pty::{LaunchOptions, WindowSize, DEFAULT_COLS, DEFAULT_ROWS};
use crate::session::{IoMode, ShellCommand, DEFAULT_READ_CHUNK};

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unknown signal name: {0}")]
    InvalidSignal(String),
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),
    #[error("Invalid window geometry {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },
}

/// Named shell preset, e.g. a plain shell or a root shell through `su`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellPreset {
    /// Name of the preset
    pub name: String,
    /// Program to run
    pub shell: String,
    /// Arguments after the program name
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the shell
    pub working_dir: Option<PathBuf>,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

fn default_terminate_grace_ms() -> u64 {
    500
}

fn default_terminate_signal() -> String {
    "SIGHUP".to_string()
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_read_chunk() -> usize {
    DEFAULT_READ_CHUNK
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_transcript_limit() -> usize {
    DEFAULT_TRANSCRIPT_LIMIT
}

/// Shell configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Shell used when no preset applies
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Terminal rows
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Terminal columns
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default)]
    pub io_mode: IoMode,
    /// Appended to every line of input
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Signal name such as "SIGHUP" or "SIGTERM"
    #[serde(default = "default_terminate_signal")]
    pub terminate_signal: String,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Output pump interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_transcript_limit")]
    pub transcript_limit: usize,
    /// Default preset name
    pub default_preset: Option<String>,
    /// Shell presets
    #[serde(default)]
    pub presets: Vec<ShellPreset>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            args: Vec::new(),
            working_dir: None,
            rows: default_rows(),
            cols: default_cols(),
            io_mode: IoMode::default(),
            line_terminator: default_line_terminator(),
            terminate_grace_ms: default_terminate_grace_ms(),
            terminate_signal: default_terminate_signal(),
            write_timeout_ms: default_write_timeout_ms(),
            read_chunk: default_read_chunk(),
            poll_interval_ms: default_poll_interval_ms(),
            transcript_limit: default_transcript_limit(),
            default_preset: None,
            presets: Vec::new(),
        }
    }
}

impl ShellConfig {
    /// Load configuration from a directory's .ptyshell/config.toml
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_file(&config_path)
    }

    /// Load configuration from an explicit file
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ShellConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Get a preset by name
    pub fn get_preset(&self, name: &str) -> Option<&ShellPreset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Get the default preset
    pub fn default_preset(&self) -> Option<&ShellPreset> {
        self.default_preset
            .as_ref()
            .and_then(|name| self.get_preset(name))
    }

    /// Command for `preset`, else the default preset, else the top-level shell.
    pub fn command(&self, preset: Option<&str>) -> Result<ShellCommand, ConfigError> {
        let preset = match preset {
            Some(name) => Some(
                self.get_preset(name)
                    .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))?,
            ),
            None => self.default_preset(),
        };

        let mut command = match preset {
            Some(preset) => {
                ShellCommand::new(&preset.shell).with_args(preset.args.iter().cloned())
            }
            None => ShellCommand::new(&self.shell).with_args(self.args.iter().cloned()),
        };
        command.working_dir = preset
            .and_then(|p| p.working_dir.clone())
            .or_else(|| self.working_dir.clone());
        Ok(command)
    }

    pub fn window_size(&self) -> Result<WindowSize, ConfigError> {
        let size = WindowSize::new(self.rows, self.cols);
        if !size.is_valid() {
            return Err(ConfigError::InvalidGeometry {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(size)
    }

    pub fn launch_options(&self) -> Result<LaunchOptions, ConfigError> {
        let signal = Signal::from_str(&self.terminate_signal)
            .map_err(|_| ConfigError::InvalidSignal(self.terminate_signal.clone()))?;

        Ok(LaunchOptions::default()
            .with_io_mode(self.io_mode)
            .with_line_terminator(self.line_terminator.as_bytes())
            .with_terminate_signal(signal)
            .with_terminate_grace(Duration::from_millis(self.terminate_grace_ms))
            .with_write_timeout(Duration::from_millis(self.write_timeout_ms)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
