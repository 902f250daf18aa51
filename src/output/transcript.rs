//! Session transcript
//!
//! Bounded history of what went into and came out of a session. Can be saved
//! to and loaded from JSON.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum number of entries kept
pub const DEFAULT_TRANSCRIPT_LIMIT: usize = 1000;

/// Errors that can occur while saving or loading a transcript
#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Failed to access transcript file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse transcript: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for transcript persistence
pub type TranscriptResult<T> = Result<T, TranscriptError>;

/// Origin of a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Text sent to the shell
    Input,
    /// Text the shell printed
    Output,
    /// Lifecycle messages (started, exited, ...)
    Notice,
}

/// A single transcript line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl TranscriptEntry {
    pub fn new(kind: EntryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn default_limit() -> usize {
    DEFAULT_TRANSCRIPT_LIMIT
}

/// Bounded, ordered session history. The oldest entries are dropped first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default = "default_limit")]
    max_entries: usize,
    #[serde(default)]
    entries: VecDeque<TranscriptEntry>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_limit(DEFAULT_TRANSCRIPT_LIMIT)
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transcript holding at most `max_entries` (at least one).
    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn push_input(&mut self, text: impl Into<String>) {
        self.push(TranscriptEntry::new(EntryKind::Input, text));
    }

    /// Append shell output. Consecutive output is merged into one entry so
    /// that chunked reads do not eat the entry budget.
    pub fn push_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(last) = self.entries.back_mut() {
            if last.kind == EntryKind::Output {
                last.text.push_str(text);
                return;
            }
        }
        self.push(TranscriptEntry::new(EntryKind::Output, text));
    }

    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.push(TranscriptEntry::new(EntryKind::Notice, text));
    }

    fn push(&mut self, entry: TranscriptEntry) {
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &TranscriptEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Write the transcript as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> TranscriptResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn load(path: &Path) -> TranscriptResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut transcript: Transcript = serde_json::from_str(&content)?;
        transcript.max_entries = transcript.max_entries.max(1);
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_transcript() {
        let transcript = Transcript::default();
        assert!(transcript.is_empty());
        assert_eq!(transcript.max_entries(), DEFAULT_TRANSCRIPT_LIMIT);
    }

    #[test]
    fn test_output_merges() {
        let mut transcript = Transcript::new();
        transcript.push_input("ls");
        transcript.push_output("a.txt\r\n");
        transcript.push_output("b.txt\r\n");
        transcript.push_output("");
        transcript.push_notice("exited with code 0");

        let entries: Vec<_> = transcript.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::Input);
        assert_eq!(entries[1].kind, EntryKind::Output);
        assert_eq!(entries[1].text, "a.txt\r\nb.txt\r\n");
        assert_eq!(entries[2].kind, EntryKind::Notice);
    }

    #[test]
    fn test_limit_drops_oldest() {
        let mut transcript = Transcript::with_limit(2);
        transcript.push_input("one");
        transcript.push_input("two");
        transcript.push_input("three");

        let texts: Vec<_> = transcript.entries().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn test_zero_limit_keeps_one() {
        let mut transcript = Transcript::with_limit(0);
        transcript.push_input("a");
        transcript.push_input("b");
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut transcript = Transcript::new();
        transcript.push_input("echo hi");
        transcript.clear();
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("session.json");

        let mut transcript = Transcript::with_limit(50);
        transcript.push_input("echo $((40+2))");
        transcript.push_output("42\r\n");
        transcript.save(&path).unwrap();
        assert!(path.exists());

        let loaded = Transcript::load(&path).unwrap();
        assert_eq!(loaded, transcript);
        assert_eq!(loaded.max_entries(), 50);
    }

    #[test]
    fn test_entry_kind_serialization() {
        let entry = TranscriptEntry {
            kind: EntryKind::Notice,
            text: "started".to_string(),
            timestamp_ms: 1,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""kind":"notice""#));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "not json {{{").unwrap();

        assert!(matches!(
            Transcript::load(&path),
            Err(TranscriptError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = Transcript::load(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(TranscriptError::Io(_))));
    }
}
