//! Per-platform conversation log.
//!
//! Every message crossing the gateway — inbound webhooks and outbound
//! assistant replies lifted from session tails — is appended as one JSON line
//! to `{dir}/{platform}.jsonl`. The log is the durable record other tooling
//! reads, so appends never reorder and the outbound watcher recovers its
//! position from the newest outbound line after a restart.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One logged message.
///
/// `emotion_hint` is only estimated for outbound text and serializes as
/// `null` when absent so every line carries the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub timestamp: String,
    pub platform: String,
    pub direction: Direction,
    pub channel: String,
    pub user: String,
    pub content: String,
    pub emotion_hint: Option<String>,
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("conversation log I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("conversation record encode: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    dir: PathBuf,
}

impl ConversationLog {
    /// Open the log directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn platform_file(&self, platform: &str) -> PathBuf {
        self.dir.join(format!("{platform}.jsonl"))
    }

    /// Append one record to its platform's file.
    pub fn append(&self, record: &ConversationRecord) -> Result<(), LogError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.platform_file(&record.platform))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Timestamp of the newest outbound record for `platform`, if any.
    ///
    /// Used at startup so a restart does not re-emit outbound messages that
    /// were already logged. Unparseable lines are skipped rather than fatal;
    /// the file is shared with external readers and writers over its lifetime.
    pub fn last_outbound_timestamp(&self, platform: &str) -> Option<String> {
        let content = std::fs::read_to_string(self.platform_file(platform)).ok()?;
        content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<ConversationRecord>(line).ok())
            .find(|record| record.direction == Direction::Outbound)
            .map(|record| record.timestamp)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
