//! Session log tailing.
//!
//! The upstream appends every turn to per-session JSONL files. The watcher
//! polls the descriptor, tracks a byte offset per file, and lifts newly
//! appended assistant replies into the conversation log. Detection logic is
//! pure (`TailCursor`, [`extract_outbound_messages`]) so the transition rules
//! are unit-testable without touching the filesystem.
//!
//! A freshly discovered file is baselined at its current size without
//! emitting anything: history that predates the gateway belongs to a previous
//! run and was either already logged or deliberately skipped.

use crate::classify;
use crate::config::SessionConfig;
use crate::conversation::{ConversationLog, ConversationRecord, Direction};
use crate::sessions::{self, SessionSource};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// What one size observation means for a tailed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStep {
    NoChange,
    /// The file shrank; it was rewritten, start over from its new end.
    Truncated,
    /// New bytes appeared at `[from, from + len)`.
    Grew { from: u64, len: u64 },
}

/// Byte offset into one session file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailCursor {
    offset: u64,
}

impl TailCursor {
    /// Start at the current end of the file.
    pub fn baseline(size: u64) -> Self {
        Self { offset: size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Advance past `size` and classify what happened since the last look.
    ///
    /// Only a strict shrink resets the baseline; an equal size is idle, and
    /// any growth is new content even if a rewrite happened to land larger.
    pub fn observe(&mut self, size: u64) -> TailStep {
        if size < self.offset {
            self.offset = size;
            TailStep::Truncated
        } else if size == self.offset {
            TailStep::NoChange
        } else {
            let from = self.offset;
            self.offset = size;
            TailStep::Grew {
                from,
                len: size - from,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound extraction
// ---------------------------------------------------------------------------

/// One assistant reply lifted out of a session delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub timestamp: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct SessionLine {
    timestamp: Option<String>,
    message: Option<SessionMessage>,
}

#[derive(Debug, Deserialize)]
struct SessionMessage {
    role: Option<String>,
    #[serde(rename = "stopReason")]
    stop_reason: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

/// Pull completed assistant replies out of appended session lines.
///
/// Keeps lines with role `assistant` and stop reason `stop` whose timestamp
/// is strictly newer than `after_timestamp` (ISO-8601 strings compare
/// correctly as text). Text parts are joined with newlines; tool-only turns
/// and heartbeat chatter produce nothing.
pub fn extract_outbound_messages(delta: &str, after_timestamp: &str) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    for line in delta.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Partial trailing lines and foreign entries are expected; skip them.
        let Ok(entry) = serde_json::from_str::<SessionLine>(line) else {
            continue;
        };
        let Some(timestamp) = entry.timestamp else {
            continue;
        };
        if timestamp.as_str() <= after_timestamp {
            continue;
        }
        let Some(message) = entry.message else {
            continue;
        };
        if message.role.as_deref() != Some("assistant")
            || message.stop_reason.as_deref() != Some("stop")
        {
            continue;
        }
        let text = message
            .content
            .iter()
            .filter(|part| part.kind.as_deref() == Some("text"))
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let text = text.trim();
        if text.is_empty() || classify::is_heartbeat_system_response(text) {
            continue;
        }
        messages.push(OutboundMessage {
            timestamp,
            content: text.to_owned(),
        });
    }
    messages
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

struct WatchedSession {
    cursor: TailCursor,
    platform: String,
    channel: String,
}

/// Polls session files and appends outbound records to the conversation log.
pub struct SessionTailWatcher {
    config: SessionConfig,
    agent_name: String,
    log: Arc<ConversationLog>,
    watched: HashMap<PathBuf, WatchedSession>,
    /// Newest outbound timestamp already logged, per platform.
    last_outbound: HashMap<String, String>,
}

impl SessionTailWatcher {
    pub fn new(
        config: SessionConfig,
        agent_name: String,
        log: Arc<ConversationLog>,
        last_outbound: HashMap<String, String>,
    ) -> Self {
        Self {
            config,
            agent_name,
            log,
            watched: HashMap::new(),
            last_outbound,
        }
    }

    /// One poll tick over every discovered session.
    pub fn poll_once(&mut self) {
        let sources = sessions::discover(
            std::path::Path::new(&self.config.descriptor),
            &self.config.path_prefix,
            &self.config.mount_prefix,
        );
        for source in sources {
            self.poll_session(&source);
        }
    }

    fn poll_session(&mut self, source: &SessionSource) {
        // Sessions can be listed before their log exists; stay quiet until
        // the file shows up.
        let Ok(meta) = std::fs::metadata(&source.local_path) else {
            return;
        };
        let size = meta.len();

        let Some(watched) = self.watched.get_mut(&source.local_path) else {
            info!(
                path = %source.local_path.display(),
                platform = %source.platform,
                channel = %source.channel,
                "tailing session log"
            );
            self.watched.insert(
                source.local_path.clone(),
                WatchedSession {
                    cursor: TailCursor::baseline(size),
                    platform: source.platform.clone(),
                    channel: source.channel.clone(),
                },
            );
            return;
        };

        match watched.cursor.observe(size) {
            TailStep::NoChange => {}
            TailStep::Truncated => {
                debug!(path = %source.local_path.display(), "session log rewritten, re-baselining");
            }
            TailStep::Grew { from, len } => {
                let delta = match read_range(&source.local_path, from, len) {
                    Ok(delta) => delta,
                    Err(err) => {
                        warn!(path = %source.local_path.display(), error = %err, "session read failed");
                        return;
                    }
                };
                let platform = watched.platform.clone();
                let channel = watched.channel.clone();
                let after = self
                    .last_outbound
                    .get(&platform)
                    .cloned()
                    .unwrap_or_default();
                for message in extract_outbound_messages(&delta, &after) {
                    let record = ConversationRecord {
                        timestamp: normalize_timestamp(&message.timestamp),
                        platform: platform.clone(),
                        direction: Direction::Outbound,
                        channel: channel.clone(),
                        user: self.agent_name.clone(),
                        emotion_hint: Some(
                            classify::estimate_outbound_emotion(&message.content).to_owned(),
                        ),
                        content: message.content,
                    };
                    if let Err(err) = self.log.append(&record) {
                        warn!(platform = %platform, error = %err, "conversation append failed");
                        continue;
                    }
                    self.last_outbound.insert(platform.clone(), message.timestamp.clone());
                }
            }
        }
    }
}

fn read_range(path: &std::path::Path, from: u64, len: u64) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Re-serialize a session timestamp in UTC with millisecond precision, or
/// pass it through untouched when it is not RFC 3339.
fn normalize_timestamp(timestamp: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(timestamp) {
        Ok(ts) => ts
            .with_timezone(&chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        Err(_) => timestamp.to_owned(),
    }
}

/// Poll loop driving a [`SessionTailWatcher`] until shutdown.
pub async fn run_tail_watcher(
    mut watcher: SessionTailWatcher,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => watcher.poll_once(),
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("session tail watcher stopping");
                    return;
                }
            }
        }
    }
}
