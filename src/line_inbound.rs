//! Inbound webhook logging.
//!
//! Webhook bodies that look like messaging-platform event batches are mirrored
//! into the conversation log. This is a side channel off the proxy path: it
//! runs after the client was already acknowledged, and every failure here is
//! logged and swallowed so a malformed payload can never affect delivery.

use crate::conversation::{ConversationLog, ConversationRecord, Direction};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PROFILE_API_BASE: &str = "https://api.line.me/v2/bot/profile";
const PROFILE_TIMEOUT: Duration = Duration::from_secs(5);
const PROFILE_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Webhook payload (platform-owned schema, everything optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    /// Epoch milliseconds.
    timestamp: Option<i64>,
    message: Option<EventMessage>,
    source: Option<EventSource>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    #[serde(rename = "fileName")]
    file_name: Option<String>,
    title: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSource {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "groupId")]
    group_id: Option<String>,
    #[serde(rename = "roomId")]
    room_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Content and channel extraction
// ---------------------------------------------------------------------------

/// Render a message event as loggable text.
///
/// Non-text messages become bracketed placeholders so the log still shows
/// that something arrived, including kinds this gateway has never seen.
fn extract_content(message: &EventMessage) -> Option<String> {
    match message.kind.as_deref() {
        Some("text") => message.text.clone(),
        Some("image") => Some("[画像]".to_owned()),
        Some("video") => Some("[動画]".to_owned()),
        Some("audio") => Some("[音声]".to_owned()),
        Some("file") => Some(format!(
            "[ファイル: {}]",
            message.file_name.as_deref().unwrap_or("unknown")
        )),
        Some("location") => Some(format!(
            "[位置情報: {}]",
            message
                .title
                .as_deref()
                .or(message.address.as_deref())
                .unwrap_or("unknown")
        )),
        Some("sticker") => Some("[スタンプ]".to_owned()),
        Some(other) => Some(format!("[{other}]")),
        None => None,
    }
}

/// Short channel name for an event source, mirroring the outbound naming.
fn extract_channel(source: Option<&EventSource>) -> String {
    let Some(source) = source else {
        return "dm".to_owned();
    };
    if let Some(group_id) = source.group_id.as_deref() {
        format!("group_{}", last_chars(group_id, 8))
    } else if let Some(room_id) = source.room_id.as_deref() {
        format!("room_{}", last_chars(room_id, 8))
    } else if let Some(user_id) = source.user_id.as_deref() {
        format!("dm_{}", last_chars(user_id, 8))
    } else {
        "dm".to_owned()
    }
}

fn last_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

fn event_timestamp(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Profile resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(rename = "displayName")]
    display_name: String,
}

/// Resolves sender display names, with a long-lived in-memory cache.
///
/// Display names change rarely and the profile API is rate limited, so
/// entries live for a day. Without a token every lookup short-circuits and
/// records fall back to the truncated user id.
pub struct ProfileResolver {
    client: reqwest::Client,
    token: Option<String>,
    cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl ProfileResolver {
    pub fn new(token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(PROFILE_TIMEOUT).build()?;
        Ok(Self {
            client,
            token,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Display name for `user_id`, or `None` when it cannot be resolved.
    pub async fn display_name(&self, user_id: &str) -> Option<String> {
        let token = self.token.as_deref()?;

        {
            let cache = self.cache.lock().await;
            if let Some((name, fetched_at)) = cache.get(user_id) {
                if fetched_at.elapsed() < PROFILE_CACHE_TTL {
                    return Some(name.clone());
                }
            }
        }

        let url = format!("{PROFILE_API_BASE}/{user_id}");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let profile: ProfileResponse = match response {
            Ok(response) => match response.json().await {
                Ok(profile) => profile,
                Err(err) => {
                    debug!(user_id, error = %err, "profile decode failed");
                    return None;
                }
            },
            Err(err) => {
                debug!(user_id, error = %err, "profile lookup failed");
                return None;
            }
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            user_id.to_owned(),
            (profile.display_name.clone(), Instant::now()),
        );
        Some(profile.display_name)
    }
}

// ---------------------------------------------------------------------------
// Logging entry point
// ---------------------------------------------------------------------------

/// Mirror a webhook body into the conversation log.
///
/// Bodies that are not event batches are ignored; append failures are logged
/// and dropped. The proxy path never waits on this.
pub async fn log_inbound(body: &[u8], log: &ConversationLog, profiles: &ProfileResolver) {
    let Ok(payload) = serde_json::from_slice::<WebhookPayload>(body) else {
        return;
    };
    for event in &payload.events {
        if event.kind.as_deref() != Some("message") {
            continue;
        }
        let Some(content) = event.message.as_ref().and_then(extract_content) else {
            continue;
        };

        let user_id = event
            .source
            .as_ref()
            .and_then(|source| source.user_id.as_deref());
        let user = match user_id {
            Some(id) => profiles
                .display_name(id)
                .await
                .unwrap_or_else(|| last_chars(id, 8).to_owned()),
            None => "unknown".to_owned(),
        };

        let record = ConversationRecord {
            timestamp: event_timestamp(event.timestamp),
            platform: "line".to_owned(),
            direction: Direction::Inbound,
            channel: extract_channel(event.source.as_ref()),
            user,
            content,
            emotion_hint: None,
        };
        if let Err(err) = log.append(&record) {
            warn!(error = %err, "inbound conversation append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(message: serde_json::Value, source: serde_json::Value) -> Vec<u8> {
        serde_json::json!({
            "events": [{
                "type": "message",
                "timestamp": 1_767_225_600_000_i64,
                "message": message,
                "source": source
            }]
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn logs_text_messages_with_truncated_user_fallback() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = ConversationLog::open(tmp.path()).expect("open");
        let profiles = ProfileResolver::new(None).expect("build resolver");

        let body = message_event(
            serde_json::json!({"type": "text", "text": "おはよう"}),
            serde_json::json!({"userId": "U1234567890abcdef"}),
        );
        log_inbound(&body, &log, &profiles).await;

        let content = std::fs::read_to_string(tmp.path().join("line.jsonl")).expect("read");
        let record: ConversationRecord =
            serde_json::from_str(content.lines().next().expect("line")).expect("decode");
        assert_eq!(record.direction, Direction::Inbound);
        assert_eq!(record.content, "おはよう");
        assert_eq!(record.user, "90abcdef");
        assert_eq!(record.channel, "dm_90abcdef");
        assert_eq!(record.timestamp, "2026-01-01T00:00:00.000Z");
        assert_eq!(record.emotion_hint, None);
    }

    #[tokio::test]
    async fn renders_media_placeholders_and_group_channels() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = ConversationLog::open(tmp.path()).expect("open");
        let profiles = ProfileResolver::new(None).expect("build resolver");

        let body = message_event(
            serde_json::json!({"type": "file", "fileName": "report.pdf"}),
            serde_json::json!({"userId": "U1", "groupId": "Cabcdef1234567890"}),
        );
        log_inbound(&body, &log, &profiles).await;

        let content = std::fs::read_to_string(tmp.path().join("line.jsonl")).expect("read");
        let record: ConversationRecord =
            serde_json::from_str(content.lines().next().expect("line")).expect("decode");
        assert_eq!(record.content, "[ファイル: report.pdf]");
        assert_eq!(record.channel, "group_34567890");
    }

    #[tokio::test]
    async fn ignores_non_event_bodies() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = ConversationLog::open(tmp.path()).expect("open");
        let profiles = ProfileResolver::new(None).expect("build resolver");

        log_inbound(b"not json", &log, &profiles).await;
        log_inbound(br#"{"hello": "world"}"#, &log, &profiles).await;

        assert!(!tmp.path().join("line.jsonl").exists());
    }

    #[tokio::test]
    async fn unrecognized_message_kinds_still_leave_a_trace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = ConversationLog::open(tmp.path()).expect("open");
        let profiles = ProfileResolver::new(None).expect("build resolver");

        let body = message_event(
            serde_json::json!({"type": "hologram"}),
            serde_json::json!({"userId": "U1"}),
        );
        log_inbound(&body, &log, &profiles).await;

        let content = std::fs::read_to_string(tmp.path().join("line.jsonl")).expect("read");
        let record: ConversationRecord =
            serde_json::from_str(content.lines().next().expect("line")).expect("decode");
        assert_eq!(record.content, "[hologram]");
    }

    #[tokio::test]
    async fn tokenless_resolver_short_circuits_lookups() {
        let profiles = ProfileResolver::new(None).expect("build resolver");
        assert_eq!(profiles.display_name("U1234567890abcdef").await, None);
    }
}
