//! Session descriptor discovery.
//!
//! The upstream maintains a JSON descriptor enumerating its active sessions;
//! each entry names the session's append-only log file and enough delivery
//! context to attribute that log to a platform and channel. Paths inside the
//! descriptor are upstream-internal and are remapped into the gateway's
//! mounted view before use.
//!
//! Parsing is pure; the only I/O is reading the descriptor file, and every
//! failure degrades to "no sessions" so the tail watcher keeps running.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One discovered session log to tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSource {
    /// Session log path in the gateway's mounted view.
    pub local_path: PathBuf,
    pub platform: String,
    pub channel: String,
}

// ---------------------------------------------------------------------------
// Descriptor schema (upstream-owned, all fields optional in practice)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DescriptorEntry {
    #[serde(rename = "sessionFile")]
    session_file: Option<String>,
    #[serde(rename = "deliveryContext")]
    delivery_context: Option<DeliveryContext>,
    origin: Option<Origin>,
    #[serde(rename = "lastChannel")]
    last_channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeliveryContext {
    channel: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Origin {
    provider: Option<String>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Read and parse the session descriptor.
///
/// A missing or malformed descriptor yields an empty list — the upstream owns
/// that file and may be mid-rewrite at any poll tick.
pub fn discover(descriptor: &Path, path_prefix: &str, mount_prefix: &str) -> Vec<SessionSource> {
    match std::fs::read_to_string(descriptor) {
        Ok(json) => parse_descriptor(&json, path_prefix, mount_prefix).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

/// Parse a descriptor document into tail targets.
pub fn parse_descriptor(
    json: &str,
    path_prefix: &str,
    mount_prefix: &str,
) -> Result<Vec<SessionSource>, serde_json::Error> {
    // BTreeMap keeps discovery order deterministic across polls.
    let entries: BTreeMap<String, DescriptorEntry> = serde_json::from_str(json)?;

    let mut sources = Vec::new();
    for entry in entries.into_values() {
        let Some(session_file) = entry.session_file else {
            continue;
        };
        let context = entry.delivery_context;
        let platform = context
            .as_ref()
            .and_then(|c| c.channel.clone())
            .or_else(|| entry.origin.and_then(|o| o.provider))
            .or(entry.last_channel);
        let Some(platform) = platform else {
            continue;
        };

        let to = context.and_then(|c| c.to).unwrap_or_default();
        sources.push(SessionSource {
            local_path: PathBuf::from(remap_session_path(
                &session_file,
                path_prefix,
                mount_prefix,
            )),
            channel: derive_channel(&platform, &to),
            platform,
        });
    }
    Ok(sources)
}

/// Rewrite an upstream-internal session path into the gateway's mount.
fn remap_session_path(path: &str, path_prefix: &str, mount_prefix: &str) -> String {
    match path.strip_prefix(path_prefix) {
        Some(rest) => format!("{mount_prefix}{rest}"),
        None => path.to_owned(),
    }
}

/// Derive a short channel name from the delivery target.
fn derive_channel(platform: &str, to: &str) -> String {
    let tail = to.rsplit(':').next().unwrap_or(to);
    if to.contains("group:") {
        format!("group_{}", last_chars(tail, 8))
    } else if platform == "line" && to.starts_with("line:U") {
        format!("dm_{}", last_chars(tail, 8))
    } else if platform == "discord" {
        format!("channel_{}", last_chars(tail, 8))
    } else {
        "dm".to_owned()
    }
}

/// The trailing `n` characters of `s` (identifiers here are ASCII, but don't
/// split a multi-byte char if one sneaks in).
fn last_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let (idx, _) = s.char_indices().nth(count - n).unwrap_or((0, ' '));
    &s[idx..]
}
