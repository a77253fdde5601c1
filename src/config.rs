//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/webhook-gateway/gateway.toml`.
//!
//! Every field has a default, so a missing config file still yields a
//! runnable config (the caller decides whether a missing file is fatal).
//!
//! # Required fields (when a file is present)
//! - `schema_version = 1`
//!
//! # Token file format
//! Raw access token on a single line; trimmed on read. The profile API
//! side-call is disabled when no token file is configured.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub buffer: BufferConfig,
    pub conversations: ConversationConfig,
    pub sessions: SessionConfig,
    /// The profile-API bearer token (read from the token file, not the path).
    /// `None` disables display-name resolution.
    pub profile_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Bind address for the webhook listener, e.g. `"0.0.0.0:8080"`.
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Debounce window after the first successful probe before the upstream
    /// is trusted as fully ready.
    pub grace_period_ms: u64,
    /// If the gateway itself has been up longer than this when the upstream
    /// first responds, the upstream is assumed warm and the grace is skipped.
    pub fresh_threshold_ms: u64,
    pub forward_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub dir: String,
    pub replay_interval_ms: u64,
    /// 5xx rejections tolerated per buffered file before it is moved to the
    /// dead-letter directory. `0` disables quarantine entirely.
    pub max_replay_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub dir: String,
    /// Display name recorded as `user` on outbound conversation records.
    pub agent_name: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the upstream-maintained session descriptor JSON.
    pub descriptor: String,
    /// Prefix the upstream uses for session-file paths in the descriptor.
    pub path_prefix: String,
    /// Prefix of the gateway's mounted view of the same tree.
    pub mount_prefix: String,
    pub poll_interval_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    proxy: Option<RawProxyConfig>,
    upstream: Option<RawUpstreamConfig>,
    buffer: Option<RawBufferConfig>,
    conversations: Option<RawConversationConfig>,
    sessions: Option<RawSessionConfig>,
    auth: Option<RawAuthConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProxyConfig {
    bind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUpstreamConfig {
    host: Option<String>,
    port: Option<u16>,
    probe_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    fresh_threshold_ms: Option<u64>,
    forward_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBufferConfig {
    dir: Option<String>,
    replay_interval_ms: Option<u64>,
    max_replay_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConversationConfig {
    dir: Option<String>,
    agent_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSessionConfig {
    descriptor: Option<String>,
    path_prefix: Option<String>,
    mount_prefix: Option<String>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthConfig {
    profile_token_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/webhook-gateway/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/webhook-gateway/gateway.toml"))
}

/// The all-defaults config used when no config file exists.
pub fn default_config() -> GatewayConfig {
    resolve(RawConfig::default()).expect("default config is always valid")
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    resolve(raw)
}

fn resolve(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let proxy = {
        let p = raw.proxy.unwrap_or_default();
        ProxyConfig {
            bind: p.bind.unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
        }
    };

    let upstream = {
        let u = raw.upstream.unwrap_or_default();
        UpstreamConfig {
            host: u.host.unwrap_or_else(|| "agent".to_owned()),
            port: u.port.unwrap_or(18789),
            probe_interval_ms: u.probe_interval_ms.unwrap_or(3000),
            probe_timeout_ms: u.probe_timeout_ms.unwrap_or(3000),
            grace_period_ms: u.grace_period_ms.unwrap_or(60_000),
            fresh_threshold_ms: u.fresh_threshold_ms.unwrap_or(30_000),
            forward_timeout_ms: u.forward_timeout_ms.unwrap_or(10_000),
        }
    };

    let buffer = {
        let b = raw.buffer.unwrap_or_default();
        BufferConfig {
            dir: b.dir.unwrap_or_else(|| "/webhook_buffer".to_owned()),
            replay_interval_ms: b.replay_interval_ms.unwrap_or(5000),
            max_replay_attempts: b.max_replay_attempts.unwrap_or(20),
        }
    };

    let conversations = {
        let c = raw.conversations.unwrap_or_default();
        ConversationConfig {
            dir: c.dir.unwrap_or_else(|| "/shared/conversations".to_owned()),
            agent_name: c.agent_name.unwrap_or_else(|| "agent".to_owned()),
        }
    };

    let sessions = {
        let s = raw.sessions.unwrap_or_default();
        SessionConfig {
            descriptor: s
                .descriptor
                .unwrap_or_else(|| "/agent/agents/main/sessions/sessions.json".to_owned()),
            path_prefix: s
                .path_prefix
                .unwrap_or_else(|| "/home/agent/.agent/".to_owned()),
            mount_prefix: s.mount_prefix.unwrap_or_else(|| "/agent/".to_owned()),
            poll_interval_ms: s.poll_interval_ms.unwrap_or(3000),
        }
    };

    let profile_token = match raw.auth.unwrap_or_default().profile_token_file {
        Some(path) => Some(read_token_file(&path)?),
        None => None,
    };

    Ok(GatewayConfig {
        schema_version: 1,
        proxy,
        upstream,
        buffer,
        conversations,
        sessions,
        profile_token,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", path, e)))?;
    Ok(content.trim().to_owned())
}
