//! Webhook gateway between a messaging platform and a restart-prone upstream.
//!
//! The gateway acknowledges every webhook instantly, proxies it when the
//! upstream is ready, and otherwise journals it to disk for in-order replay
//! once the upstream has warmed up. On the side it mirrors traffic into
//! per-platform conversation logs, tailing the upstream's session files for
//! the outbound half.
//!
//! Modules:
//! - [`config`]: TOML configuration with defaults for every field.
//! - [`upstream`]: readiness probing and the phase state machine.
//! - [`buffer`]: the durable request journal, one file per request.
//! - [`forward`]: HTTP re-issue of live and buffered requests.
//! - [`replay`]: oldest-first drain of the journal.
//! - [`proxy_http`]: the ack-first webhook surface and `/health`.
//! - [`sessions`], [`tail`], [`conversation`], [`line_inbound`],
//!   [`classify`]: the conversation-logging side channel.

pub mod buffer;
pub mod classify;
pub mod config;
pub mod conversation;
pub mod forward;
pub mod line_inbound;
pub mod proxy_http;
pub mod replay;
pub mod sessions;
pub mod tail;
pub mod upstream;
