//! HTTP surface.
//!
//! Two behaviors share one router:
//!
//! - `GET /health` reports upstream phase, buffered backlog and gateway
//!   uptime; the status code doubles as a readiness signal.
//! - Everything else is a webhook: acknowledged with `200 {}` immediately,
//!   then delivered (or buffered) on a detached task. The platform retries
//!   and eventually disables endpoints that answer slowly or with errors, so
//!   the acknowledgment must never wait on the upstream.

use crate::buffer::{BufferStore, BufferedRequest};
use crate::conversation::ConversationLog;
use crate::forward::Forwarder;
use crate::line_inbound::{self, ProfileResolver};
use crate::upstream::UpstreamMonitor;
use axum::body::{to_bytes, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything the handlers need, shared across requests.
pub struct Gateway {
    pub monitor: Arc<UpstreamMonitor>,
    pub store: Arc<BufferStore>,
    pub forwarder: Arc<Forwarder>,
    pub conversation: Arc<ConversationLog>,
    pub profiles: Arc<ProfileResolver>,
    pub started_at: Instant,
}

pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        // Non-GET /health is still webhook traffic.
        .route("/health", get(health).fallback(acknowledge))
        .fallback(acknowledge)
        .with_state(gateway)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let phase = gateway.monitor.phase().await;
    let status = if phase == crate::upstream::UpstreamPhase::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "upstreamState": phase.as_str(),
        "buffered": gateway.store.count(),
        "uptimeSeconds": gateway.started_at.elapsed().as_secs(),
    });
    (status, Json(body))
}

/// Ack-first webhook handler.
async fn acknowledge(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
) -> impl IntoResponse {
    let method = request.method().to_string();
    let url = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_owned(), ToString::to_string);
    let headers: BTreeMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();

    // Webhook bodies are small; reading before the ack keeps capture simple
    // and still answers in single-digit milliseconds.
    let body = to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    tokio::spawn(deliver(gateway, method, url, headers, body));
    (StatusCode::OK, Json(serde_json::json!({})))
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

async fn deliver(
    gateway: Arc<Gateway>,
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: Bytes,
) {
    // Conversation logging is a side channel; it must not delay delivery.
    {
        let gateway = gateway.clone();
        let body = body.clone();
        tokio::spawn(async move {
            line_inbound::log_inbound(&body, &gateway.conversation, &gateway.profiles).await;
        });
    }

    if !gateway.monitor.is_ready().await {
        let phase = gateway.monitor.phase().await;
        info!(%method, %url, phase = phase.as_str(), "upstream not ready, buffering");
        buffer_request(&gateway, &method, &url, &headers, &body);
        return;
    }

    match gateway
        .forwarder
        .forward(&method, &url, &headers, Some(&body))
        .await
    {
        Ok(response) if !response.requires_buffering() => {
            info!(%method, %url, status = response.status, "proxied");
        }
        Ok(response) => {
            warn!(%method, %url, status = response.status, "upstream rejected request, buffering");
            buffer_request(&gateway, &method, &url, &headers, &body);
        }
        Err(err) => {
            warn!(%method, %url, error = %err, "upstream unreachable, buffering");
            buffer_request(&gateway, &method, &url, &headers, &body);
        }
    }
}

fn buffer_request(
    gateway: &Gateway,
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) {
    let request = BufferedRequest::capture(method, url, headers.clone(), body);
    match gateway.store.enqueue(&request) {
        Ok(file) => info!(%method, %url, file, "request buffered"),
        // The request is lost; nothing below the buffer can hold it.
        Err(err) => warn!(%method, %url, error = %err, "buffering failed, request dropped"),
    }
}
