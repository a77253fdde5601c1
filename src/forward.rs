//! Single-shot verbatim proxying to the fixed upstream.
//!
//! One HTTP call per request, bounded by a timeout. Callers classify the
//! result: a transport error or a status ≥ 500 means the upstream could not
//! take the request and it must be buffered; anything else (including 4xx)
//! is a completed delivery.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Upstream response to a proxied request.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ForwardResponse {
    /// True when this delivery failed in the "upstream cannot take traffic"
    /// sense and the request belongs in the buffer.
    pub fn requires_buffering(&self) -> bool {
        self.status >= 500
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid method '{0}'")]
    Method(String),
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Headers owned by the transport, recomputed on the upstream leg instead of
/// copied from the inbound request.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

/// Proxies requests verbatim to one fixed `host:port`.
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    host_header: String,
}

impl Forwarder {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Forwarder {
            client,
            base_url: format!("http://{host}:{port}"),
            host_header: format!("{host}:{port}"),
        })
    }

    /// Proxy one request. `url` is the inbound path-and-query.
    pub async fn forward(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<&[u8]>,
    ) -> Result<ForwardResponse, ForwardError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ForwardError::Method(method.to_owned()))?;
        let target = if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        };

        let mut request = self
            .client
            .request(method, target)
            .header(reqwest::header::HOST, &self.host_header);

        for (name, value) in headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            // A malformed stored header must not poison the whole request.
            let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            let Ok(value) = reqwest::header::HeaderValue::from_str(value) else {
                continue;
            };
            request = request.header(name, value);
        }

        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(ForwardResponse { status, body })
    }
}
