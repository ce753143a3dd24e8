//! Async HTTP client wrapping reqwest.
//!
//! Sends one POST per call with the portal's browser user-agent. Unlike a
//! general-purpose client it never retries on its own; the engine owns the
//! retry policy and needs to see every failure.

use std::time::Duration;

use async_trait::async_trait;

use super::{HttpCapability, HttpRequest, HttpResponse, RequestBody, TransportError};

/// Browser user-agent the elective portal expects.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                              AppleWebKit/537.36 (KHTML, like Gecko) \
                              Chrome/120.0.0.0 Safari/537.36";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// reqwest-backed [`HttpCapability`] for the elective portal.
#[derive(Clone)]
pub struct PortalHttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl PortalHttpClient {
    /// Create a client with the portal user-agent and the given timeout.
    pub fn new(timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();

        Self { client, timeout }
    }
}

impl Default for PortalHttpClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MS)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl HttpCapability for PortalHttpClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(&request.url).timeout(self.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let r = builder.send().await.map_err(classify_reqwest_error)?;
        let status = r.status().as_u16();
        tracing::debug!(url = %request.url, status, "portal response");

        // A body that dies mid-stream is still a transport failure.
        let body = r.text().await.map_err(classify_reqwest_error)?;

        Ok(HttpResponse { status, body })
    }
}
