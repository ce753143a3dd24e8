//! HTTP capability consumed by the cascade and the registration client.
//!
//! The core never talks to reqwest directly: it issues [`HttpRequest`]s
//! through the [`HttpCapability`] trait and gets back a status plus body.
//! [`http_client::PortalHttpClient`] is the production implementation;
//! tests substitute scripted doubles.

pub mod http_client;

use async_trait::async_trait;
use serde_json::Value;

pub use http_client::PortalHttpClient;

/// Body of an outgoing request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` fields, in order.
    Form(Vec<(String, String)>),
    /// `application/json` payload.
    Json(Value),
}

/// A POST request addressed to the portal.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    /// Look up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a form field, if the body is form-encoded.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            RequestBody::Json(_) => None,
        }
    }
}

/// Status and decoded text body of a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 and 403 both mean the session token is no longer accepted.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

/// Request never produced a response.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Issue a request, return status + body.
///
/// Implementations must not retry: retry policy belongs to the engine.
#[async_trait]
pub trait HttpCapability: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}
