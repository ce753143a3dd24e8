//! Single registration attempt and its classification.
//!
//! [`RegistrationClient::attempt`] submits exactly one `clazz/add` request
//! and folds whatever comes back (including transport failures) into an
//! [`AttemptResult`]. It never retries; that is the engine's job.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{envelope_message, envelope_ok};
use crate::portal::PortalEndpoints;
use crate::transport::{HttpCapability, HttpRequest, HttpResponse, RequestBody, TransportError};
use crate::types::{SessionSecret, SessionState, TargetItem};

/// Longest raw body excerpt carried into a message.
const BODY_EXCERPT_CHARS: usize = 100;

/// Message substrings that decide how a business failure is treated.
///
/// The portal's error vocabulary is undocumented, so these are data rather
/// than code and can be extended from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePatterns {
    /// Quota exhausted; try again later.
    pub capacity_full: Vec<String>,
    /// The class is already in the student's results.
    pub already_registered: Vec<String>,
    /// The submitted secretVal is stale or invalid.
    pub secret_rejected: Vec<String>,
}

impl Default for ResponsePatterns {
    fn default() -> Self {
        Self {
            capacity_full: vec!["课容量已满".to_string()],
            already_registered: vec!["该课程已在选课结果中".to_string()],
            secret_rejected: vec!["secretVal".to_string()],
        }
    }
}

fn matches_any(patterns: &[String], message: &str) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && message.contains(p.as_str()))
}

/// Coarse classification the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Retryable,
    Fatal,
}

/// Detailed reason behind an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Registered,
    AlreadyRegistered,
    CapacityFull,
    SecretRejected,
    Transport,
    ServerFault,
    Malformed,
    AuthExpired,
    BusinessRule,
}

impl AttemptKind {
    pub fn outcome(self) -> Outcome {
        match self {
            Self::Registered | Self::AlreadyRegistered => Outcome::Success,
            Self::CapacityFull
            | Self::SecretRejected
            | Self::Transport
            | Self::ServerFault
            | Self::Malformed => Outcome::Retryable,
            Self::AuthExpired | Self::BusinessRule => Outcome::Fatal,
        }
    }

    /// Transient infrastructure failure, as opposed to a business answer.
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Transport | Self::ServerFault | Self::Malformed)
    }
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::AlreadyRegistered => "already registered",
            Self::CapacityFull => "capacity full",
            Self::SecretRejected => "secret rejected",
            Self::Transport => "transport failure",
            Self::ServerFault => "server fault",
            Self::Malformed => "malformed response",
            Self::AuthExpired => "authentication expired",
            Self::BusinessRule => "rejected",
        };
        f.write_str(s)
    }
}

/// Classified result of one registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub kind: AttemptKind,
    pub message: String,
    /// Missing when the request never got a response.
    pub http_status: Option<u16>,
}

impl AttemptResult {
    pub fn outcome(&self) -> Outcome {
        self.kind.outcome()
    }

    fn new(kind: AttemptKind, message: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status,
        }
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > BODY_EXCERPT_CHARS {
        let cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

/// Submits registration requests for one portal.
#[derive(Clone)]
pub struct RegistrationClient {
    http: Arc<dyn HttpCapability>,
    endpoints: PortalEndpoints,
    patterns: ResponsePatterns,
}

impl RegistrationClient {
    pub fn new(http: Arc<dyn HttpCapability>, endpoints: PortalEndpoints) -> Self {
        Self {
            http,
            endpoints,
            patterns: ResponsePatterns::default(),
        }
    }

    pub fn with_patterns(mut self, patterns: ResponsePatterns) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn patterns(&self) -> &ResponsePatterns {
        &self.patterns
    }

    /// Form-encoded `clazz/add` request for the item.
    pub fn build_request(
        &self,
        session: &SessionState,
        item: &TargetItem,
        secret: &SessionSecret,
    ) -> HttpRequest {
        HttpRequest {
            url: self.endpoints.add_url(),
            headers: self.endpoints.session_headers(session),
            body: RequestBody::Form(vec![
                ("clazzType".to_string(), item.category.clone()),
                ("clazzId".to_string(), item.id.clone()),
                ("secretVal".to_string(), secret.expose().to_string()),
            ]),
        }
    }

    /// Submit one registration request and classify the result.
    pub async fn attempt(
        &self,
        session: &SessionState,
        item: &TargetItem,
        secret: &SessionSecret,
    ) -> AttemptResult {
        let request = self.build_request(session, item, secret);
        let response = self.http.post(request).await;
        let result = self.classify(response);
        tracing::debug!(
            item = %item.id,
            kind = %result.kind,
            status = ?result.http_status,
            "registration attempt classified"
        );
        result
    }

    /// Map a raw response to an [`AttemptResult`].
    pub fn classify(&self, response: Result<HttpResponse, TransportError>) -> AttemptResult {
        let resp = match response {
            Ok(resp) => resp,
            Err(e) => return AttemptResult::new(AttemptKind::Transport, e.to_string(), None),
        };
        let status = Some(resp.status);

        if resp.is_auth_failure() {
            return AttemptResult::new(
                AttemptKind::AuthExpired,
                format!("HTTP {}: session no longer accepted", resp.status),
                status,
            );
        }
        if !resp.is_success() {
            return AttemptResult::new(
                AttemptKind::ServerFault,
                format!("HTTP {}: {}", resp.status, excerpt(&resp.body)),
                status,
            );
        }

        let body: Value = match serde_json::from_str(&resp.body) {
            Ok(body) => body,
            Err(_) => {
                return AttemptResult::new(
                    AttemptKind::Malformed,
                    format!("undecodable response: {}", excerpt(&resp.body)),
                    status,
                )
            }
        };

        match envelope_ok(&body) {
            None => AttemptResult::new(
                AttemptKind::Malformed,
                format!("response carries no result indicator: {}", excerpt(&resp.body)),
                status,
            ),
            Some(true) => AttemptResult::new(
                AttemptKind::Registered,
                envelope_message(&body).unwrap_or_else(|| "选课成功".to_string()),
                status,
            ),
            Some(false) => {
                let message = envelope_message(&body).unwrap_or_else(|| "未知错误".to_string());
                let kind = if matches_any(&self.patterns.capacity_full, &message) {
                    AttemptKind::CapacityFull
                } else if matches_any(&self.patterns.already_registered, &message) {
                    AttemptKind::AlreadyRegistered
                } else if matches_any(&self.patterns.secret_rejected, &message) {
                    AttemptKind::SecretRejected
                } else {
                    AttemptKind::BusinessRule
                };
                AttemptResult::new(kind, message, status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedHttp;
    use serde_json::json;

    fn client() -> RegistrationClient {
        RegistrationClient::new(
            Arc::new(ScriptedHttp::new(vec![])),
            PortalEndpoints::new("http://portal.test"),
        )
    }

    fn ok(body: Value) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(200, body.to_string()))
    }

    #[test]
    fn test_code_200_is_success() {
        let result = client().classify(ok(json!({ "code": 200, "msg": "操作成功" })));
        assert_eq!(result.kind, AttemptKind::Registered);
        assert_eq!(result.outcome(), Outcome::Success);
        assert_eq!(result.message, "操作成功");
    }

    #[test]
    fn test_success_flag_without_message() {
        let result = client().classify(ok(json!({ "success": true })));
        assert_eq!(result.kind, AttemptKind::Registered);
        assert_eq!(result.message, "选课成功");
    }

    #[test]
    fn test_capacity_full_is_retryable() {
        let result = client().classify(ok(json!({ "code": 400, "message": "课容量已满" })));
        assert_eq!(result.kind, AttemptKind::CapacityFull);
        assert_eq!(result.outcome(), Outcome::Retryable);
    }

    #[test]
    fn test_already_registered_is_success_equivalent() {
        let result = client().classify(ok(json!({
            "code": 500,
            "msg": "该课程已在选课结果中"
        })));
        assert_eq!(result.kind, AttemptKind::AlreadyRegistered);
        assert_eq!(result.outcome(), Outcome::Success);
    }

    #[test]
    fn test_other_business_failure_is_fatal_and_verbatim() {
        let result = client().classify(ok(json!({ "code": 400, "message": "与已选课程时间冲突" })));
        assert_eq!(result.kind, AttemptKind::BusinessRule);
        assert_eq!(result.outcome(), Outcome::Fatal);
        assert_eq!(result.message, "与已选课程时间冲突");
    }

    #[test]
    fn test_failure_without_message_uses_placeholder() {
        let result = client().classify(ok(json!({ "code": 400 })));
        assert_eq!(result.kind, AttemptKind::BusinessRule);
        assert_eq!(result.message, "未知错误");
    }

    #[test]
    fn test_secret_rejection_is_retryable() {
        let result = client().classify(ok(json!({ "code": 400, "msg": "secretVal已失效" })));
        assert_eq!(result.kind, AttemptKind::SecretRejected);
        assert_eq!(result.outcome(), Outcome::Retryable);
    }

    #[test]
    fn test_auth_statuses_are_fatal() {
        for status in [401, 403] {
            let result = client().classify(Ok(HttpResponse::new(status, "")));
            assert_eq!(result.kind, AttemptKind::AuthExpired);
            assert_eq!(result.outcome(), Outcome::Fatal);
            assert_eq!(result.http_status, Some(status));
        }
    }

    #[test]
    fn test_transport_failure_is_retryable() {
        let result = client().classify(Err(TransportError::Timeout));
        assert_eq!(result.kind, AttemptKind::Transport);
        assert_eq!(result.outcome(), Outcome::Retryable);
        assert_eq!(result.http_status, None);
    }

    #[test]
    fn test_server_error_is_fault() {
        let result = client().classify(Ok(HttpResponse::new(502, "<html>bad gateway</html>")));
        assert_eq!(result.kind, AttemptKind::ServerFault);
        assert!(result.kind.is_fault());
    }

    #[test]
    fn test_undecodable_body_is_malformed() {
        let long = "x".repeat(500);
        let result = client().classify(Ok(HttpResponse::new(200, long)));
        assert_eq!(result.kind, AttemptKind::Malformed);
        assert!(result.message.len() < 200);

        let result = client().classify(ok(json!({ "data": null })));
        assert_eq!(result.kind, AttemptKind::Malformed);
    }

    #[test]
    fn test_custom_patterns() {
        let client = client().with_patterns(ResponsePatterns {
            capacity_full: vec!["余量不足".to_string()],
            ..ResponsePatterns::default()
        });
        let result = client.classify(ok(json!({ "code": 400, "msg": "余量不足" })));
        assert_eq!(result.kind, AttemptKind::CapacityFull);
        // The default capacity text is no longer recognised.
        let result = client.classify(ok(json!({ "code": 400, "msg": "课容量已满" })));
        assert_eq!(result.kind, AttemptKind::BusinessRule);
    }

    #[tokio::test]
    async fn test_attempt_builds_form_request() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 200 }),
        )]));
        let client = RegistrationClient::new(http.clone(), PortalEndpoints::new("http://portal.test"));
        let session = SessionState::new("tok", "B7", "route=abc");
        let item = TargetItem::new("C42", "编译原理").with_category("TJKC");
        let secret = SessionSecret::parse("sv-123").unwrap();

        let result = client.attempt(&session, &item, &secret).await;
        assert_eq!(result.kind, AttemptKind::Registered);

        let sent = &http.requests()[0];
        assert_eq!(sent.url, "http://portal.test/xsxk/elective/buaa/clazz/add");
        assert_eq!(sent.form_field("clazzType"), Some("TJKC"));
        assert_eq!(sent.form_field("clazzId"), Some("C42"));
        assert_eq!(sent.form_field("secretVal"), Some("sv-123"));
        assert_eq!(sent.header("batchid"), Some("B7"));
        assert_eq!(sent.header("cookie"), Some("route=abc"));
    }
}
