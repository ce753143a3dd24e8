//! Course catalog search.
//!
//! The list endpoint returns teaching-class rows, each carrying the
//! `secretVal` the registration call needs. Searching both lets the user
//! pick a target and seeds the session with captured rows.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::portal::PortalEndpoints;
use crate::transport::{HttpCapability, HttpRequest, RequestBody, TransportError};
use crate::types::SessionState;

const PAGE_SIZE: u32 = 10;

/// One teaching-class row from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    #[serde(rename = "JXBID", default)]
    pub class_id: String,
    #[serde(rename = "KCM", default)]
    pub course_name: String,
    #[serde(rename = "JSXM", default)]
    pub teacher: String,
    #[serde(rename = "secretVal", default)]
    pub secret: Option<String>,
}

/// Rows returned by a single catalog query.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub rows: Vec<CatalogRow>,
}

impl CatalogPage {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn find(&self, class_id: &str) -> Option<&CatalogRow> {
        self.rows.iter().find(|row| row.class_id == class_id)
    }
}

/// Why a catalog query produced no page.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session rejected by catalog (HTTP {0})")]
    AuthExpired(u16),

    #[error("catalog request failed with HTTP {0}")]
    Http(u16),

    #[error("catalog response is not valid JSON: {0}")]
    Malformed(String),

    #[error("catalog search rejected: {0}")]
    Rejected(String),
}

/// Parameters of a catalog search.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub keyword: String,
    pub category: String,
}

impl CatalogQuery {
    pub fn new(keyword: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            category: category.into(),
        }
    }

    fn payload(&self) -> Value {
        let mut payload = json!({
            "teachingClassType": self.category,
            "pageNumber": 1,
            "pageSize": PAGE_SIZE,
            "orderBy": "",
            "campus": "1",
            "SFCT": "0",
        });
        if !self.keyword.is_empty() {
            payload["KEY"] = Value::String(self.keyword.clone());
        }
        payload
    }
}

/// Extract the business message from a portal JSON envelope.
pub(crate) fn envelope_message(body: &Value) -> Option<String> {
    ["message", "msg"]
        .iter()
        .filter_map(|key| body.get(*key))
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// `code == 200` or `success == true`.
pub(crate) fn envelope_ok(body: &Value) -> Option<bool> {
    let code = body.get("code").and_then(Value::as_i64);
    let success = body.get("success").and_then(Value::as_bool);
    match (code, success) {
        (None, None) => None,
        (code, success) => Some(code == Some(200) || success == Some(true)),
    }
}

/// Run one catalog search.
pub async fn search(
    http: &dyn HttpCapability,
    endpoints: &PortalEndpoints,
    session: &SessionState,
    query: &CatalogQuery,
) -> Result<CatalogPage, CatalogError> {
    let request = HttpRequest {
        url: endpoints.list_url(),
        headers: endpoints.session_headers(session),
        body: RequestBody::Json(query.payload()),
    };

    let resp = http.post(request).await?;
    if resp.is_auth_failure() {
        return Err(CatalogError::AuthExpired(resp.status));
    }
    if !resp.is_success() {
        return Err(CatalogError::Http(resp.status));
    }

    let body: Value =
        serde_json::from_str(&resp.body).map_err(|e| CatalogError::Malformed(e.to_string()))?;

    if envelope_ok(&body) != Some(true) {
        let message = envelope_message(&body).unwrap_or_else(|| "未知错误".to_string());
        return Err(CatalogError::Rejected(message));
    }

    let rows = body
        .pointer("/data/rows")
        .filter(|v| !v.is_null())
        .cloned()
        .map(serde_json::from_value::<Vec<CatalogRow>>)
        .transpose()
        .map_err(|e| CatalogError::Malformed(e.to_string()))?
        .unwrap_or_default();

    tracing::debug!(keyword = %query.keyword, rows = rows.len(), "catalog search complete");
    Ok(CatalogPage { rows })
}
