//! Elective portal endpoints and the headers every authenticated call carries.

use serde::{Deserialize, Serialize};

use crate::types::SessionState;

pub const DEFAULT_BASE_URL: &str = "https://byxk.buaa.edu.cn";
const LIST_PATH: &str = "/xsxk/elective/buaa/clazz/list";
const ADD_PATH: &str = "/xsxk/elective/buaa/clazz/add";

/// Where the catalog and registration endpoints live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalEndpoints {
    pub base_url: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl PortalEndpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Catalog search endpoint (also the source of fresh secrets).
    pub fn list_url(&self) -> String {
        format!("{}{LIST_PATH}", self.base_url)
    }

    /// Registration endpoint.
    pub fn add_url(&self) -> String {
        format!("{}{ADD_PATH}", self.base_url)
    }

    pub fn referer(&self, batch_id: &str) -> String {
        format!(
            "{}/xsxk/elective/grablessons?batchId={batch_id}",
            self.base_url
        )
    }

    /// Headers binding a request to the session's token, batch and cookies.
    pub fn session_headers(&self, session: &SessionState) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Authorization".to_string(), session.token.clone()),
            ("batchid".to_string(), session.batch_id.clone()),
            (
                "Accept".to_string(),
                "application/json, text/plain, */*".to_string(),
            ),
            ("Origin".to_string(), self.base_url.clone()),
            ("Referer".to_string(), self.referer(&session.batch_id)),
        ];
        if !session.cookie.is_empty() {
            headers.push(("Cookie".to_string(), session.cookie.clone()));
        }
        headers
    }
}
