//! CAS single-sign-on login producing a portal [`SessionState`].
//!
//! Flow:
//! 1. GET the elective entry page; a `token` cookie there means the
//!    cookie jar already holds a live session.
//! 2. Otherwise GET `/xsxk/auth/cas`, which redirects to the SSO login
//!    form. Scrape the `execution` field and POST the credentials back.
//! 3. Read the `token` cookie the portal sets after the CAS round trip.
//! 4. Unless a batch id is configured, ask `/xsxk/web/studentInfo` for it.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use serde_json::Value;
use url::Url;

use coursegrab::transport::http_client::USER_AGENT;
use coursegrab::{redact, Credentials, SessionState};

const ENTRY_PATH: &str = "/xsxk/elective/grablessons";
const CAS_PATH: &str = "/xsxk/auth/cas";
const STUDENT_INFO_PATH: &str = "/xsxk/web/studentInfo";
const TOKEN_COOKIE: &str = "token";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("invalid portal url {0}")]
    InvalidUrl(String),

    #[error("login request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SSO login page has no execution field (landed on {0})")]
    ExecutionNotFound(String),

    #[error("login rejected: no session token after submitting credentials (landed on {0})")]
    Rejected(String),

    #[error("could not determine the elective batch: {0}")]
    BatchUnavailable(String),
}

fn execution_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"name="execution"\s+value="([^"]+)""#).expect("execution regex is valid")
    })
}

/// Pull the CAS `execution` token out of the login form HTML.
pub fn extract_execution(html: &str) -> Option<String> {
    execution_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract `data.student.electiveBatchList[0].code` from a studentInfo reply.
pub fn extract_batch_id(body: &Value) -> Result<String, AuthError> {
    if body.get("code").and_then(Value::as_i64) != Some(200) {
        let message = body
            .get("msg")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unexpected response");
        return Err(AuthError::BatchUnavailable(message.to_string()));
    }
    body.pointer("/data/student/electiveBatchList/0/code")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AuthError::BatchUnavailable("electiveBatchList is empty".to_string()))
}

/// Logs in through CAS with a cookie-storing client.
pub struct CasAuthenticator {
    client: reqwest::Client,
    jar: Arc<Jar>,
    base_url: Url,
    sso_url: Option<String>,
}

impl CasAuthenticator {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, AuthError> {
        let base_url =
            Url::parse(base_url).map_err(|_| AuthError::InvalidUrl(base_url.to_string()))?;
        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            jar,
            base_url,
            sso_url: None,
        })
    }

    /// Expected SSO origin; landing anywhere else is logged.
    pub fn with_sso_url(mut self, sso_url: impl Into<String>) -> Self {
        self.sso_url = Some(sso_url.into());
        self
    }

    fn url(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|_| AuthError::InvalidUrl(format!("{}{path}", self.base_url)))
    }

    /// Raw `Cookie` header the jar would send to the portal.
    fn cookie_header(&self) -> String {
        self.jar
            .cookies(&self.base_url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
            .unwrap_or_default()
    }

    fn token(&self) -> Option<String> {
        let header = self.cookie_header();
        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == TOKEN_COOKIE)
            .map(|(_, value)| value.to_string())
            .filter(|v| !v.is_empty())
    }

    /// Log in and build a session. A non-empty `batch_id` skips the lookup.
    pub async fn login(
        &self,
        credentials: &Credentials,
        batch_id: &str,
    ) -> Result<SessionState, AuthError> {
        tracing::info!(user = %redact(&credentials.identity), "logging in through CAS");

        self.client.get(self.url(ENTRY_PATH)?).send().await?;

        let token = match self.token() {
            Some(token) => {
                tracing::info!("reusing existing portal session");
                token
            }
            None => self.cas_round_trip(credentials).await?,
        };
        tracing::info!(token = %redact(&token), "portal token obtained");

        self.session_for(token, batch_id).await
    }

    async fn cas_round_trip(&self, credentials: &Credentials) -> Result<String, AuthError> {
        let form_page = self.client.get(self.url(CAS_PATH)?).send().await?;
        let login_url = form_page.url().clone();
        if let Some(sso) = self.sso_url.as_deref() {
            if !login_url.as_str().starts_with(sso) {
                tracing::warn!(expected = %sso, landed = %login_url, "CAS redirect left the configured SSO host");
            }
        }
        let html = form_page.text().await?;
        let execution = extract_execution(&html)
            .ok_or_else(|| AuthError::ExecutionNotFound(login_url.to_string()))?;
        tracing::debug!(url = %login_url, "submitting SSO form");

        let form = [
            ("username", credentials.identity.as_str()),
            ("password", credentials.secret()),
            ("execution", execution.as_str()),
            ("submit", "登录"),
            ("type", "username_password"),
            ("_eventId", "submit"),
        ];
        let landed = self.client.post(login_url).form(&form).send().await?;
        let landed_url = landed.url().to_string();

        self.token().ok_or(AuthError::Rejected(landed_url))
    }

    /// Build a session from a known token, looking up the batch if needed.
    pub async fn session_for(&self, token: String, batch_id: &str) -> Result<SessionState, AuthError> {
        let batch_id = if batch_id.trim().is_empty() {
            self.fetch_batch_id(&token).await?
        } else {
            batch_id.trim().to_string()
        };
        tracing::info!(batch_id = %batch_id, "elective batch selected");
        Ok(SessionState::new(token, batch_id, self.cookie_header()))
    }

    async fn fetch_batch_id(&self, token: &str) -> Result<String, AuthError> {
        let resp = self
            .client
            .post(self.url(STUDENT_INFO_PATH)?)
            .header("Authorization", token)
            .header("Accept", "application/json, text/plain, */*")
            .form(&[("token", token)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::BatchUnavailable(format!(
                "studentInfo returned HTTP {}",
                status.as_u16()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| AuthError::BatchUnavailable(e.to_string()))?;
        extract_batch_id(&body)
    }
}
