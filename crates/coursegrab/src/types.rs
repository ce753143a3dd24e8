//! Core data types shared by the cascade, the client, and the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogRow;

/// Default class type used by the elective portal for searchable courses.
pub const DEFAULT_CATEGORY: &str = "FANKC";

/// Number of leading characters kept by [`redact`].
const REDACT_KEEP: usize = 8;

/// Shorten a sensitive value for logs and progress output.
///
/// Keeps the first few characters so two values can still be told apart.
pub fn redact(value: &str) -> String {
    if value.is_empty() {
        return "<empty>".to_string();
    }
    let prefix: String = value.chars().take(REDACT_KEEP).collect();
    if prefix.len() == value.len() {
        "***".to_string()
    } else {
        format!("{prefix}...")
    }
}

/// Login identity and password for the campus SSO.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub identity: String,
    secret: String,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: secret.into(),
        }
    }

    /// The raw password. Only the login form should ever read this.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_complete(&self) -> bool {
        !self.identity.trim().is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity: String = self.identity.chars().take(3).collect();
        f.debug_struct("Credentials")
            .field("identity", &format!("{identity}***"))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A secret value remembered from an earlier page or run, with its capture time.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredSecret {
    pub value: String,
    /// The item this secret was observed for, when known.
    pub item_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSecret")
            .field("value", &redact(&self.value))
            .field("item_id", &self.item_id)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Authenticated portal session produced by the login step.
///
/// The engine only ever borrows this immutably; a caller running several
/// items for one user can share it behind an `Arc`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    /// Value sent in the `Authorization` header.
    pub token: String,
    /// Elective batch the requests are scoped to (`batchid` header).
    pub batch_id: String,
    /// Raw `Cookie` header value, possibly empty.
    pub cookie: String,
    /// Catalog rows already seen during this session (e.g. from a search).
    pub captured_rows: Vec<CatalogRow>,
    /// Secrets remembered from page state.
    pub stored_secrets: Vec<StoredSecret>,
}

impl SessionState {
    pub fn new(
        token: impl Into<String>,
        batch_id: impl Into<String>,
        cookie: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            batch_id: batch_id.into(),
            cookie: cookie.into(),
            captured_rows: Vec::new(),
            stored_secrets: Vec::new(),
        }
    }

    /// Whether the session carries everything a registration request needs.
    pub fn is_complete(&self) -> bool {
        !self.token.trim().is_empty() && !self.batch_id.trim().is_empty()
    }

    /// Remember catalog rows returned by a search.
    pub fn capture_rows(&mut self, rows: impl IntoIterator<Item = CatalogRow>) {
        self.captured_rows.extend(rows);
    }

    pub fn store_secret(&mut self, value: impl Into<String>, item_id: Option<String>) {
        self.stored_secrets.push(StoredSecret {
            value: value.into(),
            item_id,
            captured_at: Utc::now(),
        });
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("token", &redact(&self.token))
            .field("batch_id", &self.batch_id)
            .field("cookie", &redact(&self.cookie))
            .field("captured_rows", &self.captured_rows.len())
            .field("stored_secrets", &self.stored_secrets.len())
            .finish()
    }
}

/// The catalog entry being registered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetItem {
    /// Teaching class id (`JXBID` / `clazzId`).
    pub id: String,
    /// Display name, also used as the catalog search keyword.
    pub name: String,
    /// Class type tag (`teachingClassType` / `clazzType`).
    pub category: String,
}

impl TargetItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: DEFAULT_CATEGORY.to_string(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl fmt::Display for TargetItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Opaque per-item authorization value required by the registration call.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    /// Wrap a raw value, rejecting blank strings.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionSecret({})", redact(&self.0))
    }
}

impl fmt::Display for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact(&self.0))
    }
}
