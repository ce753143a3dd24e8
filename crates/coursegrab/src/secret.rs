//! Session secret acquisition cascade.
//!
//! The registration call needs a `secretVal` bound to the target class.
//! It can come from several places, tried in a fixed priority order:
//!
//! 1. [`SecretStrategy::CapturedCatalog`]: catalog rows already captured
//!    in the session (e.g. by the search that picked the target).
//! 2. [`SecretStrategy::StoredState`]: secrets remembered from page state.
//! 3. [`SecretStrategy::CatalogQuery`]: a fresh catalog query.
//!
//! The order is plain data, so strategies can be reordered or dropped
//! without touching control flow. The first valid value wins and no
//! lower-priority strategy runs after it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::catalog::{self, CatalogError, CatalogQuery};
use crate::portal::PortalEndpoints;
use crate::transport::{HttpCapability, TransportError};
use crate::types::{SessionSecret, SessionState, TargetItem};

/// One way of obtaining a session secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretStrategy {
    /// Look through catalog rows already captured in the session.
    CapturedCatalog,
    /// Use a secret remembered from page state.
    StoredState,
    /// Query the catalog endpoint again.
    CatalogQuery,
}

impl SecretStrategy {
    /// Default priority order.
    pub const DEFAULT_ORDER: [SecretStrategy; 3] = [
        SecretStrategy::CapturedCatalog,
        SecretStrategy::StoredState,
        SecretStrategy::CatalogQuery,
    ];

    /// Whether this strategy talks to the portal.
    pub fn is_network(self) -> bool {
        matches!(self, SecretStrategy::CatalogQuery)
    }
}

impl fmt::Display for SecretStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapturedCatalog => write!(f, "captured catalog"),
            Self::StoredState => write!(f, "stored state"),
            Self::CatalogQuery => write!(f, "catalog query"),
        }
    }
}

/// A secret together with where and when it was obtained.
#[derive(Debug, Clone)]
pub struct AcquiredSecret {
    pub secret: SessionSecret,
    pub source: SecretStrategy,
    pub acquired_at: Instant,
}

impl AcquiredSecret {
    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

/// No secret could be obtained.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("{item} is not currently listed in the catalog")]
    NotListed { item: String },

    #[error("catalog row for {item} carries no secretVal")]
    MissingSecret { item: String },

    #[error("no secret strategy produced a value for {item}")]
    Exhausted { item: String },

    #[error("session rejected while querying the catalog (HTTP {0})")]
    AuthExpired(u16),

    #[error("catalog query failed: {0}")]
    Transport(TransportError),

    #[error("catalog query failed: {0}")]
    Catalog(String),
}

impl AcquisitionError {
    /// Transport failures are worth retrying later; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(self, AcquisitionError::Transport(_))
    }

    fn from_catalog(e: CatalogError) -> Self {
        match e {
            CatalogError::Transport(t) => AcquisitionError::Transport(t),
            CatalogError::AuthExpired(status) => AcquisitionError::AuthExpired(status),
            other => AcquisitionError::Catalog(other.to_string()),
        }
    }
}

/// Ordered fallback chain producing a [`SessionSecret`].
///
/// Stateless: every call starts from the top of the order, so the caller
/// decides when a fresh acquisition is needed.
#[derive(Clone)]
pub struct SecretCascade {
    http: Arc<dyn HttpCapability>,
    endpoints: PortalEndpoints,
    order: Vec<SecretStrategy>,
}

impl SecretCascade {
    pub fn new(http: Arc<dyn HttpCapability>, endpoints: PortalEndpoints) -> Self {
        Self {
            http,
            endpoints,
            order: SecretStrategy::DEFAULT_ORDER.to_vec(),
        }
    }

    /// Replace the strategy order. Duplicates are dropped.
    pub fn with_order(mut self, order: impl IntoIterator<Item = SecretStrategy>) -> Self {
        let mut deduped = Vec::new();
        for strategy in order {
            if !deduped.contains(&strategy) {
                deduped.push(strategy);
            }
        }
        self.order = deduped;
        self
    }

    pub fn order(&self) -> &[SecretStrategy] {
        &self.order
    }

    /// Try every strategy in priority order.
    pub async fn acquire(
        &self,
        session: &SessionState,
        item: &TargetItem,
    ) -> Result<AcquiredSecret, AcquisitionError> {
        self.run(session, item, &self.order).await
    }

    /// Skip cached sources; used when the current secret was rejected as stale.
    pub async fn acquire_fresh(
        &self,
        session: &SessionState,
        item: &TargetItem,
    ) -> Result<AcquiredSecret, AcquisitionError> {
        let mut network: Vec<SecretStrategy> =
            self.order.iter().copied().filter(|s| s.is_network()).collect();
        if network.is_empty() {
            network.push(SecretStrategy::CatalogQuery);
        }
        self.run(session, item, &network).await
    }

    async fn run(
        &self,
        session: &SessionState,
        item: &TargetItem,
        strategies: &[SecretStrategy],
    ) -> Result<AcquiredSecret, AcquisitionError> {
        let mut last_error = None;

        for &strategy in strategies {
            let found = match strategy {
                SecretStrategy::CapturedCatalog => Ok(from_captured(session, item)),
                SecretStrategy::StoredState => Ok(from_stored(session, item)),
                SecretStrategy::CatalogQuery => self.from_catalog_query(session, item).await,
            };

            match found {
                Ok(Some(secret)) => {
                    tracing::info!(item = %item.id, source = %strategy, secret = %secret, "session secret acquired");
                    return Ok(AcquiredSecret {
                        secret,
                        source: strategy,
                        acquired_at: Instant::now(),
                    });
                }
                Ok(None) => {
                    tracing::debug!(item = %item.id, source = %strategy, "no secret from strategy");
                }
                Err(e @ AcquisitionError::AuthExpired(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(item = %item.id, source = %strategy, "secret strategy failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AcquisitionError::Exhausted {
            item: item.id.clone(),
        }))
    }

    async fn from_catalog_query(
        &self,
        session: &SessionState,
        item: &TargetItem,
    ) -> Result<Option<SessionSecret>, AcquisitionError> {
        let query = CatalogQuery::new(item.name.clone(), item.category.clone());
        let page = catalog::search(self.http.as_ref(), &self.endpoints, session, &query)
            .await
            .map_err(AcquisitionError::from_catalog)?;

        let row = page.find(&item.id).ok_or_else(|| AcquisitionError::NotListed {
            item: item.id.clone(),
        })?;

        row.secret
            .as_deref()
            .and_then(SessionSecret::parse)
            .map(Some)
            .ok_or_else(|| AcquisitionError::MissingSecret {
                item: item.id.clone(),
            })
    }
}

fn from_captured(session: &SessionState, item: &TargetItem) -> Option<SessionSecret> {
    // Newest capture first.
    session
        .captured_rows
        .iter()
        .rev()
        .filter(|row| row.class_id == item.id)
        .find_map(|row| row.secret.as_deref().and_then(SessionSecret::parse))
}

fn from_stored(session: &SessionState, item: &TargetItem) -> Option<SessionSecret> {
    let newest = |bound: bool| {
        session
            .stored_secrets
            .iter()
            .filter(|s| match &s.item_id {
                Some(id) => bound && id == &item.id,
                None => !bound,
            })
            .filter_map(|s| SessionSecret::parse(&s.value).map(|secret| (s.captured_at, secret)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, secret)| secret)
    };
    newest(true).or_else(|| newest(false))
}
