//! coursegrab: registration retry engine for the BUAA elective portal.
//!
//! The crate is protocol-light: it talks to the portal through the
//! [`HttpCapability`] trait and reports progress through a [`ProgressSink`].
//! Authentication happens outside; the engine consumes a ready
//! [`SessionState`].

pub mod catalog;
pub mod client;
pub mod engine;
pub mod portal;
pub mod progress;
pub mod secret;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

pub use catalog::{search, CatalogError, CatalogPage, CatalogQuery, CatalogRow};
pub use client::{AttemptKind, AttemptResult, Outcome, RegistrationClient, ResponsePatterns};
pub use engine::{
    AttemptRecord, EngineConfig, RetryEngine, RetryOutcome, RunStatus, WaitPolicy,
    DEFAULT_MAX_CONSECUTIVE_FAULTS,
};
pub use portal::PortalEndpoints;
pub use progress::{NullSink, ProgressEvent, ProgressEventKind, ProgressSink};
pub use secret::{AcquiredSecret, AcquisitionError, SecretCascade, SecretStrategy};
pub use transport::{
    HttpCapability, HttpRequest, HttpResponse, PortalHttpClient, RequestBody, TransportError,
};
pub use types::*;

pub use tokio_util::sync::CancellationToken;
