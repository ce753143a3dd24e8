//! Progress events emitted by the retry engine.
//!
//! Events flow through a [`ProgressSink`]. The usual sink is a
//! `tokio::sync::broadcast` sender so several listeners (terminal printer,
//! JSON log) can subscribe. Events are observability only: a sink with no
//! listeners drops them and the run is unaffected.

use serde::{Deserialize, Serialize};

use crate::client::AttemptKind;
use crate::secret::SecretStrategy;

/// A progress event tagged with the run it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Identifier of the run that emitted this event.
    pub run_id: String,
    /// Monotonically increasing sequence number within the run.
    pub seq: u64,
    pub event: ProgressEventKind,
}

impl ProgressEvent {
    pub fn level(&self) -> Level {
        self.event.level()
    }
}

/// Severity used when presenting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    /// The run started for an item.
    Started { item_id: String, item_name: String },
    /// A secret was obtained. `secret` is already redacted.
    SecretAcquired {
        source: SecretStrategy,
        secret: String,
    },
    /// One registration attempt finished.
    AttemptFinished {
        index: u32,
        kind: AttemptKind,
        message: String,
        http_status: Option<u16>,
    },
    /// Sleeping before the next attempt.
    Waiting { next_index: u32, wait_ms: u64 },
    /// A non-fatal warning.
    Warning { message: String },
    /// The run reached a terminal state.
    Finished {
        success: bool,
        attempts: u32,
        elapsed_ms: u64,
        message: String,
    },
}

impl ProgressEventKind {
    pub fn level(&self) -> Level {
        match self {
            Self::Started { .. } | Self::SecretAcquired { .. } | Self::Waiting { .. } => {
                Level::Info
            }
            Self::AttemptFinished { kind, .. } => match kind {
                AttemptKind::Registered | AttemptKind::AlreadyRegistered => Level::Success,
                AttemptKind::AuthExpired | AttemptKind::BusinessRule => Level::Error,
                _ => Level::Warning,
            },
            Self::Warning { .. } => Level::Warning,
            Self::Finished { success: true, .. } => Level::Success,
            Self::Finished { success: false, .. } => Level::Error,
        }
    }

    /// Single-line human readable form.
    pub fn summary(&self) -> String {
        match self {
            Self::Started { item_id, item_name } => {
                format!("starting registration for {item_name} ({item_id})")
            }
            Self::SecretAcquired { source, secret } => {
                format!("secret {secret} acquired from {source}")
            }
            Self::AttemptFinished {
                index,
                kind,
                message,
                ..
            } => format!("attempt #{index}: {kind}: {message}"),
            Self::Waiting {
                next_index,
                wait_ms,
            } => format!("waiting {wait_ms} ms before attempt #{next_index}"),
            Self::Warning { message } => message.clone(),
            Self::Finished {
                attempts,
                elapsed_ms,
                message,
                ..
            } => format!("{message} ({attempts} attempts, {elapsed_ms} ms)"),
        }
    }
}

/// Receives progress events. Emission must never block or fail the run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

pub type ProgressSender = tokio::sync::broadcast::Sender<ProgressEvent>;
pub type ProgressReceiver = tokio::sync::broadcast::Receiver<ProgressEvent>;

/// Broadcast channel sized for a long polling run with a slow reader.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(256)
}

impl ProgressSink for ProgressSender {
    fn emit(&self, event: ProgressEvent) {
        // No receivers is not an error.
        let _ = self.send(event);
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}
