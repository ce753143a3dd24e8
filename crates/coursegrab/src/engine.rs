//! Registration retry engine.
//!
//! One run drives a single target item through
//! INIT → AUTHENTICATED → ATTEMPTING → WAITING → (ATTEMPTING | DONE):
//!
//! - the session is validated and a secret acquired once up front;
//! - each attempt is classified by [`RegistrationClient`] and reported to
//!   the progress sink before the loop continues;
//! - retryable outcomes sleep for the configured interval (backed off while
//!   faults repeat) in short slices, checking the cancellation token on
//!   every slice;
//! - success, fatal outcomes, a spent budget and cancellation end the run.
//!
//! [`RetryEngine::run`] never fails: every terminal condition is folded into
//! a [`RetryOutcome`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::{AttemptKind, AttemptResult, Outcome, RegistrationClient, ResponsePatterns};
use crate::portal::PortalEndpoints;
use crate::progress::{NullSink, ProgressEvent, ProgressEventKind, ProgressSink};
use crate::secret::{AcquiredSecret, AcquisitionError, SecretCascade, SecretStrategy};
use crate::transport::HttpCapability;
use crate::types::{SessionState, TargetItem};

/// How long to wait between retryable attempts.
///
/// Business answers (class full, secret rejected) wait `interval`. After
/// consecutive faults the wait grows by `backoff_factor` per fault, capped
/// at `max_interval`, and drops back as soon as the portal answers again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    /// Pause between two attempts.
    pub interval: Duration,
    /// Longest uninterrupted sleep; cancellation is noticed within one slice.
    pub slice: Duration,
    /// Growth per consecutive fault. 1.0 or less disables backoff.
    pub backoff_factor: f64,
    /// Upper bound for the backed-off wait.
    pub max_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            slice: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl WaitPolicy {
    /// Wait before the next attempt given the current fault streak.
    pub fn delay(&self, consecutive_faults: u32) -> Duration {
        if consecutive_faults == 0 || self.backoff_factor.is_nan() || self.backoff_factor <= 1.0 {
            return self.interval;
        }
        let cap = self.max_interval.max(self.interval);
        let exponent = consecutive_faults.min(64) as i32;
        let scaled = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Consecutive faults tolerated by default before a run gives up.
pub const DEFAULT_MAX_CONSECUTIVE_FAULTS: u32 = 20;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Portal the cascade and the client talk to.
    pub endpoints: PortalEndpoints,
    /// Pause and backoff between retryable attempts.
    pub wait: WaitPolicy,
    /// `None` retries until something else ends the run.
    pub max_attempts: Option<u32>,
    /// Emit a warning every time this many faults happen in a row.
    pub fault_warn_after: u32,
    /// Give up after this many consecutive faults. `None` never gives up.
    pub max_consecutive_faults: Option<u32>,
    /// Re-acquire the secret once it is older than this.
    pub secret_max_age: Option<Duration>,
    /// Message substrings used to classify business failures.
    pub patterns: ResponsePatterns,
    /// Priority order of the secret cascade.
    pub secret_order: Vec<SecretStrategy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoints: PortalEndpoints::default(),
            wait: WaitPolicy::default(),
            max_attempts: None,
            fault_warn_after: 5,
            max_consecutive_faults: Some(DEFAULT_MAX_CONSECUTIVE_FAULTS),
            secret_max_age: None,
            patterns: ResponsePatterns::default(),
            secret_order: SecretStrategy::DEFAULT_ORDER.to_vec(),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Registered,
    AlreadyRegistered,
    Cancelled,
    BudgetExhausted,
    FaultsExhausted,
    AuthExpired,
    BusinessRule,
    SecretUnavailable,
    InvalidSession,
    RuntimeUnavailable,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Registered | Self::AlreadyRegistered)
    }

    /// The run stopped without the portal ever giving a final answer.
    pub fn capacity_never_opened(self) -> bool {
        matches!(self, Self::Cancelled | Self::BudgetExhausted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::AlreadyRegistered => "already registered",
            Self::Cancelled => "cancelled",
            Self::BudgetExhausted => "attempt budget exhausted",
            Self::FaultsExhausted => "too many consecutive faults",
            Self::AuthExpired => "authentication expired",
            Self::BusinessRule => "rejected by portal",
            Self::SecretUnavailable => "secret unavailable",
            Self::InvalidSession => "invalid session",
            Self::RuntimeUnavailable => "runtime unavailable",
        };
        f.write_str(s)
    }
}

/// One attempt as seen by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based.
    pub index: u32,
    /// When the response was classified.
    pub timestamp: DateTime<Utc>,
    pub kind: AttemptKind,
    /// Coarse class of `kind`.
    pub outcome: Outcome,
    /// Portal message or failure text.
    pub message: String,
}

/// Terminal result of a run.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Identifier shared with every progress event of the run.
    pub run_id: String,
    /// `status.is_success()`.
    pub success: bool,
    pub status: RunStatus,
    /// Registration requests actually submitted.
    pub attempts: u32,
    /// Wall time from start to the terminal state.
    pub elapsed: Duration,
    /// Human readable summary that distinguishes every terminal state.
    pub message: String,
    /// Underlying failure text, if the run ended on one.
    pub error: Option<String>,
    /// The final attempt, if any was made.
    pub last_attempt: Option<AttemptRecord>,
}

/// Per-run bookkeeping: identity, event sequence and counters.
struct RunState {
    run_id: String,
    seq: u64,
    started: Instant,
    attempts: u32,
    consecutive_faults: u32,
    last_attempt: Option<AttemptRecord>,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            started: Instant::now(),
            attempts: 0,
            consecutive_faults: 0,
            last_attempt: None,
        }
    }

    fn next_event(&mut self, event: ProgressEventKind) -> ProgressEvent {
        self.seq += 1;
        ProgressEvent {
            run_id: self.run_id.clone(),
            seq: self.seq,
            event,
        }
    }
}

/// Drives registration attempts for one item until a terminal state.
pub struct RetryEngine {
    cascade: SecretCascade,
    client: RegistrationClient,
    config: EngineConfig,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl RetryEngine {
    pub fn new(
        http: Arc<dyn HttpCapability>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let cascade = SecretCascade::new(http.clone(), config.endpoints.clone())
            .with_order(config.secret_order.iter().copied());
        let client = RegistrationClient::new(http, config.endpoints.clone())
            .with_patterns(config.patterns.clone());
        Self {
            cascade,
            client,
            config,
            cancel,
            sink: Arc::new(NullSink),
        }
    }

    /// Route progress events to `sink` instead of discarding them.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Blocking variant of [`run`](Self::run) on a private current-thread runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn run_blocking(&self, session: &SessionState, item: &TargetItem) -> RetryOutcome {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(self.run(session, item)),
            Err(e) => {
                let mut state = RunState::new();
                self.finish(
                    &mut state,
                    RunStatus::RuntimeUnavailable,
                    "could not start the blocking runtime".to_string(),
                    Some(e.to_string()),
                )
            }
        }
    }

    /// Run the attempt loop to completion.
    pub async fn run(&self, session: &SessionState, item: &TargetItem) -> RetryOutcome {
        let mut state = RunState::new();
        tracing::info!(run_id = %state.run_id, item = %item, "registration run started");
        self.emit(
            &mut state,
            ProgressEventKind::Started {
                item_id: item.id.clone(),
                item_name: item.name.clone(),
            },
        );

        if !session.is_complete() {
            return self.finish(
                &mut state,
                RunStatus::InvalidSession,
                "session is incomplete: token or batch id missing".to_string(),
                None,
            );
        }

        if self.cancel.is_cancelled() {
            return self.cancelled(&mut state);
        }

        let mut current = match self.cascade.acquire(session, item).await {
            Ok(secret) => secret,
            Err(_) if self.cancel.is_cancelled() => return self.cancelled(&mut state),
            Err(e) => {
                let message = if e.is_transient() {
                    format!("could not obtain a session secret for {item} (transient, safe to rerun)")
                } else {
                    format!("could not obtain a session secret for {item}")
                };
                let status = match e {
                    AcquisitionError::AuthExpired(_) => RunStatus::AuthExpired,
                    _ => RunStatus::SecretUnavailable,
                };
                return self.finish(&mut state, status, message, Some(e.to_string()));
            }
        };
        self.emit_secret(&mut state, &current);

        let mut secret_rejected = false;

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(&mut state);
            }
            if self.budget_spent(state.attempts) {
                return self.budget_exhausted(&mut state);
            }

            let stale = self
                .config
                .secret_max_age
                .is_some_and(|max| current.age() >= max);
            if secret_rejected || stale {
                match self.cascade.acquire_fresh(session, item).await {
                    Ok(fresh) => {
                        current = fresh;
                        self.emit_secret(&mut state, &current);
                    }
                    Err(e @ AcquisitionError::AuthExpired(_)) => {
                        return self.finish(
                            &mut state,
                            RunStatus::AuthExpired,
                            "authentication expired while refreshing the secret; log in again"
                                .to_string(),
                            Some(e.to_string()),
                        );
                    }
                    Err(e) if secret_rejected && !e.is_transient() => {
                        return self.finish(
                            &mut state,
                            RunStatus::SecretUnavailable,
                            format!("portal rejected the secret for {item} and no fresh one is available"),
                            Some(e.to_string()),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "secret refresh failed, keeping current secret");
                        self.emit(
                            &mut state,
                            ProgressEventKind::Warning {
                                message: format!("secret refresh failed, keeping current secret: {e}"),
                            },
                        );
                    }
                }
                secret_rejected = false;
            }

            state.attempts += 1;
            let result = self.client.attempt(session, item, &current.secret).await;
            self.record(&mut state, &result);

            match result.outcome() {
                Outcome::Success => {
                    let (status, message) = if result.kind == AttemptKind::AlreadyRegistered {
                        (
                            RunStatus::AlreadyRegistered,
                            format!("{item} is already registered"),
                        )
                    } else {
                        (RunStatus::Registered, format!("registered {item}"))
                    };
                    return self.finish(&mut state, status, message, None);
                }
                Outcome::Fatal => {
                    let (status, message) = if result.kind == AttemptKind::AuthExpired {
                        (
                            RunStatus::AuthExpired,
                            "authentication expired; log in again".to_string(),
                        )
                    } else {
                        (
                            RunStatus::BusinessRule,
                            format!("registration rejected: {}", result.message),
                        )
                    };
                    return self.finish(&mut state, status, message, Some(result.message));
                }
                Outcome::Retryable => {}
            }

            if result.kind.is_fault() {
                state.consecutive_faults += 1;
                let faults = state.consecutive_faults;
                if self.config.fault_warn_after > 0 && faults % self.config.fault_warn_after == 0 {
                    tracing::warn!(faults, last = %result.message, "portal keeps failing");
                    self.emit(
                        &mut state,
                        ProgressEventKind::Warning {
                            message: format!("{faults} consecutive faults, last: {}", result.message),
                        },
                    );
                }
                if self
                    .config
                    .max_consecutive_faults
                    .is_some_and(|max| faults >= max)
                {
                    return self.finish(
                        &mut state,
                        RunStatus::FaultsExhausted,
                        format!("stopped after {faults} consecutive faults"),
                        Some(result.message),
                    );
                }
            } else {
                state.consecutive_faults = 0;
            }
            if result.kind == AttemptKind::SecretRejected {
                secret_rejected = true;
            }

            if self.budget_spent(state.attempts) {
                return self.budget_exhausted(&mut state);
            }

            let delay = self.config.wait.delay(state.consecutive_faults);
            let next_index = state.attempts + 1;
            self.emit(
                &mut state,
                ProgressEventKind::Waiting {
                    next_index,
                    wait_ms: delay.as_millis() as u64,
                },
            );
            if !self.wait(delay).await {
                return self.cancelled(&mut state);
            }
        }
    }

    /// Sleep for `total` in slices. Returns `false` if cancelled first.
    async fn wait(&self, total: Duration) -> bool {
        let slice = self.config.wait.slice.max(Duration::from_millis(1));
        let deadline = tokio::time::Instant::now() + total;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(slice.min(deadline - now)).await;
        }
    }

    fn budget_spent(&self, attempts: u32) -> bool {
        self.config.max_attempts.is_some_and(|max| attempts >= max)
    }

    fn cancelled(&self, state: &mut RunState) -> RetryOutcome {
        let message = format!(
            "cancelled by user after {} attempts; capacity never opened",
            state.attempts
        );
        self.finish(state, RunStatus::Cancelled, message, None)
    }

    fn budget_exhausted(&self, state: &mut RunState) -> RetryOutcome {
        let message = format!(
            "gave up after {} attempts; capacity never opened",
            state.attempts
        );
        self.finish(state, RunStatus::BudgetExhausted, message, None)
    }

    fn record(&self, state: &mut RunState, result: &AttemptResult) {
        let record = AttemptRecord {
            index: state.attempts,
            timestamp: Utc::now(),
            kind: result.kind,
            outcome: result.outcome(),
            message: result.message.clone(),
        };
        tracing::info!(
            run_id = %state.run_id,
            attempt = record.index,
            kind = %record.kind,
            message = %record.message,
            "attempt finished"
        );
        self.emit(
            state,
            ProgressEventKind::AttemptFinished {
                index: record.index,
                kind: record.kind,
                message: record.message.clone(),
                http_status: result.http_status,
            },
        );
        state.last_attempt = Some(record);
    }

    fn emit_secret(&self, state: &mut RunState, acquired: &AcquiredSecret) {
        self.emit(
            state,
            ProgressEventKind::SecretAcquired {
                source: acquired.source,
                secret: acquired.secret.to_string(),
            },
        );
    }

    fn emit(&self, state: &mut RunState, event: ProgressEventKind) {
        let event = state.next_event(event);
        self.sink.emit(event);
    }

    fn finish(
        &self,
        state: &mut RunState,
        status: RunStatus,
        message: String,
        error: Option<String>,
    ) -> RetryOutcome {
        let elapsed = state.started.elapsed();
        let attempts = state.attempts;
        if status.is_success() {
            tracing::info!(run_id = %state.run_id, %status, attempts = state.attempts, "run finished");
        } else {
            tracing::warn!(run_id = %state.run_id, %status, attempts = state.attempts, error = ?error, "run finished");
        }
        self.emit(
            state,
            ProgressEventKind::Finished {
                success: status.is_success(),
                attempts,
                elapsed_ms: elapsed.as_millis() as u64,
                message: message.clone(),
            },
        );
        RetryOutcome {
            run_id: state.run_id.clone(),
            success: status.is_success(),
            status,
            attempts: state.attempts,
            elapsed,
            message,
            error,
            last_attempt: state.last_attempt.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRow;
    use crate::progress;
    use crate::test_support::ScriptedHttp;
    use crate::transport::TransportError;
    use serde_json::json;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            endpoints: PortalEndpoints::new("http://portal.test"),
            wait: WaitPolicy {
                interval: Duration::from_millis(5),
                slice: Duration::from_millis(1),
                max_interval: Duration::from_millis(40),
                ..WaitPolicy::default()
            },
            ..EngineConfig::default()
        }
    }

    fn item() -> TargetItem {
        TargetItem::new("C1", "形势与政策")
    }

    /// Session whose captured rows already hold a secret for `item()`.
    fn seeded_session() -> SessionState {
        let mut session = SessionState::new("tok", "B1", "");
        session.capture_rows([CatalogRow {
            class_id: "C1".to_string(),
            course_name: "形势与政策".to_string(),
            teacher: "张老师".to_string(),
            secret: Some("captured-secret".to_string()),
        }]);
        session
    }

    fn capacity_full() -> Result<crate::transport::HttpResponse, TransportError> {
        ScriptedHttp::json(200, json!({ "code": 400, "message": "课容量已满" }))
    }

    fn engine(http: Arc<ScriptedHttp>, config: EngineConfig) -> RetryEngine {
        RetryEngine::new(http, config, CancellationToken::new())
    }

    fn drain(rx: &mut progress::ProgressReceiver) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 200 }),
        )]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.status, RunStatus::Registered);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(http.calls(), 1);
        assert_eq!(
            http.requests()[0].form_field("secretVal"),
            Some("captured-secret")
        );
    }

    #[tokio::test]
    async fn test_capacity_full_then_success() {
        let http = Arc::new(ScriptedHttp::new(vec![
            capacity_full(),
            capacity_full(),
            capacity_full(),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let (tx, mut rx) = progress::channel();
        let outcome = engine(http.clone(), fast_config())
            .with_sink(Arc::new(tx))
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(http.calls(), 4);

        let events = drain(&mut rx);
        let waits = events
            .iter()
            .filter(|e| matches!(e.event, ProgressEventKind::Waiting { .. }))
            .count();
        assert_eq!(waits, 3);
        let attempts = events
            .iter()
            .filter(|e| matches!(e.event, ProgressEventKind::AttemptFinished { .. }))
            .count();
        assert_eq!(attempts, 4);
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert!(events.iter().all(|e| e.run_id == outcome.run_id));
    }

    #[tokio::test]
    async fn test_auth_expired_is_fatal() {
        let http = Arc::new(ScriptedHttp::new(vec![Ok(
            crate::transport::HttpResponse::new(401, ""),
        )]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, RunStatus::AuthExpired);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(http.calls(), 1);
        assert!(outcome.message.contains("authentication expired"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let http = Arc::new(ScriptedHttp::new(vec![capacity_full()]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = RetryEngine::new(http.clone(), fast_config(), cancel)
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(http.calls(), 0);
        assert!(outcome.status.capacity_never_opened());
    }

    #[tokio::test]
    async fn test_business_rule_stops_without_retry() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 400, "msg": "与已选课程时间冲突" }),
        )]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::BusinessRule);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error.as_deref(), Some("与已选课程时间冲突"));
        assert!(outcome.message.contains("与已选课程时间冲突"));
    }

    #[tokio::test]
    async fn test_already_registered_is_success() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 500, "msg": "该课程已在选课结果中" }),
        )]));
        let engine = engine(http.clone(), fast_config());
        let first = engine.run(&seeded_session(), &item()).await;
        let second = engine.run(&seeded_session(), &item()).await;

        for outcome in [&first, &second] {
            assert!(outcome.success);
            assert_eq!(outcome.status, RunStatus::AlreadyRegistered);
            assert_eq!(outcome.attempts, 1);
        }
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let http = Arc::new(ScriptedHttp::new(vec![capacity_full()]));
        let config = EngineConfig {
            max_attempts: Some(3),
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::BudgetExhausted);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(http.calls(), 3);
        assert!(outcome.message.contains("capacity never opened"));
        assert_eq!(
            outcome.last_attempt.map(|r| r.kind),
            Some(AttemptKind::CapacityFull)
        );
    }

    #[tokio::test]
    async fn test_single_attempt_mode() {
        let http = Arc::new(ScriptedHttp::new(vec![capacity_full()]));
        let (tx, mut rx) = progress::channel();
        let config = EngineConfig {
            max_attempts: Some(1),
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .with_sink(Arc::new(tx))
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::BudgetExhausted);
        assert_eq!(outcome.attempts, 1);
        // No pointless wait after the last permitted attempt.
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e.event, ProgressEventKind::Waiting { .. })));
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let http = Arc::new(ScriptedHttp::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Connect("refused".to_string())),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_fault_warning_and_cap() {
        let http = Arc::new(ScriptedHttp::new(vec![Err(TransportError::Timeout)]));
        let (tx, mut rx) = progress::channel();
        let config = EngineConfig {
            fault_warn_after: 2,
            max_consecutive_faults: Some(4),
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .with_sink(Arc::new(tx))
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::FaultsExhausted);
        assert_eq!(outcome.attempts, 4);
        let warnings = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e.event, ProgressEventKind::Warning { .. }))
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_business_response_resets_fault_counter() {
        let http = Arc::new(ScriptedHttp::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            capacity_full(),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let config = EngineConfig {
            max_consecutive_faults: Some(3),
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 6);
    }

    #[tokio::test]
    async fn test_rejected_secret_is_refreshed() {
        let http = Arc::new(ScriptedHttp::new(vec![
            ScriptedHttp::json(200, json!({ "code": 400, "msg": "secretVal无效" })),
            ScriptedHttp::json(
                200,
                json!({ "code": 200, "data": { "rows": [
                    { "JXBID": "C1", "KCM": "形势与政策", "secretVal": "fresh-secret" }
                ] } }),
            ),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        let requests = http.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].url.ends_with("/clazz/list"));
        assert_eq!(requests[2].form_field("secretVal"), Some("fresh-secret"));
    }

    #[tokio::test]
    async fn test_rejected_secret_without_replacement_is_fatal() {
        let http = Arc::new(ScriptedHttp::new(vec![
            ScriptedHttp::json(200, json!({ "code": 400, "msg": "secretVal无效" })),
            ScriptedHttp::json(200, json!({ "code": 200, "data": { "rows": [] } })),
        ]));
        let outcome = engine(http.clone(), fast_config())
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::SecretUnavailable);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_stale_secret_is_refreshed_before_attempt() {
        let http = Arc::new(ScriptedHttp::new(vec![
            ScriptedHttp::json(
                200,
                json!({ "code": 200, "data": { "rows": [
                    { "JXBID": "C1", "secretVal": "fresh-secret" }
                ] } }),
            ),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let config = EngineConfig {
            secret_max_age: Some(Duration::ZERO),
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        assert_eq!(
            http.requests()[1].form_field("secretVal"),
            Some("fresh-secret")
        );
    }

    #[tokio::test]
    async fn test_incomplete_session_fails_fast() {
        let http = Arc::new(ScriptedHttp::new(vec![]));
        let session = SessionState::new("", "B1", "");
        let outcome = engine(http.clone(), fast_config())
            .run(&session, &item())
            .await;

        assert_eq!(outcome.status, RunStatus::InvalidSession);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(http.calls(), 0);
    }

    #[tokio::test]
    async fn test_secret_failure_is_fatal_before_any_attempt() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 200, "data": { "rows": [] } }),
        )]));
        let session = SessionState::new("tok", "B1", "");
        let outcome = engine(http.clone(), fast_config())
            .run(&session, &item())
            .await;

        assert_eq!(outcome.status, RunStatus::SecretUnavailable);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(http.calls(), 1);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_wait_is_prompt() {
        let http = Arc::new(ScriptedHttp::new(vec![capacity_full()]));
        let cancel = CancellationToken::new();
        let config = EngineConfig {
            wait: WaitPolicy {
                interval: Duration::from_secs(30),
                slice: Duration::from_millis(100),
                ..WaitPolicy::default()
            },
            ..fast_config()
        };
        let engine = RetryEngine::new(http.clone(), config, cancel.clone());

        let trigger = cancel.clone();
        let cancelled_at = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let at = Instant::now();
            trigger.cancel();
            at
        });

        let outcome = engine.run(&seeded_session(), &item()).await;
        let finished = Instant::now();
        let cancelled_at = cancelled_at.await.unwrap();

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.attempts, 1);
        // Noticed within one 100 ms slice, plus scheduling slack.
        assert!(finished.duration_since(cancelled_at) <= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_secret_lookup() {
        let http = Arc::new(ScriptedHttp::new(vec![ScriptedHttp::json(
            200,
            json!({ "code": 200, "data": { "rows": [] } }),
        )]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = SessionState::new("tok", "B1", "");
        let outcome = RetryEngine::new(http.clone(), fast_config(), cancel)
            .run(&session, &item())
            .await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(http.calls(), 0);
    }

    /// Cancels the run from inside the catalog query, then fails it.
    struct CancelOnPost(CancellationToken);

    #[async_trait::async_trait]
    impl crate::transport::HttpCapability for CancelOnPost {
        async fn post(
            &self,
            _request: crate::transport::HttpRequest,
        ) -> Result<crate::transport::HttpResponse, TransportError> {
            self.0.cancel();
            Err(TransportError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_secret_lookup_wins_over_its_failure() {
        let cancel = CancellationToken::new();
        let http = Arc::new(CancelOnPost(cancel.clone()));
        let session = SessionState::new("tok", "B1", "");
        let outcome = RetryEngine::new(http, fast_config(), cancel)
            .run(&session, &item())
            .await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_default_config_caps_endless_garbage() {
        let http = Arc::new(ScriptedHttp::new(vec![Ok(
            crate::transport::HttpResponse::new(200, "<html>maintenance</html>"),
        )]));
        let config = EngineConfig {
            endpoints: PortalEndpoints::new("http://portal.test"),
            wait: WaitPolicy {
                interval: Duration::from_millis(1),
                slice: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                ..WaitPolicy::default()
            },
            max_attempts: Some(200),
            ..EngineConfig::default()
        };
        let outcome = engine(http.clone(), config)
            .run(&seeded_session(), &item())
            .await;

        assert_eq!(outcome.status, RunStatus::FaultsExhausted);
        assert_eq!(outcome.attempts, DEFAULT_MAX_CONSECUTIVE_FAULTS);
        assert_eq!(
            outcome.last_attempt.map(|r| r.kind),
            Some(AttemptKind::Malformed)
        );
    }

    #[tokio::test]
    async fn test_backoff_applies_only_during_fault_streak() {
        let http = Arc::new(ScriptedHttp::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            capacity_full(),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let (tx, mut rx) = progress::channel();
        let config = EngineConfig {
            wait: WaitPolicy {
                interval: Duration::from_millis(5),
                slice: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_interval: Duration::from_millis(20),
            },
            ..fast_config()
        };
        let outcome = engine(http.clone(), config)
            .with_sink(Arc::new(tx))
            .run(&seeded_session(), &item())
            .await;

        assert!(outcome.success);
        let waits: Vec<u64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.event {
                ProgressEventKind::Waiting { wait_ms, .. } => Some(wait_ms),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![10, 20, 20, 5]);
    }

    #[test]
    fn test_wait_delay() {
        let policy = WaitPolicy {
            interval: Duration::from_secs(1),
            slice: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_interval: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));

        let flat = WaitPolicy {
            backoff_factor: 1.0,
            ..policy
        };
        assert_eq!(flat.delay(5), Duration::from_secs(1));
    }

    #[test]
    fn test_run_blocking_matches_async() {
        let http = Arc::new(ScriptedHttp::new(vec![
            capacity_full(),
            ScriptedHttp::json(200, json!({ "code": 200 })),
        ]));
        let outcome = engine(http.clone(), fast_config()).run_blocking(&seeded_session(), &item());

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn test_status_helpers() {
        assert!(RunStatus::AlreadyRegistered.is_success());
        assert!(!RunStatus::Cancelled.is_success());
        assert!(RunStatus::BudgetExhausted.capacity_never_opened());
        assert!(!RunStatus::AuthExpired.capacity_never_opened());
    }
}
