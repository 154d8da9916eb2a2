//! Retry executor for remote calls with category-aware backoff.
//!
//! One [`RetryExecutor::execute`] call drives up to `max_attempts` attempts
//! of a single remote operation against one [`Endpoint`]:
//!
//! ```text
//!   ┌──────────────┐  no   ┌─────────────────────────────┐
//!   │ may_attempt? │──────►│ return last / GateRejected  │
//!   └──────┬───────┘       └─────────────────────────────┘
//!          │ yes
//!          ▼
//!   ┌──────────────┐  ok   ┌──────────────────────────────┐
//!   │  operation() │──────►│ record_success, return value │
//!   └──────┬───────┘       └──────────────────────────────┘
//!          │ err
//!          ▼
//!   classify → record_failure → stop? ──yes──► return failure
//!          │ no
//!          ▼
//!   sleep(next_delay) racing the cancellation token, loop
//! ```
//!
//! The executor is the only component that records outcomes on the
//! [`CooldownGate`]. An attempt abandoned through cancellation is never
//! recorded.
//!
//! # Usage
//!
//! ```ignore
//! use pet_commentary::gate::{CooldownGate, Endpoint};
//! use pet_commentary::retry::RetryExecutor;
//!
//! let executor = RetryExecutor::new(Arc::new(CooldownGate::default()));
//! let outcome = executor
//!     .execute(Endpoint::Text, || async { provider.chat(&messages, None).await })
//!     .await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::classifier::{classify, ErrorCategory};
use crate::error::{CommentaryError, Result};
use crate::gate::{CooldownGate, Endpoint, GateTransition};

/// Default number of attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// Outcome types
// ============================================================================

/// Why a call ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// The operation itself failed.
    Call,
    /// The gate was cooling; the network was not contacted.
    GateRejected,
    /// The host cancelled the call.
    Cancelled,
}

/// A failed call outcome. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: Instant,
    pub origin: FailureOrigin,
}

impl CallFailure {
    fn from_error(error: &CommentaryError, category: ErrorCategory) -> Self {
        Self {
            category,
            message: error.to_string(),
            timestamp: Instant::now(),
            origin: FailureOrigin::Call,
        }
    }

    fn gate_rejected(endpoint: Endpoint) -> Self {
        Self {
            category: ErrorCategory::Connection,
            message: format!("{} endpoint is cooling down", endpoint),
            timestamp: Instant::now(),
            origin: FailureOrigin::GateRejected,
        }
    }

    fn cancelled() -> Self {
        Self {
            category: ErrorCategory::Unknown,
            message: "call cancelled".to_string(),
            timestamp: Instant::now(),
            origin: FailureOrigin::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.origin == FailureOrigin::Cancelled
    }

    pub fn is_gate_rejected(&self) -> bool {
        self.origin == FailureOrigin::GateRejected
    }
}

/// Result of one call: a value, or the failure that ended the call.
pub type CallOutcome<T> = std::result::Result<T, CallFailure>;

/// Outcome of a single attempt, for observability.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptStatus {
    Succeeded,
    Failed { category: ErrorCategory, message: String },
}

/// One attempt within a call.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt_number: u32,
    pub status: AttemptStatus,
    /// Sleep taken before the following attempt; `None` when the call ended here.
    pub delay_before_next: Option<Duration>,
}

enum AttemptResult<T> {
    Done(Result<T>),
    Cancelled,
}

// ============================================================================
// Executor
// ============================================================================

/// Drives repeated attempts of one remote call under a [`BackoffPolicy`]
/// and a shared [`CooldownGate`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    max_attempts: u32,
    gate: Arc<CooldownGate>,
    attempt_timeout: Option<Duration>,
    cancel: CancellationToken,
    log_retries: bool,
}

impl RetryExecutor {
    /// Create an executor with the default policy and attempt budget.
    pub fn new(gate: Arc<CooldownGate>) -> Self {
        Self {
            policy: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            gate,
            attempt_timeout: None,
            cancel: CancellationToken::new(),
            log_retries: true,
        }
    }

    /// Disable per-attempt logging.
    pub fn silent(mut self) -> Self {
        self.log_retries = false;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the attempt budget. Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Bound each attempt; an elapsed attempt fails with `Timeout`.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Abandon in-flight calls when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn gate(&self) -> &Arc<CooldownGate> {
        &self.gate
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Upper bound on time spent sleeping between attempts of one call.
    pub fn worst_case_budget(&self) -> Duration {
        self.policy.worst_case_budget(self.max_attempts)
    }

    /// Run `operation` until it succeeds, a stop condition is met, or the
    /// attempt budget is spent.
    pub async fn execute<F, Fut, T>(&self, endpoint: Endpoint, operation: F) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_records(endpoint, operation).await.0
    }

    /// Like [`execute`](Self::execute), also returning the attempt records.
    pub async fn execute_with_records<F, Fut, T>(
        &self,
        endpoint: Endpoint,
        mut operation: F,
    ) -> (CallOutcome<T>, Vec<AttemptRecord>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut records = Vec::new();
        let mut last_failure: Option<CallFailure> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if self.cancel.is_cancelled() {
                return (Err(CallFailure::cancelled()), records);
            }

            if !self.gate.may_attempt(endpoint).await {
                if self.log_retries {
                    debug!(endpoint = %endpoint, attempt, "Gate is cooling, skipping network call");
                }
                let failure = last_failure.unwrap_or_else(|| CallFailure::gate_rejected(endpoint));
                return (Err(failure), records);
            }

            let error = match self.run_attempt(&mut operation).await {
                AttemptResult::Cancelled => {
                    if self.log_retries {
                        info!(endpoint = %endpoint, attempt, "Attempt abandoned on cancellation");
                    }
                    return (Err(CallFailure::cancelled()), records);
                }
                AttemptResult::Done(Ok(value)) => {
                    self.gate.record_success(endpoint).await;
                    records.push(AttemptRecord {
                        attempt_number: attempt,
                        status: AttemptStatus::Succeeded,
                        delay_before_next: None,
                    });
                    if attempt > 1 && self.log_retries {
                        info!(endpoint = %endpoint, attempts = attempt, "Call succeeded after retries");
                    }
                    return (Ok(value), records);
                }
                AttemptResult::Done(Err(error)) => error,
            };

            let category = classify(&error);
            let transition = self.gate.record_failure(endpoint, category).await;
            let failure = CallFailure::from_error(&error, category);

            let gate_open = matches!(transition, GateTransition::Counted { .. });
            let retryable = category.is_retryable() && !error.is_permanent();
            let delay = (retryable && gate_open && attempt < self.max_attempts)
                .then(|| self.policy.next_delay_with_hint(attempt, category, error.retry_after()));

            records.push(AttemptRecord {
                attempt_number: attempt,
                status: AttemptStatus::Failed {
                    category,
                    message: failure.message.clone(),
                },
                delay_before_next: delay,
            });

            let Some(delay) = delay else {
                if self.log_retries {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        max_attempts = self.max_attempts,
                        category = %category,
                        retryable,
                        gate_open,
                        "Call failed, giving up: {}",
                        error
                    );
                }
                return (Err(failure), records);
            };

            if self.log_retries {
                warn!(
                    endpoint = %endpoint,
                    attempt,
                    max_attempts = self.max_attempts,
                    category = %category,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying: {}",
                    error
                );
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return (Err(CallFailure::cancelled()), records);
                }
                _ = sleep(delay) => {}
            }

            last_failure = Some(failure);
        }
    }

    async fn run_attempt<F, Fut, T>(&self, operation: &mut F) -> AttemptResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call = operation();
        let bounded = async {
            match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(CommentaryError::Timeout)),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => AttemptResult::Cancelled,
            result = bounded => AttemptResult::Done(result),
        }
    }
}
