//! Per-endpoint cooldown gate (circuit breaker).
//!
//! # States
//!
//! ```text
//!            failure (streak < threshold)
//!              ┌──────┐
//!              ▼      │
//!         ┌──────────────┐  streak reaches threshold   ┌──────────────┐
//!  ──────►│    Closed    │ ───────────────────────────►│   Cooling    │
//!         │  streak = n  │                             │ until = t+W  │
//!         └──────────────┘◄─────────────────────────── └──────────────┘
//!            ▲     │          now >= until (streak = 0)
//!            └─────┘
//!            success (streak = 0)
//! ```
//!
//! While cooling, [`CooldownGate::may_attempt`] answers `false` and callers
//! must not touch the network. Once the window has passed the endpoint is
//! treated as closed with an empty streak. A single failure after that does
//! not re-trip; the threshold has to be reached again.
//!
//! One [`GateState`] exists per [`Endpoint`]; the registry is built once at
//! startup and shared via `Arc`. Only the retry executor records outcomes.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::classifier::ErrorCategory;

/// Trip threshold used when none is configured.
pub const DEFAULT_TRIP_THRESHOLD: u32 = 5;

/// Cooldown window used when none is configured.
pub const DEFAULT_COOLDOWN_WINDOW: Duration = Duration::from_secs(120);

/// Shortest cooldown window a gate accepts.
pub const MIN_COOLDOWN_WINDOW: Duration = Duration::from_millis(1);

/// A remote service the pipeline calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// Remote vision model.
    Vision,
    /// Remote text-generation model.
    Text,
}

impl Endpoint {
    /// Every endpoint the registry tracks.
    pub const ALL: [Endpoint; 2] = [Endpoint::Vision, Endpoint::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Vision => "vision",
            Endpoint::Text => "text",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure-streak state of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateState {
    /// Failures since the last success, clamped at the trip threshold.
    pub consecutive_failures: u32,
    /// End of the current cooldown window, if tripped.
    pub cooldown_until: Option<Instant>,
    /// Category of the most recent failure.
    pub last_category: Option<ErrorCategory>,
}

impl GateState {
    /// Whether this state rejects attempts at `now`.
    pub fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// The state as it should be observed at `now`: an expired cooldown
    /// reads as a fresh closed gate.
    fn effective(&self, now: Instant) -> GateState {
        match self.cooldown_until {
            Some(until) if now >= until => GateState::default(),
            _ => self.clone(),
        }
    }
}

/// What a recorded failure did to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// Still closed; streak incremented.
    Counted { consecutive_failures: u32 },
    /// This failure tripped the gate.
    Tripped { cooldown: Duration },
    /// Gate was already cooling; nothing changed.
    AlreadyCooling,
}

/// Registry of gate states, one per endpoint.
#[derive(Debug)]
pub struct CooldownGate {
    trip_threshold: u32,
    cooldown_window: Duration,
    states: RwLock<HashMap<Endpoint, GateState>>,
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(DEFAULT_TRIP_THRESHOLD, DEFAULT_COOLDOWN_WINDOW)
    }
}

impl CooldownGate {
    /// Create a registry with every endpoint closed.
    ///
    /// A `trip_threshold` of zero is treated as one, and the cooldown
    /// window is at least one millisecond.
    pub fn new(trip_threshold: u32, cooldown_window: Duration) -> Self {
        let states = Endpoint::ALL
            .iter()
            .map(|endpoint| (*endpoint, GateState::default()))
            .collect();
        Self {
            trip_threshold: trip_threshold.max(1),
            cooldown_window: cooldown_window.max(MIN_COOLDOWN_WINDOW),
            states: RwLock::new(states),
        }
    }

    pub fn trip_threshold(&self) -> u32 {
        self.trip_threshold
    }

    pub fn cooldown_window(&self) -> Duration {
        self.cooldown_window
    }

    /// Whether a network call to `endpoint` is allowed right now.
    ///
    /// Read-only: calling it any number of times never changes gate state.
    pub async fn may_attempt(&self, endpoint: Endpoint) -> bool {
        let states = self.states.read().await;
        states
            .get(&endpoint)
            .map(|state| !state.is_cooling(Instant::now()))
            .unwrap_or(true)
    }

    /// Observable state of `endpoint`.
    pub async fn snapshot(&self, endpoint: Endpoint) -> GateState {
        let states = self.states.read().await;
        states
            .get(&endpoint)
            .map(|state| state.effective(Instant::now()))
            .unwrap_or_default()
    }

    /// Time left in the cooldown window, if `endpoint` is cooling.
    pub async fn cooldown_remaining(&self, endpoint: Endpoint) -> Option<Duration> {
        let now = Instant::now();
        let states = self.states.read().await;
        states
            .get(&endpoint)
            .and_then(|state| state.cooldown_until)
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Reset the streak after a successful attempt.
    pub(crate) async fn record_success(&self, endpoint: Endpoint) {
        let mut states = self.states.write().await;
        let state = states.entry(endpoint).or_default();
        if state.consecutive_failures > 0 || state.cooldown_until.is_some() {
            info!(
                endpoint = %endpoint,
                previous_failures = state.consecutive_failures,
                "Endpoint recovered, failure streak reset"
            );
        }
        *state = GateState::default();
    }

    /// Count a failed attempt, tripping the gate at the threshold.
    pub(crate) async fn record_failure(
        &self,
        endpoint: Endpoint,
        category: ErrorCategory,
    ) -> GateTransition {
        let now = Instant::now();
        let mut states = self.states.write().await;
        let state = states.entry(endpoint).or_default();

        if state.cooldown_until.is_some_and(|until| now >= until) {
            info!(endpoint = %endpoint, "Cooldown expired, gate closed again");
            *state = GateState::default();
        }

        if state.is_cooling(now) {
            return GateTransition::AlreadyCooling;
        }

        state.last_category = Some(category);

        state.consecutive_failures = (state.consecutive_failures + 1).min(self.trip_threshold);
        if state.consecutive_failures >= self.trip_threshold {
            state.cooldown_until = Some(now + self.cooldown_window);
            warn!(
                endpoint = %endpoint,
                failures = state.consecutive_failures,
                cooldown_secs = self.cooldown_window.as_secs(),
                category = %category,
                "Gate tripped, endpoint cooling down"
            );
            GateTransition::Tripped {
                cooldown: self.cooldown_window,
            }
        } else {
            GateTransition::Counted {
                consecutive_failures: state.consecutive_failures,
            }
        }
    }
}
