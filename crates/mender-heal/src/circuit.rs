//! Named circuit breakers.
//!
//! Breakers are opt-in and created lazily on the first reported failure.
//! The registry never runs operations itself unless asked to through
//! [`CircuitBreakerRegistry::call`] / [`CircuitBreakerRegistry::call_async`];
//! otherwise callers report outcomes with `record_success` / `record_failure`.
//!
//! ```text
//!   closed ──(failures >= threshold)──▶ open
//!     ▲                                  │ cooldown elapsed, next check
//!     │ success                          ▼
//!     └──────────────────────────── half-open ──(failure)──▶ open
//! ```
//!
//! A half-open trial that reports neither outcome within one cooldown is
//! treated as abandoned and the trial is handed out again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::action::{ActionKind, ActionLog, HealingAction};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-failing until the cooldown elapses.
    Open,
    /// A single trial call is permitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Threshold and cooldown for a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerPolicy {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
        }
    }
}

/// Error returned by the guarded-call combinators.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call; the operation was not invoked.
    #[error("circuit '{0}' is open")]
    Open(String),
    /// The operation ran and failed.
    #[error("{0}")]
    Failed(E),
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub cooldown_seconds: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    cooldown: Duration,
    /// Always `Some` while open.
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    /// When the outstanding half-open trial was handed out.
    trial_started: Option<Instant>,
}

impl Breaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            cooldown,
            opened_at: None,
            opened_at_wall: None,
            trial_started: None,
        }
    }

    /// Hand out the half-open trial unless a live one is outstanding.
    fn claim_trial(&mut self) -> bool {
        let outstanding = self
            .trial_started
            .is_some_and(|at| at.elapsed() <= self.cooldown);
        if !outstanding {
            self.trial_started = Some(Instant::now());
        }
        !outstanding
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failures: self.failures,
            cooldown_seconds: self.cooldown.as_secs(),
            opened_at: self.opened_at_wall,
        }
    }
}

/// Registry of named breakers sharing one lock.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    log: Arc<ActionLog>,
}

impl CircuitBreakerRegistry {
    pub fn new(log: Arc<ActionLog>) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Whether a call through `name` may proceed.
    ///
    /// Unknown names are always allowed. An open breaker whose cooldown has
    /// elapsed flips to half-open and hands out its single trial. A trial
    /// unreported for longer than the cooldown is handed out again.
    pub fn check_circuit(&self, name: &str) -> bool {
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(name) else {
            return true;
        };
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_none_or(|at| at.elapsed() > breaker.cooldown);
                if cooled {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_started = Some(Instant::now());
                    info!(circuit = %name, "circuit half-open, allowing trial call");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                let reissued = breaker.trial_started.is_some();
                if !breaker.claim_trial() {
                    debug!(circuit = %name, "half-open trial already in flight");
                    return false;
                }
                if reissued {
                    info!(circuit = %name, "half-open trial never reported, allowing another");
                }
                true
            }
        }
    }

    /// Record a successful call. Closes a half-open breaker.
    pub fn record_success(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        let Some(breaker) = breakers.get_mut(name) else {
            return;
        };
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Closed;
                breaker.failures = 0;
                breaker.trial_started = None;
                breaker.opened_at = None;
                breaker.opened_at_wall = None;
                info!(circuit = %name, "circuit closed after successful trial");
            }
            CircuitState::Closed => breaker.failures = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed call, opening the breaker once `failures >= threshold`.
    pub fn record_failure(&self, name: &str, policy: BreakerPolicy) {
        let opened = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers
                .entry(name.to_string())
                .or_insert_with(|| Breaker::new(policy.cooldown));
            breaker.failures = breaker.failures.saturating_add(1);
            breaker.trial_started = None;
            debug!(circuit = %name, failures = breaker.failures, "circuit failure recorded");

            if breaker.failures >= policy.threshold {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.opened_at_wall = Some(Utc::now());
                Some(breaker.cooldown)
            } else {
                None
            }
        };

        if let Some(cooldown) = opened {
            self.log.record(
                HealingAction::new(
                    ActionKind::CircuitOpen,
                    format!(
                        "Circuit breaker '{name}' opened after {} failures",
                        policy.threshold
                    ),
                    true,
                )
                .with_details(json!({ "cooldown_seconds": cooldown.as_secs() })),
            );
        }
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.lock().get(name).map(|b| b.state)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, b)| (name.clone(), b.snapshot()))
            .collect()
    }

    /// Names of breakers currently open, sorted.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .lock()
            .iter()
            .filter(|(_, b)| b.state == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }

    /// Check the breaker, run `op`, and record its outcome.
    ///
    /// A rejected call is not counted as a failure.
    pub fn call<T, E, F>(&self, name: &str, policy: BreakerPolicy, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.check_circuit(name) {
            debug!(circuit = %name, "circuit open, skipping call");
            return Err(CircuitError::Open(name.to_string()));
        }
        match op() {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(name, policy);
                Err(CircuitError::Failed(e))
            }
        }
    }

    /// Async twin of [`call`](Self::call).
    pub async fn call_async<T, E, F, Fut>(
        &self,
        name: &str,
        policy: BreakerPolicy,
        op: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.check_circuit(name) {
            debug!(circuit = %name, "circuit open, skipping call");
            return Err(CircuitError::Open(name.to_string()));
        }
        match op().await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(name, policy);
                Err(CircuitError::Failed(e))
            }
        }
    }
}
