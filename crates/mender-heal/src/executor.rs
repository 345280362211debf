//! SafeExecutor: bounded retry with exponential backoff and a fallback value.
//!
//! Failures of the wrapped operation never escape: once the retry budget for
//! a `component.operation` key is spent, the caller's fallback is returned
//! and the failure is only recorded in the [`ActionLog`].
//!
//! The wrapped operation may run more than once with the same inputs, so it
//! must tolerate repetition.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mender_core::settings::RetrySettings;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::action::{ActionKind, ActionLog, HealingAction};
use crate::circuit::{BreakerPolicy, CircuitBreakerRegistry};
use crate::counter::{error_key, ErrorCounter};
use crate::error::{HealError, HealResult};

/// Retry limits and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: settings.backoff_base(),
            backoff_cap: settings.backoff_cap(),
        }
    }

    /// Sleep before the retry that follows failure number `count` (1-based):
    /// `base * 2^(count-1)`, capped.
    pub fn backoff(&self, count: u32) -> Duration {
        let factor = 2u32
            .checked_pow(count.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

enum Next {
    Retry(Duration),
    GiveUp,
}

/// Runs operations under the retry policy, sharing one counter and log.
#[derive(Clone)]
pub struct SafeExecutor {
    policy: RetryPolicy,
    counter: Arc<ErrorCounter>,
    log: Arc<ActionLog>,
}

impl SafeExecutor {
    pub fn new(policy: RetryPolicy, counter: Arc<ErrorCounter>, log: Arc<ActionLog>) -> Self {
        Self {
            policy,
            counter,
            log,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Start configuring a call of `operation` in `component`.
    pub fn call<'a>(&'a self, component: &'a str, operation: &'a str) -> Call<'a> {
        Call {
            executor: self,
            component,
            operation,
            deadline: None,
            cancel: None,
            breaker: None,
        }
    }

    /// Run `op` with retries, returning `fallback` once they are exhausted.
    pub fn execute<T, E, F>(&self, component: &str, operation: &str, fallback: T, op: F) -> T
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        self.call(component, operation).run(fallback, op)
    }

    /// Async twin of [`execute`](Self::execute). Backoff sleeps suspend only the calling task.
    pub async fn execute_async<T, E, F, Fut>(
        &self,
        component: &str,
        operation: &str,
        fallback: T,
        op: F,
    ) -> HealResult<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call(component, operation).run_async(fallback, op).await
    }

    /// Turn `op` into a closure that always goes through this executor.
    pub fn wrap<T, E, F>(
        &self,
        component: &str,
        operation: &str,
        fallback: T,
        mut op: F,
    ) -> impl FnMut() -> T + use<T, E, F>
    where
        T: Clone,
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let executor = self.clone();
        let component = component.to_string();
        let operation = operation.to_string();
        move || {
            executor
                .call(&component, &operation)
                .run(fallback.clone(), &mut op)
        }
    }

    fn succeeded(&self, key: &str) {
        self.counter.reset(key);
    }

    /// Count a failure and decide whether another attempt is allowed.
    fn failed(
        &self,
        key: &str,
        error: &dyn Display,
        attempts: u32,
        elapsed: Duration,
        deadline: Option<Duration>,
    ) -> Next {
        let count = self.counter.increment(key);
        if count > self.policy.max_retries {
            self.record_fallback(key, error, attempts, "retries exhausted");
            return Next::GiveUp;
        }

        let delay = self.policy.backoff(count);
        if let Some(budget) = deadline {
            if elapsed.saturating_add(delay) > budget {
                self.record_fallback(key, error, attempts, "deadline");
                return Next::GiveUp;
            }
        }

        self.log.record(
            HealingAction::new(
                ActionKind::Retrying,
                format!("Retrying {key} (attempt {count}/{})", self.policy.max_retries),
                false,
            )
            .with_error(error)
            .with_details(json!({
                "error": error.to_string(),
                "attempt": count,
                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            })),
        );
        Next::Retry(delay)
    }

    fn record_fallback(&self, key: &str, error: &dyn Display, attempts: u32, reason: &str) {
        self.log.record(
            HealingAction::new(
                ActionKind::Fallback,
                format!("Using fallback for {key} after {attempts} attempts"),
                true,
            )
            .with_error(error)
            .with_details(json!({
                "error": error.to_string(),
                "attempts": attempts,
                "reason": reason,
            })),
        );
    }
}

/// A configured SafeExecutor call. Finish with [`run`](Call::run) or
/// [`run_async`](Call::run_async).
pub struct Call<'a> {
    executor: &'a SafeExecutor,
    component: &'a str,
    operation: &'a str,
    deadline: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
    breaker: Option<(&'a CircuitBreakerRegistry, BreakerPolicy)>,
}

impl<'a> Call<'a> {
    /// Overall time budget. A retry whose backoff would overrun it is skipped
    /// and the fallback returned instead.
    pub fn deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(budget);
        self
    }

    /// Abort a pending async backoff once `cancel` reads `true`.
    pub fn cancel_on(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Guard every attempt with the breaker named after the component.
    ///
    /// A rejected attempt returns the fallback without invoking the operation
    /// or counting a failure.
    pub fn guarded_by(mut self, registry: &'a CircuitBreakerRegistry, policy: BreakerPolicy) -> Self {
        self.breaker = Some((registry, policy));
        self
    }

    fn admitted(&self, key: &str, attempts: u32) -> bool {
        let Some((registry, _)) = self.breaker else {
            return true;
        };
        if registry.check_circuit(self.component) {
            return true;
        }
        debug!(%key, circuit = %self.component, "circuit open, skipping attempt");
        self.executor.record_fallback(
            key,
            &format!("circuit '{}' is open", self.component),
            attempts,
            "circuit open",
        );
        false
    }

    fn report(&self, ok: bool) {
        if let Some((registry, policy)) = self.breaker {
            if ok {
                registry.record_success(self.component);
            } else {
                registry.record_failure(self.component, policy);
            }
        }
    }

    /// Blocking run. Backoff sleeps the calling thread only.
    pub fn run<T, E, F>(self, fallback: T, mut op: F) -> T
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let key = error_key(self.component, self.operation);
        let started = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            if !self.admitted(&key, attempts) {
                return fallback;
            }
            attempts += 1;
            match op() {
                Ok(value) => {
                    self.report(true);
                    self.executor.succeeded(&key);
                    return value;
                }
                Err(e) => {
                    self.report(false);
                    debug!(%key, attempt = attempts, error = %e, "operation failed");
                    match self.executor.failed(&key, &e, attempts, started.elapsed(), self.deadline) {
                        Next::Retry(delay) => std::thread::sleep(delay),
                        Next::GiveUp => return fallback,
                    }
                }
            }
        }
    }

    /// Non-blocking run.
    ///
    /// Returns [`HealError::Cancelled`] if the cancel signal fires during a
    /// backoff sleep; cancellation is not counted as a failure.
    pub async fn run_async<T, E, F, Fut>(mut self, fallback: T, mut op: F) -> HealResult<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = error_key(self.component, self.operation);
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            if !self.admitted(&key, attempts) {
                return Ok(fallback);
            }
            attempts += 1;
            let error = match op().await {
                Ok(value) => {
                    self.report(true);
                    self.executor.succeeded(&key);
                    return Ok(value);
                }
                Err(e) => e,
            };
            self.report(false);
            debug!(%key, attempt = attempts, error = %error, "operation failed");

            let delay = match self
                .executor
                .failed(&key, &error, attempts, started.elapsed(), self.deadline)
            {
                Next::Retry(delay) => delay,
                Next::GiveUp => return Ok(fallback),
            };

            match self.cancel.as_mut() {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        _ = cancelled(cancel) => {
                            debug!(%key, "retry cancelled during backoff");
                            return Err(HealError::Cancelled { key });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Resolves once the signal reads `true`. A dropped sender never cancels.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_retries: u32, base_ms: u64) -> SafeExecutor {
        SafeExecutor::new(
            RetryPolicy {
                max_retries,
                backoff_base: Duration::from_millis(base_ms),
                backoff_cap: Duration::from_secs(60),
            },
            Arc::new(ErrorCounter::new()),
            Arc::new(ActionLog::default()),
        )
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        };
        let delays: Vec<_> = (1..=8).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
        for n in 1..40 {
            assert!(policy.backoff(n) <= policy.backoff(n + 1));
        }
    }

    #[test]
    fn always_failing_runs_max_retries_plus_one() {
        let exec = executor(3, 1);
        let calls = Cell::new(0);
        let result = exec.execute("memory", "load", -1, || {
            calls.set(calls.get() + 1);
            Err::<i32, _>("disk on fire")
        });
        assert_eq!(result, -1);
        assert_eq!(calls.get(), 4);
        assert_eq!(exec.log.count_kind(ActionKind::Retrying), 3);
        assert_eq!(exec.log.count_kind(ActionKind::Fallback), 1);

        let fallback = exec.log.recent(1).remove(0);
        assert_eq!(fallback.details["attempts"], 4);
        assert_eq!(fallback.error, "disk on fire");
    }

    #[test]
    fn success_resets_counter() {
        let exec = executor(5, 1);
        let calls = Cell::new(0);
        let value = exec.execute("memory", "save", 0, || {
            calls.set(calls.get() + 1);
            if calls.get() < 4 { Err("busy") } else { Ok(7) }
        });
        assert_eq!(value, 7);
        assert_eq!(exec.counter.get("memory.save"), 0);
    }

    #[test]
    fn two_failures_then_success_with_two_retries() {
        let exec = executor(2, 1);
        let calls = Cell::new(0);
        let value = exec.execute("provider", "chat", "fallback", || {
            calls.set(calls.get() + 1);
            if calls.get() <= 2 { Err("timeout") } else { Ok("answer") }
        });
        assert_eq!(value, "answer");
        assert_eq!(exec.counter.get("provider.chat"), 0);
        assert_eq!(exec.log.count_kind(ActionKind::Retrying), 2);
        assert_eq!(exec.log.count_kind(ActionKind::Fallback), 0);
    }

    #[test]
    fn retrying_actions_carry_attempt_and_delay() {
        let exec = executor(2, 10);
        exec.execute("a", "b", (), || Err::<(), _>("nope"));
        let retries: Vec<_> = exec
            .log
            .recent(10)
            .into_iter()
            .filter(|a| a.kind == ActionKind::Retrying)
            .collect();
        assert_eq!(retries[0].details["attempt"], 1);
        assert_eq!(retries[0].details["delay_ms"], 10);
        assert_eq!(retries[1].details["delay_ms"], 20);
        assert!(!retries[0].success);
    }

    #[test]
    fn deadline_gives_up_before_sleeping_past_it() {
        let exec = executor(5, 50);
        let calls = Cell::new(0);
        let result = exec
            .call("search", "query")
            .deadline(Duration::from_millis(10))
            .run(Vec::<u8>::new(), || {
                calls.set(calls.get() + 1);
                Err::<Vec<u8>, _>("slow")
            });
        assert!(result.is_empty());
        assert_eq!(calls.get(), 1);
        let fallback = exec.log.recent(1).remove(0);
        assert_eq!(fallback.kind, ActionKind::Fallback);
        assert_eq!(fallback.details["reason"], "deadline");
    }

    #[test]
    fn wrap_produces_reusable_closure() {
        let exec = executor(1, 1);
        let mut healthy = false;
        let mut ping = exec.wrap("net", "ping", false, move || {
            let result = if healthy { Ok(true) } else { Err("unreachable") };
            healthy = true;
            result
        });
        assert!(ping());
        assert!(ping());
        assert_eq!(exec.counter.get("net.ping"), 0);
    }

    #[test]
    fn open_circuit_short_circuits_to_fallback() {
        let exec = executor(3, 1);
        let registry = CircuitBreakerRegistry::new(exec.log.clone());
        let policy = BreakerPolicy::new(2, Duration::from_secs(60));
        let calls = Cell::new(0);

        let first = exec
            .call("provider", "chat")
            .guarded_by(&registry, policy)
            .run("offline", || {
                calls.set(calls.get() + 1);
                Err::<&str, _>("refused")
            });
        assert_eq!(first, "offline");
        // Two failures open the breaker; the third attempt is rejected.
        assert_eq!(calls.get(), 2);
        assert_eq!(registry.open_circuits(), vec!["provider".to_string()]);
        assert_eq!(registry.snapshot()["provider"].failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn async_retry_bound_and_backoff() {
        let exec = executor(3, 1000);
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = exec
            .execute_async("tools", "run", 0u8, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u8, _>("exit 1")
            })
            .await
            .unwrap();
        assert_eq!(result, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of virtual backoff.
        assert_eq!(started.elapsed().as_secs(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn async_cancel_aborts_pending_backoff() {
        let exec = executor(3, 1000);
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let exec = exec.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                exec.call("sched", "tick")
                    .cancel_on(rx)
                    .run_async((), || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>("fail")
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(HealError::Cancelled { ref key }) if key == "sched.tick"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.log.count_kind(ActionKind::Fallback), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_cancel_sender_does_not_cancel() {
        let exec = executor(1, 100);
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let calls = AtomicU32::new(0);
        let result = exec
            .call("x", "y")
            .cancel_on(rx)
            .run_async(5, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 { Err("once") } else { Ok(9) }
            })
            .await
            .unwrap();
        assert_eq!(result, 9);
    }
}
