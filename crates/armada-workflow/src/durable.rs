//! Durable step execution.
//!
//! Two primitives carry every workflow:
//!
//! - [`Executor::run_step`] invokes a step, logs it, and retries it with
//!   exponential backoff while the error is retryable. Steps re-read the
//!   records they touch, so a retry after a version conflict works against
//!   fresh state.
//! - [`Executor::await_signal`] persists a [`PendingSignal`] and parks the
//!   workflow until an external signal for the same key arrives. There is
//!   no overall timeout. A fallback poll re-checks the ledger so a signal
//!   sent before the waiter registered, or by another process, is not lost.
//!
//! The checkpoint a workflow resumes from is the ledger itself: the
//! operation's persisted state tells a re-driven workflow which step is next.

use std::collections::HashMap;
use std::future::{Future, ready};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use armada_state::{PendingSignal, StateStore};

use crate::error::{WorkflowError, WorkflowResult};

/// Workflow tuning, as read from the daemon config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub signal_poll_interval_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            signal_poll_interval_ms: 1_000,
        }
    }
}

impl WorkflowConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
        }
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms.max(1))
    }
}

/// Exponential backoff between step attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        WorkflowConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * exp;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

/// Runs workflow steps and parks workflows on external signals.
#[derive(Clone)]
pub struct Executor {
    state: StateStore,
    policy: RetryPolicy,
    poll_interval: Duration,
    waiters: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl Executor {
    pub fn new(state: StateStore, config: &WorkflowConfig) -> Self {
        Self {
            state,
            policy: config.retry_policy(),
            poll_interval: config.signal_poll_interval(),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `step` until it succeeds, fails with a non-retryable error, or
    /// exhausts the retry policy.
    pub async fn run_step<T, E, F, Fut>(&self, name: &str, mut step: F) -> WorkflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<WorkflowError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: WorkflowResult<T> = step().await.map_err(Into::into);
            match result {
                Ok(value) => {
                    debug!(step = name, attempt, "step succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(step = name, attempt, ?delay, error = %e, "step failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(step = name, attempt, error = %e, "step failed");
                    return Err(e);
                }
            }
        }
    }

    /// [`run_step`](Self::run_step) for synchronous ledger steps.
    pub async fn run_sync_step<T, E, F>(&self, name: &str, mut step: F) -> WorkflowResult<T>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<WorkflowError>,
    {
        self.run_step(name, || ready(step())).await
    }

    /// Park until `resumed` reports true.
    ///
    /// `resumed` reads the ledger; it runs once up front, after every
    /// [`signal`](Self::signal) for `pending.key`, and on every poll tick.
    /// The pending-signal record exists for exactly as long as the
    /// workflow is parked.
    pub async fn await_signal<F>(&self, pending: PendingSignal, mut resumed: F) -> WorkflowResult<()>
    where
        F: FnMut() -> WorkflowResult<bool>,
    {
        let key = pending.key.clone();
        let notify = self.waiter(&key);

        if self.state.get_pending_signal(&key)?.is_none() {
            self.state.put_pending_signal(&pending)?;
        }
        info!(%key, "waiting for signal");

        while !resumed()? {
            tokio::select! {
                _ = notify.notified() => debug!(%key, "signal received"),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.state.remove_pending_signal(&key)?;
        self.lock_waiters().remove(&key);
        info!(%key, "resumed");
        Ok(())
    }

    /// Wake the workflow parked on `key`, if any.
    pub fn signal(&self, key: &str) {
        // Nobody parked yet: the waiter's first `resumed` check sees the change.
        let Some(notify) = self.lock_waiters().get(key).cloned() else {
            debug!(%key, "no waiter for signal");
            return;
        };
        notify.notify_one();
        debug!(%key, "signal sent");
    }

    fn waiter(&self, key: &str) -> Arc<Notify> {
        Arc::clone(self.lock_waiters().entry(key.to_string()).or_default())
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
