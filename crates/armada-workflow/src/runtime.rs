//! Runtime collaborator: starts and stops placements on nodes.
//!
//! The orchestrator drives placements through [`PlacementRuntime`]. Calls
//! may be repeated for the same target after a crash, so implementations
//! must either be idempotent or report [`RuntimeError::AlreadyStarted`] /
//! [`RuntimeError::AlreadyStopped`], which the workflow treats as success.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

/// Errors reported by a placement runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("placement {0} already started")]
    AlreadyStarted(String),

    #[error("placement {0} already stopped")]
    AlreadyStopped(String),

    /// Transient: the node agent could not be reached.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("placement failed: {0}")]
    Failed(String),
}

impl RuntimeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Boxed future alias for runtime calls.
pub type RuntimeFuture<'a> = Pin<Box<dyn Future<Output = RuntimeResult<()>> + Send + 'a>>;

/// Starts and stops placements. Injected so tests and the daemon can run
/// without a real node agent.
pub trait PlacementRuntime: Send + Sync {
    fn start_placement<'a>(
        &'a self,
        meta_instance_id: &'a str,
        runtime_instance_id: &'a str,
    ) -> RuntimeFuture<'a>;

    fn stop_placement<'a>(
        &'a self,
        meta_instance_id: &'a str,
        runtime_instance_id: &'a str,
    ) -> RuntimeFuture<'a>;
}

/// Start a placement, treating "already started" as success.
pub async fn ensure_started(
    runtime: &dyn PlacementRuntime,
    meta_instance_id: &str,
    runtime_instance_id: &str,
) -> RuntimeResult<()> {
    match runtime.start_placement(meta_instance_id, runtime_instance_id).await {
        Ok(()) | Err(RuntimeError::AlreadyStarted(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Stop a placement, treating "already stopped" as success.
pub async fn ensure_stopped(
    runtime: &dyn PlacementRuntime,
    meta_instance_id: &str,
    runtime_instance_id: &str,
) -> RuntimeResult<()> {
    match runtime.stop_placement(meta_instance_id, runtime_instance_id).await {
        Ok(()) | Err(RuntimeError::AlreadyStopped(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Default)]
struct Placements {
    running: HashSet<String>,
    starts: HashMap<String, u32>,
    stops: HashMap<String, u32>,
    broken: HashSet<String>,
    flaky_calls: u32,
}

/// In-process runtime that tracks which placements are running.
///
/// Supports failure injection: [`InMemoryRuntime::break_placement`] makes
/// every start of one placement fail permanently, and
/// [`InMemoryRuntime::fail_next_calls`] makes the next N calls fail with a
/// retryable error.
#[derive(Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Placements>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_placement(&self, runtime_instance_id: &str) {
        self.lock().broken.insert(runtime_instance_id.to_string());
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.lock().flaky_calls = count;
    }

    pub fn is_running(&self, runtime_instance_id: &str) -> bool {
        self.lock().running.contains(runtime_instance_id)
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().running.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Start calls that actually started something.
    pub fn start_count(&self, runtime_instance_id: &str) -> u32 {
        self.lock().starts.get(runtime_instance_id).copied().unwrap_or(0)
    }

    /// Stop calls that actually stopped something.
    pub fn stop_count(&self, runtime_instance_id: &str) -> u32 {
        self.lock().stops.get(runtime_instance_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Placements> {
        // A poisoned lock only means a test panicked mid-call; the sets are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, runtime_instance_id: &str) -> RuntimeResult<()> {
        let mut p = self.lock();
        if p.flaky_calls > 0 {
            p.flaky_calls -= 1;
            return Err(RuntimeError::Unavailable(format!("start {runtime_instance_id}")));
        }
        if p.broken.contains(runtime_instance_id) {
            return Err(RuntimeError::Failed(format!("{runtime_instance_id} crashed on start")));
        }
        if !p.running.insert(runtime_instance_id.to_string()) {
            return Err(RuntimeError::AlreadyStarted(runtime_instance_id.to_string()));
        }
        *p.starts.entry(runtime_instance_id.to_string()).or_default() += 1;
        Ok(())
    }

    fn stop(&self, runtime_instance_id: &str) -> RuntimeResult<()> {
        let mut p = self.lock();
        if p.flaky_calls > 0 {
            p.flaky_calls -= 1;
            return Err(RuntimeError::Unavailable(format!("stop {runtime_instance_id}")));
        }
        if !p.running.remove(runtime_instance_id) {
            return Err(RuntimeError::AlreadyStopped(runtime_instance_id.to_string()));
        }
        *p.stops.entry(runtime_instance_id.to_string()).or_default() += 1;
        Ok(())
    }
}

impl PlacementRuntime for InMemoryRuntime {
    fn start_placement<'a>(
        &'a self,
        meta_instance_id: &'a str,
        runtime_instance_id: &'a str,
    ) -> RuntimeFuture<'a> {
        Box::pin(async move {
            debug!(meta_instance = %meta_instance_id, runtime_instance = %runtime_instance_id, "start placement");
            self.start(runtime_instance_id)
        })
    }

    fn stop_placement<'a>(
        &'a self,
        meta_instance_id: &'a str,
        runtime_instance_id: &'a str,
    ) -> RuntimeFuture<'a> {
        Box::pin(async move {
            debug!(meta_instance = %meta_instance_id, runtime_instance = %runtime_instance_id, "stop placement");
            self.stop(runtime_instance_id)
        })
    }
}
