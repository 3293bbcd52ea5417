//! Registry of collection runs.
//!
//! At most one run is active: inserting a run cancels every other tracked run
//! before the new one becomes visible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::RunStatus;
use crate::tool::Filters;

/// The agent's own view of where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// Tracked but the coordinator has not asked for collection yet.
    Pending,
    Running,
    Ready,
    Fail,
    Success,
    /// Superseded or cancelled externally.
    Error,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Fail | RunPhase::Success | RunPhase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Running => "running",
            RunPhase::Ready => "ready",
            RunPhase::Fail => "fail",
            RunPhase::Success => "success",
            RunPhase::Error => "error",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub phase: RunPhase,
    pub error: String,
}

/// One collection run.
#[derive(Debug)]
pub struct Job {
    pub plan_id: u64,
    pub build_settings: String,
    pub filters: Filters,
    state: Mutex<RunState>,
    dump_lock: AsyncMutex<()>,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(plan_id: u64, status: RunStatus, build_settings: String, filters: Filters) -> Self {
        let phase = match status {
            RunStatus::Running | RunStatus::Ready => RunPhase::Running,
            _ => RunPhase::Pending,
        };
        Self {
            plan_id,
            build_settings,
            filters,
            state: Mutex::new(RunState {
                status,
                phase,
                error: String::new(),
            }),
            dump_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    // The state is only touched in short non-panicking sections, so a
    // poisoned lock still holds consistent data.
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> RunState {
        self.state().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state().status
    }

    pub fn phase(&self) -> RunPhase {
        self.state().phase
    }

    pub fn error(&self) -> String {
        self.state().error.clone()
    }

    pub fn set_status(&self, status: RunStatus) {
        self.state().status = status;
    }

    /// Advance the phase. A terminal phase is never left.
    pub fn set_phase(&self, phase: RunPhase) {
        let mut state = self.state();
        if !state.phase.is_terminal() {
            state.phase = phase;
        }
    }

    /// Move to a terminal phase, recording `msg` as the run's error text.
    pub fn fail(&self, phase: RunPhase, msg: &str) {
        let mut state = self.state();
        if !state.phase.is_terminal() {
            state.phase = phase;
        }
        if !msg.is_empty() {
            state.error.push_str(msg);
            if !msg.ends_with('\n') {
                state.error.push('\n');
            }
        }
    }

    /// Serialises dump and merge work on this run's artifacts.
    pub async fn lock_artifacts(&self) -> AsyncMutexGuard<'_, ()> {
        self.dump_lock.lock().await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Concurrency-safe run registry keyed by plan id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<u64, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, plan_id: u64) -> Option<Arc<Job>> {
        self.jobs.read().await.get(&plan_id).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.plan_id);
        jobs
    }

    pub async fn delete(&self, plan_id: u64) -> Option<Arc<Job>> {
        self.jobs.write().await.remove(&plan_id)
    }

    /// Delete `job` only if it is still the tracked entry for its id.
    pub async fn delete_if_same(&self, job: &Arc<Job>) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&job.plan_id) {
            Some(current) if Arc::ptr_eq(current, job) => {
                jobs.remove(&job.plan_id);
                true
            }
            _ => false,
        }
    }

    /// Track `job` as the only active run.
    ///
    /// Every other tracked run is cancelled under the same write lock, and
    /// those not yet terminal move to [`RunPhase::Error`]. Returns the
    /// superseded runs.
    pub async fn insert_exclusive(&self, job: Arc<Job>) -> Vec<Arc<Job>> {
        let mut jobs = self.jobs.write().await;
        let mut superseded = Vec::new();
        for other in jobs.values() {
            if Arc::ptr_eq(other, &job) {
                continue;
            }
            if !other.phase().is_terminal() {
                other.fail(
                    RunPhase::Error,
                    &format!("superseded by plan {}", job.plan_id),
                );
            }
            other.cancel();
            info!(plan_id = other.plan_id, new_plan_id = job.plan_id, "run superseded");
            superseded.push(Arc::clone(other));
        }
        jobs.insert(job.plan_id, job);
        superseded
    }
}
