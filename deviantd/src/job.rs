use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sync::engine::{EngineError, RunConfig, RunProgress, RunResult, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobPhase {
    Idle,
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: u64,
    pub phase: JobPhase,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub config: Option<RunConfig>,
    pub progress: RunProgress,
    pub result: Option<RunResult>,
    pub message: String,
}

impl JobSnapshot {
    fn idle() -> Self {
        Self {
            job_id: 0,
            phase: JobPhase::Idle,
            started_at: None,
            finished_at: None,
            config: None,
            progress: RunProgress::default(),
            result: None,
            message: "idle".to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == JobPhase::Running
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("sync job {} is already running", .0.job_id)]
    Conflict(Box<JobSnapshot>),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct JobState {
    snapshot: JobSnapshot,
    progress: Option<watch::Receiver<RunProgress>>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl JobState {
    fn current(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot.clone();
        if let Some(progress) = &self.progress {
            snapshot.progress = progress.borrow().clone();
        }
        snapshot
    }
}

/// Owns the single in-flight sync run. A second start while one runs is
/// refused with the running job's snapshot.
#[derive(Clone)]
pub struct JobRunner {
    engine: Arc<SyncEngine>,
    state: Arc<Mutex<JobState>>,
}

impl JobRunner {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(JobState {
                snapshot: JobSnapshot::idle(),
                progress: None,
                cancel: None,
                handle: None,
            })),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn start(&self, config: &RunConfig) -> Result<JobSnapshot, JobError> {
        let config = config.validated()?;
        let mut state = lock(&self.state);
        if state.snapshot.is_running() {
            return Err(JobError::Conflict(Box::new(state.current())));
        }

        let job_id = state.snapshot.job_id + 1;
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(RunProgress::default());
        state.snapshot = JobSnapshot {
            job_id,
            phase: JobPhase::Running,
            started_at: now_rfc3339(),
            finished_at: None,
            config: Some(config.clone()),
            progress: RunProgress::default(),
            result: None,
            message: "running".to_string(),
        };
        state.progress = Some(progress_rx);
        state.cancel = Some(cancel.clone());

        let engine = Arc::clone(&self.engine);
        let shared = Arc::clone(&self.state);
        state.handle = Some(tokio::spawn(async move {
            // A panic inside the run surfaces here as a JoinError.
            let run = tokio::spawn(async move { engine.run_sync(&config, &cancel, &progress_tx).await });
            finish_job(&shared, job_id, run.await);
        }));
        info!(job_id, "sync job started");
        Ok(state.current())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        lock(&self.state).current()
    }

    /// Signals the running job to stop at the next item. Returns false when
    /// nothing is running.
    pub fn cancel(&self) -> bool {
        let state = lock(&self.state);
        match (&state.cancel, state.snapshot.is_running()) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits for the current job, if any, and returns the final snapshot.
    pub async fn wait(&self) -> JobSnapshot {
        let handle = lock(&self.state).handle.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "sync job task failed");
        }
        self.snapshot()
    }
}

fn finish_job(
    state: &Mutex<JobState>,
    job_id: u64,
    outcome: Result<Result<RunResult, EngineError>, JoinError>,
) {
    let mut state = lock(state);
    if state.snapshot.job_id != job_id {
        return;
    }
    let final_progress = state
        .progress
        .take()
        .map(|rx| rx.borrow().clone())
        .unwrap_or_default();
    let snapshot = &mut state.snapshot;
    snapshot.phase = JobPhase::Finished;
    snapshot.finished_at = now_rfc3339();
    snapshot.progress = final_progress;
    match outcome {
        Ok(Ok(result)) => {
            snapshot.message = result.message.clone();
            snapshot.result = Some(result);
        }
        Ok(Err(err)) => {
            snapshot.message = err.to_string();
            snapshot.result = None;
        }
        Err(err) if err.is_panic() => {
            warn!(job_id, "sync task panicked");
            snapshot.message = "sync task panicked".to_string();
            snapshot.result = None;
        }
        Err(err) => {
            snapshot.message = format!("sync task failed: {err}");
            snapshot.result = None;
        }
    }
    info!(job_id, message = %snapshot.message, "sync job finished");
    state.cancel = None;
}

fn lock(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}
