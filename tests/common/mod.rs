//! Common test infrastructure
//!
//! Tests build a [`TestWindow`] (one in-memory browsing context with its own
//! job manager and recording engine) and use [`Gate`] to hold the dispatch
//! worker inside a job while they rearrange the pending set.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tab_jobs::background_jobs::jobs::CallbackJob;
use tab_jobs::background_jobs::{JobId, JobManager, JobRequest, JobTiming};
use tab_jobs::browsing_context::{
    ContextHandle, Document, InMemoryContext, RecordingEngine, ScriptError,
};
use tab_jobs::config::SchedulerSettings;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in a test, so a broken scheduler fails
/// instead of hanging.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestWindow {
    pub window: Arc<InMemoryContext>,
    pub engine: Arc<RecordingEngine>,
    pub manager: JobManager,
}

impl TestWindow {
    pub fn spawn() -> Self {
        Self::with_settings(SchedulerSettings::default())
    }

    pub fn with_settings(settings: SchedulerSettings) -> Self {
        let window = InMemoryContext::new("test-window");
        let engine = RecordingEngine::new();
        let manager = JobManager::start(
            ContextHandle::new(&window),
            engine.clone(),
            settings,
            CancellationToken::new(),
        );
        Self {
            window,
            engine,
            manager,
        }
    }

    /// Schedule a one-shot source job.
    pub fn run_after(&self, delay_ms: i64, source: &str) -> JobId {
        self.manager
            .schedule_source(delay_ms, None, source, source)
            .unwrap()
    }

    /// Schedule an asap job that blocks the worker until `gate` opens.
    pub fn block_on_gate(&self, gate: &Gate) -> JobId {
        self.manager.schedule(gate.job_request()).unwrap()
    }
}

/// A one-shot latch a job can wait on.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    open: bool,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().open = true;
        cvar.notify_all();
    }

    /// Wait until a job has started waiting on this gate.
    pub async fn entered(&self) {
        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while !self.state.0.lock().unwrap().entered {
            assert!(
                tokio::time::Instant::now() < deadline,
                "gate job never started"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Block the calling thread until the gate opens. Called from inside jobs.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.entered = true;
        cvar.notify_all();
        let (_state, _timeout) = cvar
            .wait_timeout_while(state, TEST_TIMEOUT, |s| !s.open)
            .unwrap();
    }

    pub fn job_request(&self) -> JobRequest {
        let gate = self.clone();
        let payload = CallbackJob::new(move |_: &dyn Document| -> Result<(), ScriptError> {
            gate.wait();
            Ok(())
        });
        JobRequest::new(JobTiming::asap(), "gate", Arc::new(payload))
    }
}
