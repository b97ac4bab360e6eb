use super::guard::{ExecutionGuard, GuardOutcome};
use super::info::{DispatchStats, JobInfo};
use super::job::{JobError, JobId, JobKey, JobRequest, JobTiming};
use super::jobs::SourceJob;
use crate::browsing_context::{ContextHandle, ContextId, ScriptEngine, ScriptError};
use crate::config::SchedulerSettings;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A job sitting in the pending set, or being run by the worker.
struct ScheduledJob {
    key: JobKey,
    timing: JobTiming,
    guard: Arc<ExecutionGuard>,
    scheduled_at: DateTime<Utc>,
}

impl ScheduledJob {
    fn info(&self, is_running: bool, now: Instant, now_utc: DateTime<Utc>) -> JobInfo {
        let until = self.key.target.saturating_duration_since(now);
        let next_run_at = now_utc + chrono::Duration::from_std(until).unwrap_or_default();
        JobInfo {
            id: self.key.id,
            label: self.guard.label().to_string(),
            kind: self.guard.payload_kind().to_string(),
            execute_asap: self.key.execute_asap,
            period_ms: self.timing.period().map(|p| p.as_millis() as u64),
            scheduled_at: self.scheduled_at.to_rfc3339(),
            next_run_at: next_run_at.to_rfc3339(),
            is_running,
        }
    }
}

struct RunningJob {
    job: ScheduledJob,
    /// Set when the job is cancelled mid-run; a periodic job is then not re-armed.
    cancelled: bool,
}

#[derive(Default)]
struct ManagerState {
    pending: BTreeMap<JobKey, ScheduledJob>,
    index: HashMap<JobId, JobKey>,
    running: Option<RunningJob>,
    last_id: u64,
    shut_down: bool,
    stats: DispatchStats,
}

impl ManagerState {
    /// Pending jobs plus the one currently running.
    fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.running.is_some())
    }

    fn insert(&mut self, job: ScheduledJob) {
        self.index.insert(job.key.id, job.key);
        self.pending.insert(job.key, job);
    }

    fn remove(&mut self, id: JobId) -> Option<ScheduledJob> {
        let key = self.index.remove(&id)?;
        self.pending.remove(&key)
    }

    /// First job in selection order whose target time has passed.
    fn next_due(&self, now: Instant) -> Option<JobKey> {
        self.pending.keys().find(|key| key.is_due(now)).copied()
    }

    fn earliest_target(&self) -> Option<Instant> {
        self.pending.keys().map(|key| key.target).min()
    }

    fn clear_pending(&mut self) -> usize {
        let removed = self.pending.len();
        self.pending.clear();
        self.index.clear();
        if let Some(running) = self.running.as_mut() {
            running.cancelled = true;
        }
        removed
    }
}

/// State shared between the manager handle and its dispatch worker.
struct ManagerShared {
    context: ContextHandle,
    settings: SchedulerSettings,
    state: Mutex<ManagerState>,
    wakeup: Notify,
    outstanding: watch::Sender<usize>,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the state lock held so waiters never see a stale count.
    fn publish(&self, state: &ManagerState) {
        self.outstanding.send_replace(state.outstanding());
    }
}

/// Scheduler for the background jobs of one browsing context.
///
/// Jobs run one at a time on a dedicated worker task, in the order defined by
/// [`compare_jobs`](super::compare_jobs). Managers for different contexts
/// share nothing and run in parallel.
pub struct JobManager {
    shared: Arc<ManagerShared>,
    engine: Arc<dyn ScriptEngine>,
    shutdown_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl JobManager {
    /// Create a manager for `context` and start its dispatch worker.
    ///
    /// Must be called from within a Tokio runtime. The worker stops when
    /// `shutdown_token` is cancelled, when [`shutdown`](Self::shutdown) is
    /// called, or when the manager is dropped.
    pub fn start(
        context: ContextHandle,
        engine: Arc<dyn ScriptEngine>,
        settings: SchedulerSettings,
        shutdown_token: CancellationToken,
    ) -> Self {
        let runtime = Handle::current();
        let (outstanding, _) = watch::channel(0);
        let shared = Arc::new(ManagerShared {
            context,
            settings,
            state: Mutex::new(ManagerState::default()),
            wakeup: Notify::new(),
            outstanding,
        });

        let worker = runtime.spawn(dispatch_loop(
            Arc::clone(&shared),
            shutdown_token.clone(),
        ));
        info!("Started job manager for context {}", shared.context.id());

        Self {
            shared,
            engine,
            shutdown_token,
            worker: Mutex::new(Some(worker)),
            runtime,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.shared.context.id()
    }

    /// Add a job to the pending set and return its id. Never blocks on the worker.
    pub fn schedule(&self, request: JobRequest) -> Result<JobId, JobError> {
        let JobRequest {
            timing,
            label,
            payload,
        } = request;
        let timing = timing.with_min_period(self.shared.settings.min_interval);

        let mut state = self.shared.lock();
        if state.shut_down || self.shutdown_token.is_cancelled() {
            return Err(JobError::ManagerShutDown(self.context_id()));
        }
        let limit = self.shared.settings.max_pending_jobs;
        if state.outstanding() >= limit {
            warn!(
                "Rejecting job '{}' for context {}: {} jobs outstanding",
                label,
                self.context_id(),
                limit
            );
            return Err(JobError::PendingLimitReached {
                context: self.context_id(),
                limit,
            });
        }

        state.last_id += 1;
        let id = JobId::new(state.last_id);
        let key = JobKey {
            id,
            execute_asap: timing.is_asap(),
            target: deadline_after(Instant::now(), timing.initial_delay()),
        };
        debug!(
            "Scheduling job {} '{}' ({}) for context {}: delay {:?}, period {:?}",
            id,
            label,
            payload.kind(),
            self.context_id(),
            timing.initial_delay(),
            timing.period()
        );
        let guard = ExecutionGuard::new(self.shared.context.clone(), label, payload);
        state.insert(ScheduledJob {
            key,
            timing,
            guard: Arc::new(guard),
            scheduled_at: Utc::now(),
        });
        self.shared.publish(&state);
        drop(state);

        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// Schedule `source` to run after `delay_ms`, repeating every `period_ms` if given.
    pub fn schedule_source(
        &self,
        delay_ms: i64,
        period_ms: Option<i64>,
        label: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<JobId, JobError> {
        let timing = JobTiming::from_millis(delay_ms, period_ms)?;
        let payload = SourceJob::new(source, Arc::clone(&self.engine));
        self.schedule(payload.into_request(timing, label))
    }

    /// Remove a job. Unknown or finished ids are ignored.
    ///
    /// A periodic job that is running right now finishes its current run and
    /// is not re-armed. Returns whether anything was affected.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut state = self.shared.lock();
        if state.remove(id).is_some() {
            debug!("Cancelled job {} for context {}", id, self.context_id());
            self.shared.publish(&state);
            drop(state);
            self.shared.wakeup.notify_one();
            return true;
        }

        match state.running.as_mut() {
            Some(running) if running.job.key.id == id && !running.cancelled => {
                running.cancelled = true;
                debug!(
                    "Cancelled running job {} for context {}",
                    id,
                    self.context_id()
                );
                true
            }
            _ => false,
        }
    }

    /// Remove every pending job, typically because the context is closing.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.shared.lock();
        let removed = state.clear_pending();
        self.shared.publish(&state);
        drop(state);

        self.shared.wakeup.notify_one();
        if removed > 0 {
            info!(
                "Cancelled {} pending jobs for context {}",
                removed,
                self.context_id()
            );
        }
        removed
    }

    /// Number of jobs pending or running.
    pub fn job_count(&self) -> usize {
        self.shared.lock().outstanding()
    }

    /// Wait until no work is outstanding. Returns false if `timeout` elapsed first.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut outstanding = self.shared.outstanding.subscribe();
        let idle =
            match tokio::time::timeout(timeout, outstanding.wait_for(|count| *count == 0)).await {
                Ok(result) => result.is_ok(),
                Err(_) => false,
            };
        idle
    }

    /// Blocking variant of [`wait_for_idle`](Self::wait_for_idle) for synchronous callers.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an asynchronous context, and needs a
    /// multi-threaded runtime to drive the timeout.
    pub fn wait_for_idle_blocking(&self, timeout: Duration) -> bool {
        self.runtime.block_on(self.wait_for_idle(timeout))
    }

    /// Wait for the running job and every job due before `now + horizon`.
    ///
    /// Returns the number of jobs still outstanding when the wait ends, either
    /// because nothing else starts within the horizon or because `timeout`
    /// elapsed.
    pub async fn wait_for_jobs_starting_before(&self, horizon: Duration, timeout: Duration) -> usize {
        let limit = Instant::now() + horizon;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.shared.outstanding.subscribe();

        loop {
            let (blocking, outstanding) = {
                let state = self.shared.lock();
                let blocking = state.running.is_some()
                    || state.pending.keys().any(|key| key.target < limit);
                (blocking, state.outstanding())
            };
            if !blocking {
                return outstanding;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return self.job_count(),
            }
        }
    }

    /// Snapshot of outstanding jobs, the running one first, then in selection order.
    pub fn pending_jobs(&self) -> Vec<JobInfo> {
        let state = self.shared.lock();
        let now = Instant::now();
        let now_utc = Utc::now();

        let mut jobs = Vec::with_capacity(state.outstanding());
        if let Some(running) = &state.running {
            jobs.push(running.job.info(true, now, now_utc));
        }
        jobs.extend(state.pending.values().map(|job| job.info(false, now, now_utc)));
        jobs
    }

    /// The pending job that comes first in selection order.
    pub fn earliest_job(&self) -> Option<JobInfo> {
        let state = self.shared.lock();
        state
            .pending
            .values()
            .next()
            .map(|job| job.info(false, Instant::now(), Utc::now()))
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.lock().stats
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().shut_down
    }

    /// Drop all jobs and stop the worker.
    ///
    /// A job already running is allowed to finish, for at most the
    /// configured shutdown grace period.
    pub async fn shutdown(&self) {
        let removed = {
            let mut state = self.shared.lock();
            state.shut_down = true;
            let removed = state.clear_pending();
            self.shared.publish(&state);
            removed
        };
        self.shutdown_token.cancel();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let grace = self.shared.settings.shutdown_grace;
            if tokio::time::timeout(grace, worker).await.is_err() {
                warn!(
                    "Job manager for context {} did not stop within {:?}",
                    self.context_id(),
                    grace
                );
            }
        }
        info!(
            "Job manager for context {} shut down ({} pending jobs dropped)",
            self.context_id(),
            removed
        );
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if !self.shutdown_token.is_cancelled() {
            let mut state = self.shared.lock();
            state.shut_down = true;
            state.clear_pending();
            self.shared.publish(&state);
        }
        self.shutdown_token.cancel();
    }
}

/// Furthest point a job can be pushed to; absurd delays from script saturate here.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay.min(MAX_DELAY))
        .unwrap_or(from)
}

/// Worker loop: run due jobs one at a time, otherwise sleep until the next
/// target time, a new job, or shutdown.
async fn dispatch_loop(shared: Arc<ManagerShared>, shutdown_token: CancellationToken) {
    let context_id = shared.context.id();
    debug!("Dispatch loop for context {} running", context_id);

    while !shutdown_token.is_cancelled() {
        let (due, earliest) = {
            let state = shared.lock();
            (state.next_due(Instant::now()), state.earliest_target())
        };

        if let Some(key) = due {
            run_job(&shared, key).await;
            continue;
        }

        let next_target = async {
            match earliest {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = next_target => {}
            _ = shared.wakeup.notified() => {}
            _ = shutdown_token.cancelled() => break,
        }
    }

    // The worker may stop on a parent token; nothing left behind can run anymore.
    let dropped = {
        let mut state = shared.lock();
        state.shut_down = true;
        let dropped = state.clear_pending();
        shared.publish(&state);
        dropped
    };
    debug!(
        "Dispatch loop for context {} stopped ({} pending jobs dropped)",
        context_id, dropped
    );
}

async fn run_job(shared: &Arc<ManagerShared>, key: JobKey) {
    let guard = {
        let mut state = shared.lock();
        // Cancelled between selection and now.
        let Some(job) = state.remove(key.id) else {
            return;
        };
        let guard = Arc::clone(&job.guard);
        state.running = Some(RunningJob {
            job,
            cancelled: false,
        });
        shared.publish(&state);
        guard
    };

    let started = Instant::now();
    let label = guard.label().to_string();
    debug!("Running job {} '{}'", key.id, label);

    // Payloads are synchronous script; keep them off the async workers.
    let outcome = match tokio::task::spawn_blocking(move || guard.run()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Job {} '{}' panicked: {}", key.id, label, e);
            GuardOutcome::Failed(ScriptError::Aborted(format!("Task panic: {}", e)))
        }
    };

    let mut state = shared.lock();
    state.stats.record(&outcome);
    if let Some(RunningJob {
        mut job,
        cancelled,
    }) = state.running.take()
    {
        match job.timing.period() {
            Some(period) if !cancelled => {
                let mut next = deadline_after(job.key.target, period);
                if next < Instant::now() {
                    // Overran or woke late: keep the cadence from this run instead of
                    // firing a burst of catch-up runs.
                    next = deadline_after(started, period);
                }
                job.key.target = next;
                state.stats.rearmed += 1;
                debug!(
                    "Re-armed job {} '{}' in {:?}",
                    key.id,
                    label,
                    next.saturating_duration_since(Instant::now())
                );
                state.insert(job);
            }
            _ => debug!("Job {} '{}' done after {:?}", key.id, label, started.elapsed()),
        }
    }
    shared.publish(&state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::jobs::CallbackJob;
    use crate::browsing_context::{Document, InMemoryContext, RecordingEngine};

    fn scheduled(id: u64, timing: JobTiming, target: Instant) -> ScheduledJob {
        let window = InMemoryContext::new("state");
        let payload = Arc::new(CallbackJob::new(|_: &dyn Document| Ok(())));
        ScheduledJob {
            key: JobKey {
                id: JobId::new(id),
                execute_asap: timing.is_asap(),
                target,
            },
            timing,
            guard: Arc::new(ExecutionGuard::new(
                ContextHandle::new(&window),
                format!("job {}", id),
                payload,
            )),
            scheduled_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_selects_asap_before_overdue_timer() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.insert(scheduled(
            1,
            JobTiming::once(Duration::from_millis(10)),
            now - Duration::from_millis(500),
        ));
        state.insert(scheduled(2, JobTiming::asap(), now));

        assert_eq!(state.next_due(now).unwrap().id, JobId::new(2));
        assert_eq!(state.outstanding(), 2);
    }

    #[test]
    fn test_state_skips_rearmed_asap_job_that_is_not_due() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.insert(scheduled(
            1,
            JobTiming::repeating(Duration::ZERO, Duration::from_secs(1)),
            now + Duration::from_secs(1),
        ));
        state.insert(scheduled(
            2,
            JobTiming::once(Duration::from_millis(5)),
            now - Duration::from_millis(1),
        ));

        assert_eq!(state.next_due(now).unwrap().id, JobId::new(2));
        assert_eq!(state.earliest_target(), Some(now - Duration::from_millis(1)));
    }

    #[test]
    fn test_state_remove_and_clear() {
        let now = Instant::now();
        let mut state = ManagerState::default();
        state.insert(scheduled(1, JobTiming::asap(), now));
        state.insert(scheduled(2, JobTiming::asap(), now));

        assert!(state.remove(JobId::new(1)).is_some());
        assert!(state.remove(JobId::new(1)).is_none());
        assert_eq!(state.outstanding(), 1);

        assert_eq!(state.clear_pending(), 1);
        assert_eq!(state.outstanding(), 0);
        assert!(state.index.is_empty());
        assert!(state.next_due(now).is_none());
    }

    #[test]
    fn test_scheduled_job_info() {
        let now = Instant::now();
        let job = scheduled(
            9,
            JobTiming::repeating(Duration::from_millis(50), Duration::from_millis(50)),
            now + Duration::from_millis(50),
        );

        let info = job.info(false, now, Utc::now());
        assert_eq!(info.id, JobId::new(9));
        assert_eq!(info.label, "job 9");
        assert_eq!(info.kind, "callback");
        assert_eq!(info.period_ms, Some(50));
        assert!(!info.execute_asap);
        assert!(info.next_run_at.contains('T'));
    }

    #[tokio::test]
    async fn test_schedule_assigns_increasing_ids() {
        let window = InMemoryContext::new("main");
        let engine = RecordingEngine::new();
        let manager = JobManager::start(
            ContextHandle::new(&window),
            engine,
            SchedulerSettings::default(),
            CancellationToken::new(),
        );

        let first = manager.schedule_source(5_000, None, "a", "a()").unwrap();
        let second = manager.schedule_source(5_000, None, "b", "b()").unwrap();

        assert_eq!(first.as_u64(), 1);
        assert_eq!(second.as_u64(), 2);
        assert_eq!(manager.job_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_rejects_negative_delay() {
        let window = InMemoryContext::new("main");
        let manager = JobManager::start(
            ContextHandle::new(&window),
            RecordingEngine::new(),
            SchedulerSettings::default(),
            CancellationToken::new(),
        );

        let err = manager.schedule_source(-10, None, "bad", "x()").unwrap_err();
        assert_eq!(err, JobError::NegativeDelay(-10));
        assert_eq!(manager.job_count(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_parent_token_cancellation_clears_work_and_rejects_new_jobs() {
        let window = InMemoryContext::new("main");
        let parent = CancellationToken::new();
        let manager = JobManager::start(
            ContextHandle::new(&window),
            RecordingEngine::new(),
            SchedulerSettings::default(),
            parent.child_token(),
        );
        manager
            .schedule_source(20, None, "pending", "pending()")
            .unwrap();
        assert_eq!(manager.job_count(), 1);

        parent.cancel();

        assert!(manager.wait_for_idle(Duration::from_millis(500)).await);
        assert_eq!(manager.job_count(), 0);
        assert!(manager.is_shut_down());
        assert_eq!(manager.stats().runs(), 0);
        assert!(matches!(
            manager.schedule_source(0, None, "late", "x()"),
            Err(JobError::ManagerShutDown(_))
        ));
    }
}
