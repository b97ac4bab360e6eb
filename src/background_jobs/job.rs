use crate::browsing_context::{ContextId, Document, ScriptError};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identifier assigned by a [`JobManager`](super::JobManager) when a job is scheduled.
///
/// Ids start at 1 and increase monotonically for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Numeric handles come back from script, e.g. as the argument of `clearTimeout`.
impl From<u64> for JobId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned synchronously to callers of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("Initial delay must not be negative (got {0} ms)")]
    NegativeDelay(i64),

    #[error("Period must not be negative (got {0} ms)")]
    NegativePeriod(i64),

    #[error("Job manager for context {0} has been shut down")]
    ManagerShutDown(ContextId),

    #[error("Too many pending jobs for context {context} (limit: {limit})")]
    PendingLimitReached { context: ContextId, limit: usize },
}

/// When a job first becomes eligible and whether it repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTiming {
    initial_delay: Duration,
    period: Option<Duration>,
}

impl JobTiming {
    /// Run as soon as possible, ahead of any delayed job.
    pub fn asap() -> Self {
        Self::once(Duration::ZERO)
    }

    pub fn once(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            period: None,
        }
    }

    pub fn repeating(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period: Some(period),
        }
    }

    /// Build timing from the signed millisecond values script hands to
    /// `setTimeout`/`setInterval`.
    pub fn from_millis(delay_ms: i64, period_ms: Option<i64>) -> Result<Self, JobError> {
        if delay_ms < 0 {
            return Err(JobError::NegativeDelay(delay_ms));
        }
        let period = match period_ms {
            Some(ms) if ms < 0 => return Err(JobError::NegativePeriod(ms)),
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None => None,
        };
        Ok(Self {
            initial_delay: Duration::from_millis(delay_ms as u64),
            period,
        })
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    /// Zero initial delay marks callback-style work that preempts timers.
    pub fn is_asap(&self) -> bool {
        self.initial_delay.is_zero()
    }

    /// Raise the period to at least `min`. One-shot timing is unchanged.
    pub(crate) fn with_min_period(self, min: Duration) -> Self {
        Self {
            period: self.period.map(|p| p.max(min)),
            ..self
        }
    }
}

/// The work a job performs once its guard has validated the context.
pub trait JobPayload: Send + Sync {
    /// Short name of the payload variant, for diagnostics.
    fn kind(&self) -> &'static str;

    /// Run against `document`. Called again on every re-arm of a periodic job.
    fn try_run(
        &self,
        document: &dyn Document,
        label: &str,
        line_anchor: u32,
    ) -> Result<(), ScriptError>;
}

/// Everything needed to schedule a job, before it has an id.
#[derive(Clone)]
pub struct JobRequest {
    pub timing: JobTiming,
    pub label: String,
    pub payload: Arc<dyn JobPayload>,
}

impl JobRequest {
    pub fn new(timing: JobTiming, label: impl Into<String>, payload: Arc<dyn JobPayload>) -> Self {
        Self {
            timing,
            label: label.into(),
            payload,
        }
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("timing", &self.timing)
            .field("label", &self.label)
            .field("kind", &self.payload.kind())
            .finish()
    }
}

/// Position of a pending job in the selection order.
#[derive(Debug, Clone, Copy)]
pub struct JobKey {
    pub id: JobId,
    pub execute_asap: bool,
    pub target: Instant,
}

impl JobKey {
    pub fn is_due(&self, now: Instant) -> bool {
        self.target <= now
    }
}

/// Selection order for pending jobs; `Less` runs first.
///
/// Asap jobs come before every delayed job, even an overdue one, and run in
/// id order among themselves. Delayed jobs run by target time, with the id
/// breaking ties so the order stays total.
pub fn compare_jobs(a: &JobKey, b: &JobKey) -> Ordering {
    match (a.execute_asap, b.execute_asap) {
        (true, true) => a.id.cmp(&b.id),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.target.cmp(&b.target).then_with(|| a.id.cmp(&b.id)),
    }
}

impl Ord for JobKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_jobs(self, other)
    }
}

impl PartialOrd for JobKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for JobKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for JobKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn key(id: u64, asap: bool, target: Instant) -> JobKey {
        JobKey {
            id: JobId::new(id),
            execute_asap: asap,
            target,
        }
    }

    #[test]
    fn test_asap_jobs_ordered_by_id() {
        let now = Instant::now();
        let first = key(1, true, now + Duration::from_millis(5));
        let second = key(2, true, now);

        assert_eq!(compare_jobs(&first, &second), Ordering::Less);
        assert_eq!(compare_jobs(&second, &first), Ordering::Greater);
    }

    #[test]
    fn test_asap_preempts_overdue_timer() {
        let now = Instant::now();
        let overdue = key(1, false, now - Duration::from_secs(10));
        let asap = key(2, true, now);

        assert_eq!(compare_jobs(&asap, &overdue), Ordering::Less);
        assert_eq!(compare_jobs(&overdue, &asap), Ordering::Greater);
    }

    #[test]
    fn test_delayed_jobs_ordered_by_target_time() {
        let now = Instant::now();
        let later = key(1, false, now + Duration::from_millis(500));
        let sooner = key(2, false, now + Duration::from_millis(100));

        assert_eq!(compare_jobs(&sooner, &later), Ordering::Less);
    }

    #[test]
    fn test_equal_target_time_breaks_tie_by_id() {
        let at = Instant::now() + Duration::from_millis(100);
        let a = key(7, false, at);
        let b = key(3, false, at);

        assert_eq!(compare_jobs(&b, &a), Ordering::Less);
        assert_ne!(a, b);
        assert_eq!(a, key(7, false, at));
    }

    #[test]
    fn test_ordered_set_follows_contract() {
        let now = Instant::now();
        let mut set = BTreeSet::new();
        set.insert(key(1, false, now + Duration::from_secs(5)));
        set.insert(key(2, true, now));
        set.insert(key(3, false, now - Duration::from_secs(1)));
        set.insert(key(4, true, now));
        set.insert(key(5, false, now - Duration::from_secs(1)));

        let order: Vec<u64> = set.iter().map(|k| k.id.as_u64()).collect();
        assert_eq!(order, vec![2, 4, 3, 5, 1]);
    }

    #[test]
    fn test_timing_from_millis_rejects_negative_values() {
        assert_eq!(
            JobTiming::from_millis(-1, None),
            Err(JobError::NegativeDelay(-1))
        );
        assert_eq!(
            JobTiming::from_millis(10, Some(-5)),
            Err(JobError::NegativePeriod(-5))
        );
    }

    #[test]
    fn test_timing_from_millis() {
        let timing = JobTiming::from_millis(0, Some(250)).unwrap();
        assert!(timing.is_asap());
        assert!(timing.is_periodic());
        assert_eq!(timing.period(), Some(Duration::from_millis(250)));

        let timing = JobTiming::from_millis(40, None).unwrap();
        assert!(!timing.is_asap());
        assert!(!timing.is_periodic());
        assert_eq!(timing.initial_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_min_period_clamp() {
        let min = Duration::from_millis(4);
        let clamped = JobTiming::repeating(Duration::ZERO, Duration::ZERO).with_min_period(min);
        assert_eq!(clamped.period(), Some(min));

        let untouched = JobTiming::repeating(Duration::ZERO, Duration::from_millis(50))
            .with_min_period(min);
        assert_eq!(untouched.period(), Some(Duration::from_millis(50)));

        let one_shot = JobTiming::once(Duration::from_millis(1)).with_min_period(min);
        assert_eq!(one_shot.period(), None);
    }
}
