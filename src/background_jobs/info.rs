//! Serializable snapshots of scheduler state, for debugging and test harnesses.

use super::guard::GuardOutcome;
use super::job::JobId;
use serde::Serialize;

/// Information about a pending or running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub label: String,
    pub kind: String,
    pub execute_asap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
    /// Scheduled creation time, RFC 3339.
    pub scheduled_at: String,
    /// Next eligible run, RFC 3339.
    pub next_run_at: String,
    pub is_running: bool,
}

/// Counters of what the dispatch loop has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub rearmed: u64,
}

impl DispatchStats {
    pub fn record(&mut self, outcome: &GuardOutcome) {
        match outcome {
            GuardOutcome::Executed => self.executed += 1,
            GuardOutcome::Failed(_) => self.failed += 1,
            GuardOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    /// Payload invocations, successful or not.
    pub fn runs(&self) -> u64 {
        self.executed + self.failed
    }
}
