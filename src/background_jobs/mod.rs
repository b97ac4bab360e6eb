//! Background job scheduling and execution for browsing contexts.
//!
//! Timers, intervals and asynchronously dispatched callbacks are queued per
//! browsing context and run one at a time, to completion, on that context's
//! worker. A guard re-checks the context immediately before every run so a
//! job that outlives its window is discarded instead of executed.

mod guard;
mod info;
mod job;
pub mod jobs;
mod manager;

pub use guard::{ExecutionGuard, GuardOutcome, SkipReason};
pub use info::{DispatchStats, JobInfo};
pub use job::{compare_jobs, JobError, JobId, JobKey, JobPayload, JobRequest, JobTiming};
pub use manager::JobManager;
