//! Per-context background job scheduling for a headless browser.
//!
//! Each browsing context owns a [`JobManager`] that queues timers, intervals
//! and asynchronous callbacks, runs them one at a time, and discards any job
//! whose context has been closed or reclaimed by the time it is due.
//! A [`Session`] owns the managers of every context in a browser session.

pub mod background_jobs;
pub mod browsing_context;
pub mod config;
pub mod scenario;
pub mod session;

pub use background_jobs::{JobError, JobId, JobManager, JobTiming};
pub use browsing_context::{BrowsingContext, ContextHandle, ContextId, ScriptEngine};
pub use session::Session;
