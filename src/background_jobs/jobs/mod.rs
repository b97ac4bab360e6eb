//! Payload variants that can be scheduled on a [`JobManager`](super::JobManager).

mod callback_job;
mod source_job;

pub use callback_job::CallbackJob;
pub use source_job::SourceJob;
