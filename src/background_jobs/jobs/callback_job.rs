//! Callback job.
//!
//! Runs a Rust closure against the document. Used for callback-style work,
//! such as the completion handler of an asynchronous request, which is
//! usually scheduled with zero delay.

use crate::background_jobs::job::JobPayload;
use crate::browsing_context::{Document, ScriptError};

pub struct CallbackJob<F> {
    callback: F,
}

impl<F> CallbackJob<F>
where
    F: Fn(&dyn Document) -> Result<(), ScriptError> + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> JobPayload for CallbackJob<F>
where
    F: Fn(&dyn Document) -> Result<(), ScriptError> + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        "callback"
    }

    fn try_run(
        &self,
        document: &dyn Document,
        _label: &str,
        _line_anchor: u32,
    ) -> Result<(), ScriptError> {
        (self.callback)(document)
    }
}
