//! Script source job.
//!
//! Runs a literal source string through the script engine. This is what
//! `setTimeout("...", delay)` and `setInterval("...", period)` produce.

use crate::background_jobs::job::{JobPayload, JobRequest, JobTiming};
use crate::browsing_context::{Document, ScriptEngine, ScriptError};
use std::sync::Arc;

/// Payload that executes a fixed piece of script source.
pub struct SourceJob {
    source: String,
    engine: Arc<dyn ScriptEngine>,
}

impl SourceJob {
    pub fn new(source: impl Into<String>, engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            source: source.into(),
            engine,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Wrap this payload into a request ready for scheduling.
    pub fn into_request(self, timing: JobTiming, label: impl Into<String>) -> JobRequest {
        JobRequest::new(timing, label, Arc::new(self))
    }
}

impl JobPayload for SourceJob {
    fn kind(&self) -> &'static str {
        "source"
    }

    fn try_run(
        &self,
        document: &dyn Document,
        label: &str,
        line_anchor: u32,
    ) -> Result<(), ScriptError> {
        if self.source.trim().is_empty() {
            return Ok(());
        }
        self.engine
            .execute(document, &self.source, label, line_anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browsing_context::{InMemoryDocument, RecordingEngine, SCRIPT_LINE_ANCHOR};
    use std::time::Duration;

    #[test]
    fn test_empty_source_is_noop() {
        let engine = RecordingEngine::new();
        let doc = InMemoryDocument::html("about:blank");

        let job = SourceJob::new("", engine.clone());
        job.try_run(doc.as_ref(), "empty", SCRIPT_LINE_ANCHOR).unwrap();
        let job = SourceJob::new("   \n", engine.clone());
        job.try_run(doc.as_ref(), "blank", SCRIPT_LINE_ANCHOR).unwrap();

        assert!(engine.executions().is_empty());
    }

    #[test]
    fn test_runs_source_every_time() {
        let engine = RecordingEngine::new();
        let doc = InMemoryDocument::html("about:blank");
        let job = SourceJob::new("tick()", engine.clone());

        for _ in 0..3 {
            job.try_run(doc.as_ref(), "interval", SCRIPT_LINE_ANCHOR)
                .unwrap();
        }

        assert_eq!(engine.count_for("interval"), 3);
        assert_eq!(job.source(), "tick()");
    }

    #[test]
    fn test_engine_error_is_returned() {
        let engine = RecordingEngine::new();
        let doc = InMemoryDocument::html("about:blank");
        let job = SourceJob::new("throw 1", engine);

        let err = job
            .try_run(doc.as_ref(), "failing", SCRIPT_LINE_ANCHOR)
            .unwrap_err();
        assert!(err.to_string().contains("failing"));
    }

    #[test]
    fn test_into_request() {
        let engine = RecordingEngine::new();
        let request = SourceJob::new("tick()", engine)
            .into_request(JobTiming::once(Duration::from_millis(10)), "timeout");

        assert_eq!(request.label, "timeout");
        assert_eq!(request.payload.kind(), "source");
        assert_eq!(request.timing.initial_delay(), Duration::from_millis(10));
    }
}
