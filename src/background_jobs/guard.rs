//! Liveness check that runs immediately before a job's payload.

use super::job::JobPayload;
use crate::browsing_context::{ContextHandle, ContextId, ScriptError, SCRIPT_LINE_ANCHOR};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Why a guard discarded a job instead of running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ContextReclaimed,
    ContextClosed,
    ContextUnregistered,
    NoDocument,
    NotScriptCapable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ContextReclaimed => write!(f, "context reclaimed"),
            SkipReason::ContextClosed => write!(f, "context closed"),
            SkipReason::ContextUnregistered => write!(f, "context no longer registered"),
            SkipReason::NoDocument => write!(f, "no document loaded"),
            SkipReason::NotScriptCapable => write!(f, "document cannot run script"),
        }
    }
}

/// Result of one pass through [`ExecutionGuard::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Executed,
    Failed(ScriptError),
    Skipped(SkipReason),
}

/// Wraps a payload together with a non-owning reference to its context.
pub struct ExecutionGuard {
    context: ContextHandle,
    label: String,
    payload: Arc<dyn JobPayload>,
}

impl ExecutionGuard {
    pub fn new(
        context: ContextHandle,
        label: impl Into<String>,
        payload: Arc<dyn JobPayload>,
    ) -> Self {
        Self {
            context,
            label: label.into(),
            payload,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    pub fn payload_kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Validate the context and, if it is still usable, run the payload.
    ///
    /// Never fails: stale contexts are skipped and script errors are logged
    /// and reported through the outcome. Once the payload has started it runs
    /// to completion even if the context closes meanwhile.
    pub fn run(&self) -> GuardOutcome {
        match self.execute() {
            Ok(()) => GuardOutcome::Executed,
            Err(GuardOutcome::Skipped(reason)) => {
                debug!("Discarding job '{}': {}", self.label, reason);
                GuardOutcome::Skipped(reason)
            }
            Err(outcome) => outcome,
        }
    }

    fn execute(&self) -> Result<(), GuardOutcome> {
        let skip = |reason| Err(GuardOutcome::Skipped(reason));

        let Some(context) = self.context.resolve() else {
            return skip(SkipReason::ContextReclaimed);
        };
        if context.is_closed() {
            return skip(SkipReason::ContextClosed);
        }
        if !context.is_registered() {
            return skip(SkipReason::ContextUnregistered);
        }
        let Some(document) = context.current_document() else {
            return skip(SkipReason::NoDocument);
        };
        if !document.is_script_capable() {
            return skip(SkipReason::NotScriptCapable);
        }

        self.payload
            .try_run(document.as_ref(), &self.label, SCRIPT_LINE_ANCHOR)
            .map_err(|e| {
                error!(
                    "Job '{}' in context {} raised an error: {}",
                    self.label,
                    context.name(),
                    e
                );
                GuardOutcome::Failed(e)
            })
    }
}

impl fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("context", &self.context)
            .field("label", &self.label)
            .field("kind", &self.payload.kind())
            .finish()
    }
}
