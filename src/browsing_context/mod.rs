//! Boundary between the job scheduler and the browser that hosts it.
//!
//! The scheduler never parses or interprets script. It only needs to know
//! whether a browsing context is still usable, which document it currently
//! holds, and how to hand a piece of source text to a script engine.

mod memory;

pub use memory::{ExecutionRecord, InMemoryContext, InMemoryDocument, RecordingEngine};

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use uuid::Uuid;

/// Line number reported to the script engine for every scheduled execution.
pub const SCRIPT_LINE_ANCHOR: u32 = 1;

/// Stable identity of a browsing context within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by a script engine while executing source text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("Syntax error in {label} at line {line}: {message}")]
    Syntax {
        label: String,
        line: u32,
        message: String,
    },

    #[error("Runtime error in {label}: {message}")]
    Runtime { label: String, message: String },

    #[error("Script execution aborted: {0}")]
    Aborted(String),
}

/// A document loaded into a browsing context.
pub trait Document: Send + Sync {
    /// Address of the document, for diagnostics.
    fn url(&self) -> &str;

    /// Whether script may run against this document.
    ///
    /// Plain text, images and other non-HTML documents return false.
    fn is_script_capable(&self) -> bool;
}

/// One tab or frame able to hold a document.
pub trait BrowsingContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// True once the context has been closed by its owner.
    fn is_closed(&self) -> bool;

    /// True while the owning session still tracks this context.
    fn is_registered(&self) -> bool;

    /// The document currently loaded, if any.
    fn current_document(&self) -> Option<Arc<dyn Document>>;
}

/// Entry point into the script engine.
pub trait ScriptEngine: Send + Sync {
    /// Run `source` against `document`.
    ///
    /// `label` and `line_anchor` are used by the engine to attribute errors.
    fn execute(
        &self,
        document: &dyn Document,
        source: &str,
        label: &str,
        line_anchor: u32,
    ) -> Result<(), ScriptError>;
}

/// Non-owning handle to a browsing context.
///
/// Holding a handle never keeps the context alive. Resolution fails once the
/// owner has dropped the context.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    context: Weak<dyn BrowsingContext>,
}

impl ContextHandle {
    pub fn new<C: BrowsingContext + 'static>(context: &Arc<C>) -> Self {
        let context: Arc<dyn BrowsingContext> = context.clone();
        Self::from_dyn(&context)
    }

    pub fn from_dyn(context: &Arc<dyn BrowsingContext>) -> Self {
        Self {
            id: context.id(),
            context: Arc::downgrade(context),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Upgrade to the live context, or `None` if it has been reclaimed.
    pub fn resolve(&self) -> Option<Arc<dyn BrowsingContext>> {
        self.context.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.context.strong_count() > 0
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_resolves_while_context_alive() {
        let window = InMemoryContext::new("main");
        let handle = ContextHandle::new(&window);

        assert_eq!(handle.id(), window.id());
        assert!(handle.is_alive());
        assert_eq!(handle.resolve().unwrap().name(), "main");
    }

    #[test]
    fn test_handle_does_not_keep_context_alive() {
        let window = InMemoryContext::new("main");
        let handle = ContextHandle::new(&window);

        drop(window);

        assert!(!handle.is_alive());
        assert!(handle.resolve().is_none());
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
    }

    #[test]
    fn test_script_error_display() {
        let err = ScriptError::Runtime {
            label: "window.setTimeout".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Runtime error in window.setTimeout: boom");

        let err = ScriptError::Syntax {
            label: "inline".to_string(),
            line: SCRIPT_LINE_ANCHOR,
            message: "unexpected token".to_string(),
        };
        assert!(err.to_string().contains("at line 1"));
    }
}
