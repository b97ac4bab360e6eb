//! In-memory browsing context, document and script engine.
//!
//! Used by the command line runner and by tests that need real objects on the
//! other side of the scheduler boundary without a full browser.

use super::{BrowsingContext, ContextId, Document, ScriptEngine, ScriptError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// A document that is either an HTML page or something script cannot touch.
#[derive(Debug, Clone)]
pub struct InMemoryDocument {
    url: String,
    script_capable: bool,
}

impl InMemoryDocument {
    pub fn html(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            script_capable: true,
        })
    }

    /// A non-HTML document, such as a plain text or image response.
    pub fn non_html(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            script_capable: false,
        })
    }
}

impl Document for InMemoryDocument {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_script_capable(&self) -> bool {
        self.script_capable
    }
}

/// Browsing context whose lifecycle is driven by explicit calls.
pub struct InMemoryContext {
    id: ContextId,
    name: String,
    closed: AtomicBool,
    registered: AtomicBool,
    document: RwLock<Option<Arc<dyn Document>>>,
}

impl InMemoryContext {
    /// Create an open, registered context holding an `about:blank` HTML page.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let document: Arc<dyn Document> = InMemoryDocument::html("about:blank");
        Arc::new(Self {
            id: ContextId::new(),
            name: name.into(),
            closed: AtomicBool::new(false),
            registered: AtomicBool::new(true),
            document: RwLock::new(Some(document)),
        })
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Browsing context {} ({}) closed", self.name, self.id);
        }
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// Replace the loaded document. `None` models a context between pages.
    pub fn load(&self, document: Option<Arc<dyn Document>>) {
        let mut current = self.document.write().unwrap_or_else(PoisonError::into_inner);
        *current = document;
    }
}

impl BrowsingContext for InMemoryContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn current_document(&self) -> Option<Arc<dyn Document>> {
        self.document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One call into [`RecordingEngine::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub label: String,
    pub source: String,
    pub document_url: String,
    /// Milliseconds since the engine was created.
    pub offset_ms: u64,
    pub failed: bool,
}

/// Script engine that records what it was asked to run.
///
/// Sources starting with `throw` fail with a runtime error, which lets tests
/// and scenarios exercise the failure path without a real interpreter.
pub struct RecordingEngine {
    started_at: Instant,
    records: Mutex<Vec<ExecutionRecord>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sources in the order they were executed.
    pub fn sources(&self) -> Vec<String> {
        self.executions().into_iter().map(|r| r.source).collect()
    }

    pub fn count_for(&self, label: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.label == label)
            .count()
    }
}

impl ScriptEngine for RecordingEngine {
    fn execute(
        &self,
        document: &dyn Document,
        source: &str,
        label: &str,
        line_anchor: u32,
    ) -> Result<(), ScriptError> {
        let failed = source.trim_start().starts_with("throw");
        let record = ExecutionRecord {
            label: label.to_string(),
            source: source.to_string(),
            document_url: document.url().to_string(),
            offset_ms: self.started_at.elapsed().as_millis() as u64,
            failed,
        };
        debug!(
            "Executing {} against {} (line {}): {}",
            label,
            document.url(),
            line_anchor,
            source
        );
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);

        if failed {
            return Err(ScriptError::Runtime {
                label: label.to_string(),
                message: format!("uncaught exception: {}", source.trim()),
            });
        }
        Ok(())
    }
}
