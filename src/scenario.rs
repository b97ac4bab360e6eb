//! Scripted runs of the scheduler against in-memory browsing contexts.
//!
//! A scenario is a TOML file listing contexts and the jobs their scripts
//! schedule. The runner plays it through a [`Session`] whose script engine
//! records every execution, and reports the timeline plus per-context state.

use crate::background_jobs::{DispatchStats, JobInfo, JobManager};
use crate::browsing_context::{
    BrowsingContext, ContextHandle, ContextId, Document, ExecutionRecord, InMemoryContext,
    InMemoryDocument, RecordingEngine,
};
use crate::config::AppConfig;
use crate::session::Session;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Scenario {
    pub contexts: Vec<ScenarioContext>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ScenarioContext {
    pub name: String,
    /// HTML page loaded before any job is scheduled. Defaults to `about:blank`.
    pub url: Option<String>,
    /// Close the context this long after the run starts.
    pub close_after_ms: Option<u64>,
    pub jobs: Vec<ScenarioJob>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ScenarioJob {
    pub label: String,
    pub delay_ms: i64,
    pub period_ms: Option<i64>,
    pub source: String,
    pub cancel_after_ms: Option<u64>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse scenario file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(content)?;
        if scenario.contexts.is_empty() {
            bail!("Scenario defines no contexts");
        }
        if let Some(unnamed) = scenario.contexts.iter().position(|c| c.name.is_empty()) {
            bail!("Context #{} has no name", unnamed + 1);
        }
        Ok(scenario)
    }
}

/// A job the scheduler refused to accept.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedJob {
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    pub name: String,
    pub id: ContextId,
    pub closed: bool,
    pub stats: DispatchStats,
    /// Jobs still outstanding when the run ended.
    pub pending: Vec<JobInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    /// Whether every context went idle before the idle timeout.
    pub idle: bool,
    pub outstanding_jobs: usize,
    /// Every script execution across all contexts, in run order.
    pub executions: Vec<ExecutionRecord>,
    pub contexts: Vec<ContextReport>,
}

struct RunningContext {
    entry: ScenarioContext,
    window: Arc<InMemoryContext>,
    manager: Arc<JobManager>,
    rejected: Vec<RejectedJob>,
}

/// Play `scenario` to completion and report what ran.
pub async fn run_scenario(scenario: &Scenario, config: &AppConfig) -> Result<ScenarioReport> {
    let engine = RecordingEngine::new();
    let session = Arc::new(Session::new(config.scheduler.clone(), engine.clone()));
    let mut contexts = Vec::with_capacity(scenario.contexts.len());
    let mut timers: Vec<JoinHandle<()>> = Vec::new();

    for entry in &scenario.contexts {
        let window = InMemoryContext::new(entry.name.clone());
        if let Some(url) = &entry.url {
            let document: Arc<dyn Document> = InMemoryDocument::html(url.clone());
            window.load(Some(document));
        }
        let manager = session.attach(ContextHandle::new(&window)).await;

        let mut rejected = Vec::new();
        for job in &entry.jobs {
            match schedule_job(&manager, job) {
                Ok(Some(timer)) => timers.push(timer),
                Ok(None) => {}
                Err(e) => {
                    warn!("Context {}: job '{}' rejected: {}", entry.name, job.label, e);
                    rejected.push(RejectedJob {
                        label: job.label.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(close_after_ms) = entry.close_after_ms {
            let session = Arc::clone(&session);
            let window = Arc::clone(&window);
            timers.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(close_after_ms)).await;
                window.close();
                session.close_context(window.id()).await;
            }));
        }

        contexts.push(RunningContext {
            entry: entry.clone(),
            window,
            manager,
            rejected,
        });
    }

    info!(
        "Scenario started with {} contexts, waiting up to {:?} for idle",
        contexts.len(),
        config.idle_timeout
    );
    let mut outstanding = session
        .wait_for_background_scripts(config.idle_timeout)
        .await;
    // Contexts closed mid-run are no longer tracked by the session.
    outstanding = outstanding.max(contexts.iter().map(|c| c.manager.job_count()).sum());

    for timer in &timers {
        timer.abort();
    }

    let reports = contexts
        .into_iter()
        .map(|running| ContextReport {
            id: running.window.id(),
            name: running.entry.name,
            closed: running.window.is_closed(),
            stats: running.manager.stats(),
            pending: running.manager.pending_jobs(),
            rejected: running.rejected,
        })
        .collect();

    session.shutdown().await;
    info!("Scenario finished with {} jobs outstanding", outstanding);

    Ok(ScenarioReport {
        idle: outstanding == 0,
        outstanding_jobs: outstanding,
        executions: engine.executions(),
        contexts: reports,
    })
}

/// Schedule one job, returning the timer that cancels it later if requested.
fn schedule_job(manager: &Arc<JobManager>, job: &ScenarioJob) -> Result<Option<JoinHandle<()>>> {
    let id = manager.schedule_source(
        job.delay_ms,
        job.period_ms,
        job.label.clone(),
        job.source.clone(),
    )?;

    Ok(job.cancel_after_ms.map(|cancel_after_ms| {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(cancel_after_ms)).await;
            manager.cancel(id);
        })
    }))
}
