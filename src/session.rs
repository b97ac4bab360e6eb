//! Owner of the job managers for every browsing context of one browser session.

use crate::background_jobs::JobManager;
use crate::browsing_context::{ContextHandle, ContextId, ScriptEngine};
use crate::config::SchedulerSettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Tracks the browsing contexts of a session and their job managers.
///
/// Each attached context gets its own manager and worker, so contexts never
/// wait on each other.
pub struct Session {
    settings: SchedulerSettings,
    engine: Arc<dyn ScriptEngine>,
    shutdown_token: CancellationToken,
    managers: RwLock<HashMap<ContextId, Arc<JobManager>>>,
}

impl Session {
    pub fn new(settings: SchedulerSettings, engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            settings,
            engine,
            shutdown_token: CancellationToken::new(),
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Start a job manager for `context`, or return the existing one.
    pub async fn attach(&self, context: ContextHandle) -> Arc<JobManager> {
        let mut managers = self.managers.write().await;
        if let Some(existing) = managers.get(&context.id()) {
            return Arc::clone(existing);
        }

        let id = context.id();
        let manager = Arc::new(JobManager::start(
            context,
            Arc::clone(&self.engine),
            self.settings.clone(),
            self.shutdown_token.child_token(),
        ));
        managers.insert(id, Arc::clone(&manager));
        debug!("Attached context {} ({} total)", id, managers.len());
        manager
    }

    pub async fn job_manager(&self, id: ContextId) -> Option<Arc<JobManager>> {
        self.managers.read().await.get(&id).cloned()
    }

    pub async fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.managers.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Teardown notification for a closing context: cancel its jobs and stop
    /// its worker. Returns false if the context was not attached.
    pub async fn close_context(&self, id: ContextId) -> bool {
        let manager = self.managers.write().await.remove(&id);
        match manager {
            Some(manager) => {
                manager.cancel_all();
                manager.shutdown().await;
                info!("Closed context {}", id);
                true
            }
            None => false,
        }
    }

    /// Outstanding jobs across all contexts.
    pub async fn job_count(&self) -> usize {
        self.managers
            .read()
            .await
            .values()
            .map(|manager| manager.job_count())
            .sum()
    }

    /// Wait, up to `timeout` in total, for every context to go idle.
    ///
    /// Returns the number of jobs still outstanding afterwards.
    pub async fn wait_for_background_scripts(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        let managers: Vec<Arc<JobManager>> =
            self.managers.read().await.values().cloned().collect();

        for manager in &managers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !manager.wait_for_idle(remaining).await {
                break;
            }
        }

        managers.iter().map(|manager| manager.job_count()).sum()
    }

    /// Shut down every manager. The session rejects nothing afterwards but
    /// holds no contexts; attaching again starts fresh managers.
    pub async fn shutdown(&self) {
        let managers: Vec<Arc<JobManager>> = self
            .managers
            .write()
            .await
            .drain()
            .map(|(_, manager)| manager)
            .collect();
        info!("Shutting down session with {} contexts", managers.len());

        for manager in &managers {
            manager.shutdown().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
