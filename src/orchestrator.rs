//! Public entry point: the build orchestrator facade.
//!
//! Owns the store, cache, log broker and scheduler; the sandbox executor
//! and framework detector collaborators are injected.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::build::{Build, BuildMetrics, BuildRequest};
use crate::cache::{CacheStats, DependencyCache};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::logs::{LogEntry, LogLevel, LogStore, STAGE_SYSTEM};
use crate::sandbox::{DetectedConfig, FrameworkDetector, SandboxExecutor};
use crate::scheduler::Scheduler;
use crate::stage::{BuildEvent, PipelineContext};
use crate::store::BuildStore;

pub struct BuildOrchestrator {
    ctx: Arc<PipelineContext>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl BuildOrchestrator {
    /// Create the orchestrator and start its scheduler. Must be called
    /// within a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        sandbox: Arc<dyn SandboxExecutor>,
        detector: Arc<dyn FrameworkDetector>,
    ) -> Self {
        Self::with_options(config, sandbox, detector, None)
    }

    /// Like `new`, with a channel receiving progress events (including
    /// `PromotionRequested` for the external deployment collaborator).
    pub fn with_event_channel(
        config: OrchestratorConfig,
        sandbox: Arc<dyn SandboxExecutor>,
        detector: Arc<dyn FrameworkDetector>,
        events: UnboundedSender<BuildEvent>,
    ) -> Self {
        Self::with_options(config, sandbox, detector, Some(events))
    }

    fn with_options(
        config: OrchestratorConfig,
        sandbox: Arc<dyn SandboxExecutor>,
        detector: Arc<dyn FrameworkDetector>,
        events: Option<UnboundedSender<BuildEvent>>,
    ) -> Self {
        let ctx = Arc::new(PipelineContext {
            config,
            store: Arc::new(BuildStore::new()),
            cache: Arc::new(DependencyCache::new()),
            logs: Arc::new(LogStore::new()),
            sandbox,
            detector,
            events,
        });
        let scheduler = Scheduler::spawn(Arc::clone(&ctx));
        Self {
            ctx,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Enqueue a build. It starts queued and is picked up by the next
    /// scheduler tick with free capacity.
    pub async fn trigger_build(&self, request: BuildRequest) -> Build {
        let build = self.ctx.store.create(request).await;
        tracing::info!(
            build_id = %build.id,
            project_id = %build.project_id,
            branch = %build.branch,
            triggered_by = %build.triggered_by,
            "Build queued"
        );
        self.ctx
            .logs
            .append(&build.id, STAGE_SYSTEM, LogLevel::Info, "Build queued")
            .await;
        build
    }

    pub async fn get_build(&self, id: &str) -> Result<Build, OrchestratorError> {
        self.ctx.store.get(id).await
    }

    /// Cancel a build. Cancellation is cooperative and best-effort: a
    /// queued build is removed from the queue immediately and never
    /// starts; a running build keeps its in-flight stage command until it
    /// completes (or times out) and stops before the next stage. This is
    /// a deliberate trade-off, not preemptive cancellation.
    pub async fn cancel_build(&self, id: &str) -> Result<Build, OrchestratorError> {
        let (build, was_queued) = self.ctx.store.cancel(id).await?;
        tracing::info!(build_id = %id, "Build cancelled");
        self.ctx
            .logs
            .append(id, STAGE_SYSTEM, LogLevel::Info, "Build cancelled")
            .await;
        // A still-queued build has no executor to release subscribers; a
        // dequeued one is finalized by its own task.
        if was_queued {
            self.ctx.logs.finalize(id).await;
        }
        Ok(build)
    }

    /// Builds for one project, newest first. `limit` defaults to 20.
    pub async fn list_builds(&self, project_id: &str, limit: Option<usize>) -> Vec<Build> {
        self.ctx
            .store
            .list_by_project(project_id, limit.unwrap_or(20))
            .await
    }

    pub async fn get_metrics(&self, project_id: &str) -> BuildMetrics {
        self.ctx.store.metrics(project_id).await
    }

    /// Ask the detector collaborator for a build configuration. Detection
    /// failure degrades to the documented defaults and never fails.
    pub async fn detect_build_config(&self, sandbox_id: &str) -> DetectedConfig {
        match self.ctx.detector.detect(sandbox_id).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(sandbox_id, "Framework detection failed: {e}");
                DetectedConfig::default()
            }
        }
    }

    /// Live log stream for one build: replay of stored entries first,
    /// then live entries, then a single terminal marker.
    pub async fn subscribe_logs(&self, build_id: &str) -> UnboundedReceiver<LogEntry> {
        self.ctx.logs.subscribe(build_id).await
    }

    /// Live log stream across all builds (no replay).
    pub async fn subscribe_all_logs(&self) -> UnboundedReceiver<LogEntry> {
        self.ctx.logs.subscribe_all().await
    }

    /// Snapshot of a build's stored log entries.
    pub async fn get_logs(&self, build_id: &str) -> Vec<LogEntry> {
        self.ctx.logs.get_all(build_id).await
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats().await
    }

    pub async fn clear_cache(&self, project_id: &str) -> bool {
        self.ctx.cache.clear(project_id).await
    }

    /// Stop the scheduler tick. In-flight builds are allowed to finish;
    /// queued builds stay queued. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.shutdown().await;
        }
    }
}
