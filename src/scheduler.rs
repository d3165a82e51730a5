//! Ticking scheduler: drains the FIFO queue under the global concurrency
//! ceiling and launches each build on its own task.
//!
//! The ceiling is a semaphore; the owned permit moves into the spawned
//! build task and is released when the task ends, whatever the outcome.
//! The same loop drives the log heartbeat and the log retention sweep.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::stage::{PipelineContext, run_build};

pub(crate) struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(ctx: Arc<PipelineContext>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_builds));

        let handle = tokio::spawn(async move {
            // First tick one full period out, then steady.
            let mut tick = interval_after(ctx.config.tick_interval);
            let mut heartbeat = interval_after(ctx.config.heartbeat_interval);
            // Sweeping twice per retention window is plenty.
            let mut sweep = interval_after(ctx.config.log_retention / 2);

            tracing::info!(
                max_concurrent = ctx.config.max_concurrent_builds,
                "Build scheduler started"
            );

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        try_launch(&ctx, &semaphore).await;
                    }
                    _ = heartbeat.tick() => {
                        ctx.logs.heartbeat().await;
                    }
                    _ = sweep.tick() => {
                        ctx.logs.sweep_expired(ctx.config.log_retention).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Build scheduler stopped");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the tick. In-flight builds run to completion on their own
    /// tasks (fail-soft shutdown, no forced termination).
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

fn interval_after(period: std::time::Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// One tick: if capacity remains, dequeue exactly one id (FIFO) and
/// launch it. Launch pacing is one build per tick; a backlog drains at
/// the tick rate, never in a burst.
async fn try_launch(ctx: &Arc<PipelineContext>, semaphore: &Arc<Semaphore>) {
    let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
        return;
    };
    let Some(build_id) = ctx.store.dequeue().await else {
        return; // permit dropped, capacity unchanged
    };
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let _permit = permit; // held for the lifetime of the build
        run_build(ctx, build_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::build::{BuildRequest, BuildStatus};
    use crate::cache::DependencyCache;
    use crate::config::OrchestratorConfig;
    use crate::logs::LogStore;
    use crate::sandbox::{DetectedConfig, ExecOutput, FrameworkDetector, SandboxExecutor};
    use crate::store::BuildStore;

    struct AlwaysOk;

    #[async_trait]
    impl SandboxExecutor for AlwaysOk {
        async fn execute(
            &self,
            _sandbox_id: &str,
            _command: &str,
            _timeout: Duration,
        ) -> anyhow::Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: "\"vitest run\"".to_string(),
                stderr: String::new(),
                duration_ms: 1,
            })
        }
    }

    struct DefaultDetector;

    #[async_trait]
    impl FrameworkDetector for DefaultDetector {
        async fn detect(&self, _sandbox_id: &str) -> anyhow::Result<DetectedConfig> {
            Ok(DetectedConfig::default())
        }
    }

    fn context(max_concurrent: usize) -> Arc<PipelineContext> {
        Arc::new(PipelineContext {
            config: OrchestratorConfig::default()
                .with_max_concurrent_builds(max_concurrent)
                .with_tick_interval(Duration::from_millis(5))
                .with_heartbeat_interval(Duration::from_secs(60)),
            store: Arc::new(BuildStore::new()),
            cache: Arc::new(DependencyCache::new()),
            logs: Arc::new(LogStore::new()),
            sandbox: Arc::new(AlwaysOk),
            detector: Arc::new(DefaultDetector),
            events: None,
        })
    }

    #[tokio::test]
    async fn drains_the_queue_and_completes_builds() {
        let ctx = context(3);
        let build = ctx
            .store
            .create(BuildRequest::new("proj", "user", "sbx"))
            .await;

        let scheduler = Scheduler::spawn(Arc::clone(&ctx));
        for _ in 0..200 {
            if ctx.store.get(&build.id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.shutdown().await;

        let done = ctx.store.get(&build.id).await.unwrap();
        assert_eq!(done.status, BuildStatus::Success);
        assert_eq!(ctx.store.queue_len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_the_tick() {
        let ctx = context(1);
        let scheduler = Scheduler::spawn(Arc::clone(&ctx));
        scheduler.shutdown().await;

        // Builds enqueued after shutdown are never picked up.
        let build = ctx
            .store
            .create(BuildRequest::new("proj", "user", "sbx"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ctx.store.get(&build.id).await.unwrap().status,
            BuildStatus::Queued
        );
    }
}
