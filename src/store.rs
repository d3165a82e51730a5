//! Authoritative build registry: id → `Build` plus the FIFO queue of ids
//! awaiting execution.
//!
//! The store is an injected object shared by the facade, the scheduler and
//! every running stage executor; all mutation goes through the single
//! mutex, which serializes per-build updates (the scheduler dequeues each
//! id at most once while active).

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::build::{Build, BuildMetrics, BuildRequest, BuildStatus};
use crate::error::OrchestratorError;

#[derive(Default)]
struct StoreInner {
    builds: HashMap<String, Build>,
    queue: VecDeque<String>,
}

#[derive(Default)]
pub struct BuildStore {
    inner: Mutex<StoreInner>,
}

impl BuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a queued build with its full stage list and append its id
    /// to the FIFO queue.
    pub async fn create(&self, request: BuildRequest) -> Build {
        let build = Build::new(request);
        let mut inner = self.inner.lock().await;
        inner.queue.push_back(build.id.clone());
        inner.builds.insert(build.id.clone(), build.clone());
        build
    }

    pub async fn get(&self, id: &str) -> Result<Build, OrchestratorError> {
        self.inner
            .lock()
            .await
            .builds
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::BuildNotFound { id: id.to_string() })
    }

    /// Cancel a build. Fails with `AlreadyCompleted` on terminal builds;
    /// otherwise stamps the terminal state. The returned flag says whether
    /// the id was still queued (and is now removed) — decided under the
    /// same lock, so a concurrent dequeue cannot be misread as queued.
    pub async fn cancel(&self, id: &str) -> Result<(Build, bool), OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::BuildNotFound { id: id.to_string() })?;
        if build.status.is_terminal() {
            return Err(OrchestratorError::AlreadyCompleted {
                id: id.to_string(),
                status: build.status,
            });
        }
        build.status = BuildStatus::Cancelled;
        build.completed_at = Some(Utc::now());
        let cancelled = build.clone();
        let before = inner.queue.len();
        inner.queue.retain(|queued| queued != id);
        let was_queued = inner.queue.len() < before;
        Ok((cancelled, was_queued))
    }

    /// Pop the oldest queued id. Scheduler-only.
    pub async fn dequeue(&self) -> Option<String> {
        self.inner.lock().await.queue.pop_front()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Apply a mutation to one build under the store lock and return the
    /// closure's result. Used by the stage executor for status stamps.
    pub async fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Build) -> R,
    ) -> Result<R, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let build = inner
            .builds
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::BuildNotFound { id: id.to_string() })?;
        Ok(f(build))
    }

    /// Builds for one project, newest first, truncated to `limit`.
    pub async fn list_by_project(&self, project_id: &str, limit: usize) -> Vec<Build> {
        let inner = self.inner.lock().await;
        let mut builds: Vec<Build> = inner
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        builds.truncate(limit);
        builds
    }

    /// Aggregate metrics for one project. Only `Success` and `Failed`
    /// builds count as "completed" for rate and duration purposes.
    pub async fn metrics(&self, project_id: &str) -> BuildMetrics {
        let inner = self.inner.lock().await;
        let builds: Vec<&Build> = inner
            .builds
            .values()
            .filter(|b| b.project_id == project_id)
            .collect();

        let success_count = builds
            .iter()
            .filter(|b| b.status == BuildStatus::Success)
            .count();
        let fail_count = builds
            .iter()
            .filter(|b| b.status == BuildStatus::Failed)
            .count();
        let completed = success_count + fail_count;

        let success_rate = if completed > 0 {
            (success_count as f64 / completed as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        // Cancelled builds may carry a duration but are not "completed".
        let durations: Vec<i64> = builds
            .iter()
            .filter(|b| matches!(b.status, BuildStatus::Success | BuildStatus::Failed))
            .filter_map(|b| b.total_duration_ms)
            .collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() / durations.len() as i64)
        };

        let last_build = builds
            .iter()
            .max_by_key(|b| b.created_at)
            .map(|b| (*b).clone());

        BuildMetrics {
            total_builds: builds.len(),
            success_count,
            fail_count,
            success_rate,
            avg_duration_ms,
            last_build,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::StageStatus;

    fn request(project: &str) -> BuildRequest {
        BuildRequest::new(project, "user-1", "sbx-1")
    }

    #[tokio::test]
    async fn create_enqueues_fifo() {
        let store = BuildStore::new();
        let first = store.create(request("p")).await;
        let second = store.create(request("p")).await;
        assert_eq!(store.queue_len().await, 2);
        assert_eq!(store.dequeue().await.as_deref(), Some(first.id.as_str()));
        assert_eq!(store.dequeue().await.as_deref(), Some(second.id.as_str()));
        assert_eq!(store.dequeue().await, None);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = BuildStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BuildNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_queued_removes_from_queue() {
        let store = BuildStore::new();
        let build = store.create(request("p")).await;
        let (cancelled, was_queued) = store.cancel(&build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert!(was_queued);
        assert_eq!(store.queue_len().await, 0);
        // no stage ever reached running
        let fetched = store.get(&build.id).await.unwrap();
        assert!(
            fetched
                .stages
                .iter()
                .all(|s| s.status == StageStatus::Pending)
        );
    }

    #[tokio::test]
    async fn cancel_after_dequeue_reports_not_queued() {
        let store = BuildStore::new();
        let build = store.create(request("p")).await;
        assert_eq!(store.dequeue().await.as_deref(), Some(build.id.as_str()));
        let (cancelled, was_queued) = store.cancel(&build.id).await.unwrap();
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
        assert!(!was_queued);
    }

    #[tokio::test]
    async fn cancel_terminal_is_conflict() {
        let store = BuildStore::new();
        let build = store.create(request("p")).await;
        store
            .update(&build.id, |b| b.status = BuildStatus::Success)
            .await
            .unwrap();
        let err = store.cancel(&build.id).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::AlreadyCompleted {
                status: BuildStatus::Success,
                ..
            }
        ));
        // no state mutation
        assert_eq!(
            store.get(&build.id).await.unwrap().status,
            BuildStatus::Success
        );
    }

    #[tokio::test]
    async fn list_is_newest_first_and_truncated() {
        let store = BuildStore::new();
        for _ in 0..5 {
            store.create(request("p")).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.create(request("other")).await;
        let listed = store.list_by_project("p", 3).await;
        assert_eq!(listed.len(), 3);
        assert!(listed.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert!(listed.iter().all(|b| b.project_id == "p"));
    }

    #[tokio::test]
    async fn metrics_rate_has_one_decimal() {
        let store = BuildStore::new();
        for status in [
            BuildStatus::Success,
            BuildStatus::Success,
            BuildStatus::Failed,
        ] {
            let build = store.create(request("p")).await;
            store
                .update(&build.id, |b| {
                    b.status = status;
                    b.total_duration_ms = Some(3000);
                })
                .await
                .unwrap();
        }
        // queued build does not count as completed
        store.create(request("p")).await;

        let metrics = store.metrics("p").await;
        assert_eq!(metrics.total_builds, 4);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.fail_count, 1);
        assert_eq!(metrics.success_rate, 66.7);
        assert_eq!(metrics.avg_duration_ms, Some(3000));
        assert!(metrics.last_build.is_some());
    }

    #[tokio::test]
    async fn metrics_avg_duration_excludes_cancelled_builds() {
        let store = BuildStore::new();
        let success = store.create(request("p")).await;
        store
            .update(&success.id, |b| {
                b.status = BuildStatus::Success;
                b.total_duration_ms = Some(1000);
            })
            .await
            .unwrap();
        // a mid-run cancel still stamps a duration; it must not skew the average
        let cancelled = store.create(request("p")).await;
        store
            .update(&cancelled.id, |b| {
                b.status = BuildStatus::Cancelled;
                b.total_duration_ms = Some(9000);
            })
            .await
            .unwrap();

        let metrics = store.metrics("p").await;
        assert_eq!(metrics.total_builds, 2);
        assert_eq!(metrics.avg_duration_ms, Some(1000));
        assert_eq!(metrics.success_rate, 100.0);
    }

    #[tokio::test]
    async fn metrics_empty_project() {
        let store = BuildStore::new();
        let metrics = store.metrics("empty").await;
        assert_eq!(metrics.total_builds, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert!(metrics.avg_duration_ms.is_none());
        assert!(metrics.last_build.is_none());
    }
}
