//! Runtime configuration for the orchestrator.

use std::time::Duration;

/// Tunables for scheduling, log fan-out and retention. Defaults match the
/// production values; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global ceiling on concurrently executing builds.
    pub max_concurrent_builds: usize,
    /// How often the scheduler checks the queue.
    pub tick_interval: Duration,
    /// How often live log subscribers receive a liveness heartbeat.
    pub heartbeat_interval: Duration,
    /// Age after which a finalized build's log buffer is swept.
    pub log_retention: Duration,
    /// Domain under which preview URLs are derived.
    pub preview_domain: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 3,
            tick_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            log_retention: Duration::from_secs(24 * 60 * 60),
            preview_domain: "preview.localhost".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_concurrent_builds(mut self, max: usize) -> Self {
        self.max_concurrent_builds = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_log_retention(mut self, retention: Duration) -> Self {
        self.log_retention = retention;
        self
    }

    pub fn with_preview_domain(mut self, domain: &str) -> Self {
        self.preview_domain = domain.to_string();
        self
    }
}
