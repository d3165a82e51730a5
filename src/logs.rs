//! Per-build log buffers plus publish/subscribe fan-out.
//!
//! Every appended entry is stored in the build's ordered buffer and pushed
//! to all live subscribers of that build and to the wildcard (all-builds)
//! subscribers. A new subscriber first receives the full history (replay),
//! then live entries, then a single terminal marker when the build is
//! finalized — after which its channel closes.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Pseudo-stage name for orchestration-level entries.
pub const STAGE_SYSTEM: &str = "system";
/// Pseudo-stage name of the terminal marker appended by `finalize`.
pub const STAGE_COMPLETE: &str = "complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// One immutable log line. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub build_id: String,
    /// Stage name, or `"system"` / `"complete"`.
    pub stage: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    fn new(build_id: &str, stage: &str, level: LogLevel, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            build_id: build_id.to_string(),
            stage: stage.to_string(),
            level,
            message: message.to_string(),
        }
    }

    /// True for the terminal marker that closes subscriber streams.
    pub fn is_terminal(&self) -> bool {
        self.stage == STAGE_COMPLETE
    }
}

#[derive(Default)]
struct BuildLog {
    entries: Vec<LogEntry>,
    subscribers: Vec<UnboundedSender<LogEntry>>,
    finalized_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LogInner {
    builds: HashMap<String, BuildLog>,
    wildcard: Vec<UnboundedSender<LogEntry>>,
}

/// The log broker. Passed by `Arc` to the stage executor and to any
/// transport adapter — there is no global bus.
#[derive(Default)]
pub struct LogStore {
    inner: Mutex<LogInner>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry and publish it to the build's subscribers and to
    /// wildcard subscribers.
    pub async fn append(&self, build_id: &str, stage: &str, level: LogLevel, message: &str) {
        let entry = LogEntry::new(build_id, stage, level, message);
        let mut inner = self.inner.lock().await;
        let log = inner.builds.entry(build_id.to_string()).or_default();
        log.entries.push(entry.clone());
        log.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
        inner.wildcard.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// Subscribe to one build: full replay first, then live entries. If the
    /// build is already finalized the stream ends right after the replay
    /// (the terminal marker is part of the history).
    pub async fn subscribe(&self, build_id: &str) -> UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        let log = inner.builds.entry(build_id.to_string()).or_default();
        for entry in &log.entries {
            if tx.send(entry.clone()).is_err() {
                return rx;
            }
        }
        if log.finalized_at.is_none() {
            log.subscribers.push(tx);
        }
        // finalized: drop tx, closing the stream after the replay
        rx
    }

    /// Subscribe to entries of every build, live only.
    pub async fn subscribe_all(&self) -> UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().await.wildcard.push(tx);
        rx
    }

    /// Append the terminal marker and release every subscriber of this
    /// build. Idempotent: a second call is a no-op.
    pub async fn finalize(&self, build_id: &str) {
        let mut inner = self.inner.lock().await;
        let log = inner.builds.entry(build_id.to_string()).or_default();
        if log.finalized_at.is_some() {
            return;
        }
        let marker = LogEntry::new(build_id, STAGE_COMPLETE, LogLevel::Info, "Build finalized");
        log.entries.push(marker.clone());
        for tx in log.subscribers.drain(..) {
            let _ = tx.send(marker.clone());
        }
        log.finalized_at = Some(Utc::now());
        inner.wildcard.retain(|tx| tx.send(marker.clone()).is_ok());
    }

    /// Send a liveness heartbeat to live subscribers. Heartbeats are not
    /// stored, so snapshot reads never contain them.
    pub async fn heartbeat(&self) {
        let mut inner = self.inner.lock().await;
        for (build_id, log) in inner.builds.iter_mut() {
            if log.subscribers.is_empty() {
                continue;
            }
            let entry = LogEntry::new(build_id, STAGE_SYSTEM, LogLevel::Debug, "heartbeat");
            log.subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }

    /// Snapshot of a build's stored entries without subscribing.
    pub async fn get_all(&self, build_id: &str) -> Vec<LogEntry> {
        self.inner
            .lock()
            .await
            .builds
            .get(build_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Drop log buffers for builds finalized more than `max_age` ago.
    /// Returns the number of buffers removed.
    pub async fn sweep_expired(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::hours(24));
        let mut inner = self.inner.lock().await;
        let before = inner.builds.len();
        inner
            .builds
            .retain(|_, log| log.finalized_at.is_none_or(|at| at > cutoff));
        let removed = before - inner.builds.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept expired log buffers");
        }
        removed
    }
}
