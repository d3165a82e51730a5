//! Per-project dependency cache.
//!
//! One entry per project, overwritten on every successful install stage.
//! Deliberately no eviction policy beyond the overwrite.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Record of a reusable install artifact captured from a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub project_id: String,
    /// Opaque reference to where the artifact was captured.
    pub sandbox_id: String,
    pub created_at: DateTime<Utc>,
}

/// Summary exposed through the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub entries: Vec<CacheEntry>,
}

#[derive(Default)]
pub struct DependencyCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, project_id: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(project_id).cloned()
    }

    /// Capture the current install artifact, replacing any prior entry
    /// for this project.
    pub async fn put(&self, project_id: &str, sandbox_id: &str) {
        let entry = CacheEntry {
            project_id: project_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            created_at: Utc::now(),
        };
        self.entries
            .lock()
            .await
            .insert(project_id.to_string(), entry);
    }

    /// Drop the entry for one project, if any. Returns whether one existed.
    pub async fn clear(&self, project_id: &str) -> bool {
        self.entries.lock().await.remove(project_id).is_some()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().await;
        let mut list: Vec<CacheEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        CacheStats {
            entry_count: list.len(),
            entries: list,
        }
    }
}
