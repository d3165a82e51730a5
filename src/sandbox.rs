//! Consumed collaborator interfaces: the sandbox executor and the
//! framework detector.
//!
//! The orchestrator never manages isolation itself — it hands a shell
//! command to an opaque sandbox and interprets exit code and captured
//! output. Both collaborators are trait objects so callers (and tests)
//! inject their own implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Captured result of one sandbox command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a shell command inside an isolated execution environment.
///
/// An `Err` here means the collaborator itself could not be reached; a
/// command that ran and failed is an `Ok` with a non-zero exit code.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput>;
}

/// Best-guess build configuration for the project inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedConfig {
    pub framework: String,
    pub build_command: String,
    pub start_command: String,
    pub output_dir: String,
}

impl Default for DetectedConfig {
    /// Fallback used whenever detection fails. Detection failure must
    /// never abort a build.
    fn default() -> Self {
        Self {
            framework: "unknown".to_string(),
            build_command: "npm run build".to_string(),
            start_command: "npm start".to_string(),
            output_dir: "dist".to_string(),
        }
    }
}

/// Guesses the framework, build command and output directory for a
/// sandboxed project. Treated as a pure function dependency.
#[async_trait]
pub trait FrameworkDetector: Send + Sync {
    async fn detect(&self, sandbox_id: &str) -> anyhow::Result<DetectedConfig>;
}
