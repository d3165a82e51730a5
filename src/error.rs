//! Typed error hierarchy for the build orchestrator.
//!
//! Two top-level enums cover the two failure surfaces:
//! - `OrchestratorError` — facade operations (lookup, cancel)
//! - `StageError` — per-stage execution failures, converted into
//!   stage/build state at the executor boundary

use thiserror::Error;

use crate::build::BuildStatus;

/// Errors surfaced by the public facade operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Build {id} not found")]
    BuildNotFound { id: String },

    #[error("Build {id} is already {status} and cannot be cancelled")]
    AlreadyCompleted { id: String, status: BuildStatus },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single stage body. Never retried automatically; the
/// first failure aborts the remaining stages of that build.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Command `{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    #[error("Lint reported {count} errors")]
    LintErrors { count: u32 },

    #[error("Sandbox unavailable: {0}")]
    Sandbox(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// The short message recorded on the failed stage and the build.
    pub fn summary(&self) -> String {
        match self {
            Self::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
                stderr.trim().to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_not_found_carries_id() {
        let err = OrchestratorError::BuildNotFound { id: "abc".into() };
        match &err {
            OrchestratorError::BuildNotFound { id } => assert_eq!(id, "abc"),
            _ => panic!("Expected BuildNotFound"),
        }
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn already_completed_carries_status() {
        let err = OrchestratorError::AlreadyCompleted {
            id: "abc".into(),
            status: BuildStatus::Success,
        };
        assert!(err.to_string().contains("success"));
        assert!(matches!(
            err,
            OrchestratorError::AlreadyCompleted {
                status: BuildStatus::Success,
                ..
            }
        ));
    }

    #[test]
    fn stage_error_summary_prefers_stderr() {
        let err = StageError::CommandFailed {
            command: "npm run build".into(),
            exit_code: 1,
            stderr: "module not found\n".into(),
        };
        assert_eq!(err.summary(), "module not found");
    }

    #[test]
    fn stage_error_summary_falls_back_to_display() {
        let err = StageError::TimedOut {
            command: "npm test".into(),
            seconds: 180,
        };
        assert!(err.summary().contains("timed out after 180s"));

        let empty_stderr = StageError::CommandFailed {
            command: "npm ci".into(),
            exit_code: 2,
            stderr: "  ".into(),
        };
        assert!(empty_stderr.summary().contains("exited with code 2"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::BuildNotFound { id: "x".into() });
        assert_std_error(&StageError::LintErrors { count: 3 });
    }
}
