//! Domain model for builds and their stages.
//!
//! A `Build` is created once by `trigger_build` and owned by the
//! `BuildStore`; its `stages` list is fixed at creation (one record per
//! `StageKind`, with skips precomputed from the request flags).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a build. Transitions are monotonic through the stage
/// sequence; `Success`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Installing,
    Linting,
    Testing,
    Building,
    Scanning,
    Deploying,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Installing => "installing",
            Self::Linting => "linting",
            Self::Testing => "testing",
            Self::Building => "building",
            Self::Scanning => "scanning",
            Self::Deploying => "deploying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states are final: no record may leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// True while a stage of this build is logically executing.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Queued) && !self.is_terminal()
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "installing" => Ok(Self::Installing),
            "linting" => Ok(Self::Linting),
            "testing" => Ok(Self::Testing),
            "building" => Ok(Self::Building),
            "scanning" => Ok(Self::Scanning),
            "deploying" => Ok(Self::Deploying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

/// Status of a single stage within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed stage sequence. Dispatch to stage bodies is exhaustive over
/// this enum; there is no "unknown stage" fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Install,
    Lint,
    Test,
    Build,
    Security,
    Preview,
}

impl StageKind {
    /// Pipeline order. Every build gets exactly these stages, in this order.
    pub const ALL: [StageKind; 6] = [
        Self::Install,
        Self::Lint,
        Self::Test,
        Self::Build,
        Self::Security,
        Self::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Build => "build",
            Self::Security => "security",
            Self::Preview => "preview",
        }
    }

    /// Display label for UIs and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Install => "Install dependencies",
            Self::Lint => "Lint & type-check",
            Self::Test => "Run tests",
            Self::Build => "Build",
            Self::Security => "Security scan",
            Self::Preview => "Publish preview",
        }
    }

    /// The overall build status while this stage is running.
    pub fn running_status(&self) -> BuildStatus {
        match self {
            Self::Install => BuildStatus::Installing,
            Self::Lint => BuildStatus::Linting,
            Self::Test => BuildStatus::Testing,
            Self::Build => BuildStatus::Building,
            Self::Security => BuildStatus::Scanning,
            Self::Preview => BuildStatus::Deploying,
        }
    }

    /// Deadline for the sandbox commands this stage runs. A timed-out
    /// command is classified exactly like a non-zero exit.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Install => Duration::from_secs(120),
            Self::Lint => Duration::from_secs(60),
            Self::Test => Duration::from_secs(180),
            Self::Build => Duration::from_secs(180),
            Self::Security => Duration::from_secs(30),
            Self::Preview => Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a build came to be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Manual,
    Webhook,
    Api,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage record, owned by its parent build. A stage marked `Skipped`
/// at creation never transitions to `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub kind: StageKind,
    pub label: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Short display lines, distinct from the full log store.
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl StageRecord {
    fn new(kind: StageKind, skipped: bool) -> Self {
        Self {
            kind,
            label: kind.label().to_string(),
            status: if skipped {
                StageStatus::Skipped
            } else {
                StageStatus::Pending
            },
            started_at: None,
            completed_at: None,
            duration_ms: None,
            logs: Vec::new(),
            error: None,
        }
    }
}

/// Parameters for triggering a build. `project_id`, `user_id` and
/// `sandbox_id` are required; everything else has documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub project_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub environment: String,
    pub triggered_by: TriggerSource,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_promote: bool,
}

impl BuildRequest {
    pub fn new(project_id: &str, user_id: &str, sandbox_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            branch: "main".to_string(),
            commit_hash: None,
            commit_message: None,
            environment: "preview".to_string(),
            triggered_by: TriggerSource::Manual,
            skip_tests: false,
            skip_lint: false,
            auto_promote: false,
        }
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_string();
        self
    }

    pub fn with_commit(mut self, hash: &str, message: &str) -> Self {
        self.commit_hash = Some(hash.to_string());
        self.commit_message = Some(message.to_string());
        self
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    pub fn with_trigger(mut self, source: TriggerSource) -> Self {
        self.triggered_by = source;
        self
    }

    pub fn with_skip_tests(mut self, skip: bool) -> Self {
        self.skip_tests = skip;
        self
    }

    pub fn with_skip_lint(mut self, skip: bool) -> Self {
        self.skip_lint = skip;
        self
    }

    pub fn with_auto_promote(mut self, auto_promote: bool) -> Self {
        self.auto_promote = auto_promote;
        self
    }
}

/// One end-to-end execution request through the stage pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub environment: String,
    pub triggered_by: TriggerSource,
    pub status: BuildStatus,
    pub stages: Vec<StageRecord>,
    pub skip_tests: bool,
    pub skip_lint: bool,
    pub auto_promote: bool,
    pub total_duration_ms: Option<i64>,
    pub artifact_url: Option<String>,
    pub preview_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(request: BuildRequest) -> Self {
        let stages = StageKind::ALL
            .iter()
            .map(|&kind| {
                let skipped = (kind == StageKind::Test && request.skip_tests)
                    || (kind == StageKind::Lint && request.skip_lint);
                StageRecord::new(kind, skipped)
            })
            .collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: request.project_id,
            user_id: request.user_id,
            sandbox_id: request.sandbox_id,
            branch: request.branch,
            commit_hash: request.commit_hash,
            commit_message: request.commit_message,
            environment: request.environment,
            triggered_by: request.triggered_by,
            status: BuildStatus::Queued,
            stages,
            skip_tests: request.skip_tests,
            skip_lint: request.skip_lint,
            auto_promote: request.auto_promote,
            total_duration_ms: None,
            artifact_url: None,
            preview_url: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn stage_mut(&mut self, kind: StageKind) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.kind == kind)
    }
}

/// Aggregate build metrics for one project, computed over `Success` and
/// `Failed` builds only ("completed" for averaging purposes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetrics {
    pub total_builds: usize,
    pub success_count: usize,
    pub fail_count: usize,
    /// Percentage with one decimal, e.g. 66.7.
    pub success_rate: f64,
    pub avg_duration_ms: Option<i64>,
    pub last_build: Option<Build>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_starts_queued_with_six_pending_stages() {
        let build = Build::new(BuildRequest::new("proj", "user", "sbx"));
        assert_eq!(build.status, BuildStatus::Queued);
        assert_eq!(build.stages.len(), 6);
        assert!(build.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(build.branch, "main");
        assert_eq!(build.environment, "preview");
        assert_eq!(build.triggered_by, TriggerSource::Manual);
    }

    #[test]
    fn skip_flags_precompute_skipped_stages() {
        let build = Build::new(
            BuildRequest::new("proj", "user", "sbx")
                .with_skip_tests(true)
                .with_skip_lint(true),
        );
        assert_eq!(build.stage(StageKind::Test).unwrap().status, StageStatus::Skipped);
        assert_eq!(build.stage(StageKind::Lint).unwrap().status, StageStatus::Skipped);
        assert_eq!(build.stage(StageKind::Install).unwrap().status, StageStatus::Pending);
    }

    #[test]
    fn stage_order_is_fixed() {
        let build = Build::new(BuildRequest::new("p", "u", "s"));
        let kinds: Vec<StageKind> = build.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
    }

    #[test]
    fn terminal_statuses() {
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(!BuildStatus::Queued.is_terminal());
        assert!(!BuildStatus::Building.is_terminal());
    }

    #[test]
    fn active_statuses_exclude_queued_and_terminal() {
        assert!(!BuildStatus::Queued.is_active());
        assert!(BuildStatus::Installing.is_active());
        assert!(BuildStatus::Deploying.is_active());
        assert!(!BuildStatus::Success.is_active());
        assert!(!BuildStatus::Cancelled.is_active());
    }

    #[test]
    fn build_status_round_trips_through_strings() {
        for status in [
            BuildStatus::Queued,
            BuildStatus::Installing,
            BuildStatus::Linting,
            BuildStatus::Testing,
            BuildStatus::Building,
            BuildStatus::Scanning,
            BuildStatus::Deploying,
            BuildStatus::Success,
            BuildStatus::Failed,
            BuildStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn stage_kind_maps_to_running_status() {
        assert_eq!(StageKind::Install.running_status(), BuildStatus::Installing);
        assert_eq!(StageKind::Preview.running_status(), BuildStatus::Deploying);
    }

    #[test]
    fn builds_get_unique_ids() {
        let a = Build::new(BuildRequest::new("p", "u", "s"));
        let b = Build::new(BuildRequest::new("p", "u", "s"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BuildStatus::Installing).unwrap();
        assert_eq!(json, "\"installing\"");
    }
}
