//! Stage executor: runs one build's full stage sequence, fail-fast on the
//! first failing stage.
//!
//! Cancellation is cooperative: it is checked at the top of each loop
//! iteration, so an in-flight sandbox command always runs to completion
//! (or its own timeout) and the cancel takes effect before the next stage
//! begins. Callers may rely on at-most-one-stage-in-flight per build.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::build::{Build, BuildStatus, StageKind, StageStatus};
use crate::cache::DependencyCache;
use crate::config::OrchestratorConfig;
use crate::error::StageError;
use crate::logs::{LogLevel, LogStore, STAGE_SYSTEM};
use crate::sandbox::{DetectedConfig, ExecOutput, FrameworkDetector, SandboxExecutor};
use crate::store::BuildStore;

/// Cap on command output carried into stage errors and log lines.
const MAX_CAPTURED_OUTPUT: usize = 2000;

/// Progress events emitted during build execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    BuildStarted {
        build_id: String,
    },
    StageStarted {
        build_id: String,
        stage: StageKind,
    },
    StageCompleted {
        build_id: String,
        stage: StageKind,
        status: StageStatus,
    },
    BuildCompleted {
        build_id: String,
        status: BuildStatus,
    },
    /// Emitted when an auto-promote build succeeds with a preview URL.
    /// Consumed by an external deployment collaborator.
    PromotionRequested {
        build_id: String,
        preview_url: String,
    },
}

/// Everything a running pipeline needs, shared by Arc between the
/// scheduler and each spawned build task.
pub(crate) struct PipelineContext {
    pub config: OrchestratorConfig,
    pub store: Arc<BuildStore>,
    pub cache: Arc<DependencyCache>,
    pub logs: Arc<LogStore>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub detector: Arc<dyn FrameworkDetector>,
    pub events: Option<mpsc::UnboundedSender<BuildEvent>>,
}

impl PipelineContext {
    fn emit(&self, event: BuildEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// Run the whole pipeline for one build. Errors inside stage bodies are
/// converted into stage/build state here and never escape to the
/// scheduler.
pub(crate) async fn run_build(ctx: Arc<PipelineContext>, build_id: String) {
    let build = match ctx.store.get(&build_id).await {
        Ok(build) => build,
        Err(e) => {
            tracing::warn!(build_id = %build_id, "Dequeued unknown build: {e}");
            return;
        }
    };

    // Cancelled after enqueue but before launch: no-op, just release
    // any log subscribers.
    if build.status.is_terminal() {
        ctx.logs.finalize(&build_id).await;
        return;
    }

    let started = Instant::now();
    tracing::info!(
        build_id = %build_id,
        project_id = %build.project_id,
        branch = %build.branch,
        "Executing build"
    );
    ctx.logs
        .append(
            &build_id,
            STAGE_SYSTEM,
            LogLevel::Info,
            &format!("Build started on branch {}", build.branch),
        )
        .await;
    ctx.emit(BuildEvent::BuildStarted {
        build_id: build_id.clone(),
    });

    for kind in StageKind::ALL {
        let snapshot = match ctx.store.get(&build_id).await {
            Ok(b) => b,
            Err(_) => return,
        };

        // Cooperative cancellation: takes effect before the next stage.
        if snapshot.status == BuildStatus::Cancelled {
            ctx.logs
                .append(
                    &build_id,
                    STAGE_SYSTEM,
                    LogLevel::Info,
                    "Build cancelled, stopping pipeline",
                )
                .await;
            finish(&ctx, &build_id, started, BuildStatus::Cancelled).await;
            return;
        }

        let stage_status = snapshot
            .stage(kind)
            .map(|s| s.status)
            .unwrap_or(StageStatus::Pending);
        if stage_status == StageStatus::Skipped {
            stage_log(
                &ctx,
                &build_id,
                kind,
                LogLevel::Info,
                &format!("{} skipped", kind.label()),
            )
            .await;
            continue;
        }

        let _ = ctx
            .store
            .update(&build_id, |b| {
                b.status = kind.running_status();
                if let Some(stage) = b.stage_mut(kind) {
                    stage.status = StageStatus::Running;
                    stage.started_at = Some(Utc::now());
                }
            })
            .await;
        ctx.emit(BuildEvent::StageStarted {
            build_id: build_id.clone(),
            stage: kind,
        });
        tracing::info!(build_id = %build_id, stage = %kind, "Running stage");

        let result = match kind {
            StageKind::Install => run_install(&ctx, &snapshot).await,
            StageKind::Lint => run_lint(&ctx, &snapshot).await,
            StageKind::Test => run_test(&ctx, &snapshot).await,
            StageKind::Build => run_build_stage(&ctx, &snapshot).await,
            StageKind::Security => run_security(&ctx, &snapshot).await,
            StageKind::Preview => run_preview(&ctx, &snapshot).await,
        };

        match result {
            Ok(()) => {
                let _ = ctx
                    .store
                    .update(&build_id, |b| {
                        if let Some(stage) = b.stage_mut(kind) {
                            stage.status = StageStatus::Success;
                            stage.completed_at = Some(Utc::now());
                            stage.duration_ms = stage
                                .started_at
                                .zip(stage.completed_at)
                                .map(|(s, c)| (c - s).num_milliseconds());
                        }
                    })
                    .await;
                ctx.emit(BuildEvent::StageCompleted {
                    build_id: build_id.clone(),
                    stage: kind,
                    status: StageStatus::Success,
                });
                tracing::info!(build_id = %build_id, stage = %kind, "Stage passed");
            }
            Err(e) => {
                let summary = e.summary();
                stage_log(&ctx, &build_id, kind, LogLevel::Error, &summary).await;
                let _ = ctx
                    .store
                    .update(&build_id, |b| {
                        if let Some(stage) = b.stage_mut(kind) {
                            stage.status = StageStatus::Failed;
                            stage.error = Some(summary.clone());
                            stage.completed_at = Some(Utc::now());
                            stage.duration_ms = stage
                                .started_at
                                .zip(stage.completed_at)
                                .map(|(s, c)| (c - s).num_milliseconds());
                        }
                        b.error = Some(summary.clone());
                    })
                    .await;
                ctx.emit(BuildEvent::StageCompleted {
                    build_id: build_id.clone(),
                    stage: kind,
                    status: StageStatus::Failed,
                });
                tracing::warn!(build_id = %build_id, stage = %kind, error = %summary, "Stage failed");
                finish(&ctx, &build_id, started, BuildStatus::Failed).await;
                return;
            }
        }
    }

    finish(&ctx, &build_id, started, BuildStatus::Success).await;

    // Auto-promote only after a fully successful pipeline.
    if build.auto_promote {
        let current = ctx.store.get(&build_id).await.ok();
        if let Some(current) = current
            && current.status == BuildStatus::Success
            && let Some(preview_url) = current.preview_url
        {
            ctx.logs
                .append(
                    &build_id,
                    STAGE_SYSTEM,
                    LogLevel::Info,
                    "Auto-promote requested",
                )
                .await;
            ctx.emit(BuildEvent::PromotionRequested {
                build_id: build_id.clone(),
                preview_url,
            });
        }
    }
}

/// Stamp the terminal state (unless a cancel already did), record the
/// total duration, and finalize the log stream.
async fn finish(ctx: &PipelineContext, build_id: &str, started: Instant, outcome: BuildStatus) {
    let total_ms = started.elapsed().as_millis() as i64;
    let final_status = ctx
        .store
        .update(build_id, |b| {
            // A concurrent cancel wins: terminal states are final.
            if !b.status.is_terminal() {
                b.status = outcome;
                b.completed_at = Some(Utc::now());
            }
            b.total_duration_ms = Some(total_ms);
            b.status
        })
        .await
        .unwrap_or(outcome);

    ctx.logs
        .append(
            build_id,
            STAGE_SYSTEM,
            LogLevel::Info,
            &format!("Build finished: {}", final_status),
        )
        .await;
    ctx.logs.finalize(build_id).await;
    ctx.emit(BuildEvent::BuildCompleted {
        build_id: build_id.to_string(),
        status: final_status,
    });
    tracing::info!(build_id = %build_id, status = %final_status, total_ms, "Build finished");
}

/// Append to the full log store and mirror a short line onto the stage
/// record for quick display.
async fn stage_log(
    ctx: &PipelineContext,
    build_id: &str,
    kind: StageKind,
    level: LogLevel,
    message: &str,
) {
    ctx.logs
        .append(build_id, kind.as_str(), level, message)
        .await;
    let line = message.to_string();
    let _ = ctx
        .store
        .update(build_id, |b| {
            if let Some(stage) = b.stage_mut(kind) {
                stage.logs.push(line);
            }
        })
        .await;
}

/// Run one sandbox command under the stage's deadline. A timeout or an
/// unreachable sandbox is a stage failure; a non-zero exit is returned to
/// the caller for stage-specific classification.
async fn run_command(
    ctx: &PipelineContext,
    build: &Build,
    kind: StageKind,
    command: &str,
) -> Result<ExecOutput, StageError> {
    let timeout = kind.timeout();
    match tokio::time::timeout(
        timeout,
        ctx.sandbox.execute(&build.sandbox_id, command, timeout),
    )
    .await
    {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(StageError::Sandbox(e.to_string())),
        Err(_) => Err(StageError::TimedOut {
            command: command.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn command_failed(command: &str, output: &ExecOutput) -> StageError {
    let captured = if output.stderr.trim().is_empty() {
        &output.stdout
    } else {
        &output.stderr
    };
    StageError::CommandFailed {
        command: command.to_string(),
        exit_code: output.exit_code,
        stderr: truncate_output(captured),
    }
}

fn truncate_output(s: &str) -> String {
    let s = s.trim();
    if s.len() <= MAX_CAPTURED_OUTPUT {
        return s.to_string();
    }
    let start = s.len() - MAX_CAPTURED_OUTPUT;
    let boundary = s
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(start);
    format!("...{}", &s[boundary..])
}

// ── Stage bodies ─────────────────────────────────────────────────────

const INSTALL_COMMAND: &str = "npm ci --prefer-offline";
const TYPECHECK_COMMAND: &str = "npx tsc --noEmit";
const LINT_COMMAND: &str = "npx eslint .";
const TEST_PROBE_COMMAND: &str = "npm pkg get scripts.test";
const TEST_COMMAND: &str = "npm test --silent";
const AUDIT_COMMAND: &str = "npm audit --json";

async fn run_install(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    if let Some(entry) = ctx.cache.get(&build.project_id).await {
        stage_log(
            ctx,
            &build.id,
            StageKind::Install,
            LogLevel::Info,
            &format!(
                "Dependency cache hit (captured {})",
                entry.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        )
        .await;
    }

    let output = run_command(ctx, build, StageKind::Install, INSTALL_COMMAND).await?;
    if !output.success() {
        return Err(command_failed(INSTALL_COMMAND, &output));
    }

    ctx.cache.put(&build.project_id, &build.sandbox_id).await;
    stage_log(
        ctx,
        &build.id,
        StageKind::Install,
        LogLevel::Info,
        "Dependencies installed, cache entry recorded",
    )
    .await;
    Ok(())
}

async fn run_lint(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    // Type-check issues are advisory only.
    let typecheck = run_command(ctx, build, StageKind::Lint, TYPECHECK_COMMAND).await?;
    if typecheck.success() {
        stage_log(
            ctx,
            &build.id,
            StageKind::Lint,
            LogLevel::Info,
            "Type-check passed",
        )
        .await;
    } else {
        stage_log(
            ctx,
            &build.id,
            StageKind::Lint,
            LogLevel::Warn,
            &format!(
                "Type-check reported issues: {}",
                truncate_output(&typecheck.stdout)
            ),
        )
        .await;
    }

    let lint = run_command(ctx, build, StageKind::Lint, LINT_COMMAND).await?;
    if lint.success() {
        stage_log(
            ctx,
            &build.id,
            StageKind::Lint,
            LogLevel::Info,
            "Lint passed with zero errors",
        )
        .await;
        return Ok(());
    }

    let combined = format!("{}\n{}", lint.stdout, lint.stderr);
    if is_missing_lint_config(&combined) {
        stage_log(
            ctx,
            &build.id,
            StageKind::Lint,
            LogLevel::Info,
            "No lint configuration found, skipping lint",
        )
        .await;
        return Ok(());
    }

    match parse_lint_error_count(&combined) {
        Some(0) => Ok(()),
        Some(count) => Err(StageError::LintErrors { count }),
        None => Err(command_failed(LINT_COMMAND, &lint)),
    }
}

async fn run_test(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    let probe = run_command(ctx, build, StageKind::Test, TEST_PROBE_COMMAND).await?;
    if !has_test_script(&probe.stdout) {
        stage_log(
            ctx,
            &build.id,
            StageKind::Test,
            LogLevel::Info,
            "No test script configured, nothing to run",
        )
        .await;
        return Ok(());
    }

    let output = run_command(ctx, build, StageKind::Test, TEST_COMMAND).await?;
    if !output.success() {
        return Err(command_failed(TEST_COMMAND, &output));
    }
    stage_log(
        ctx,
        &build.id,
        StageKind::Test,
        LogLevel::Info,
        "Tests passed",
    )
    .await;
    Ok(())
}

async fn run_build_stage(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    // Detection failure never aborts a build.
    let detected = match ctx.detector.detect(&build.sandbox_id).await {
        Ok(config) => config,
        Err(e) => {
            stage_log(
                ctx,
                &build.id,
                StageKind::Build,
                LogLevel::Warn,
                &format!("Framework detection failed ({e}), using defaults"),
            )
            .await;
            DetectedConfig::default()
        }
    };
    stage_log(
        ctx,
        &build.id,
        StageKind::Build,
        LogLevel::Info,
        &format!(
            "Building {} project with `{}`",
            detected.framework, detected.build_command
        ),
    )
    .await;

    let output = run_command(ctx, build, StageKind::Build, &detected.build_command).await?;
    if !output.success() {
        return Err(command_failed(&detected.build_command, &output));
    }

    let probe_cmd = format!("test -d {}", detected.output_dir);
    let probe = run_command(ctx, build, StageKind::Build, &probe_cmd).await?;
    if probe.success() {
        let artifact_url = format!(
            "https://artifacts.{}/{}/{}.tar.gz",
            ctx.config.preview_domain, build.id, detected.output_dir
        );
        let _ = ctx
            .store
            .update(&build.id, |b| b.artifact_url = Some(artifact_url.clone()))
            .await;
        stage_log(
            ctx,
            &build.id,
            StageKind::Build,
            LogLevel::Info,
            &format!("Artifact recorded: {artifact_url}"),
        )
        .await;
    } else {
        stage_log(
            ctx,
            &build.id,
            StageKind::Build,
            LogLevel::Warn,
            &format!(
                "Output directory {} not found, no artifact recorded",
                detected.output_dir
            ),
        )
        .await;
    }
    Ok(())
}

async fn run_security(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    // Findings never fail this stage; only the log severity changes.
    let output = run_command(ctx, build, StageKind::Security, AUDIT_COMMAND).await?;
    let counts = parse_audit_counts(&output.stdout);
    let (level, message) = match counts {
        Some((0, 0)) => (LogLevel::Info, "Audit clean, no vulnerabilities".to_string()),
        Some((critical, total)) if critical > 0 => (
            LogLevel::Error,
            format!("Audit found {total} vulnerabilities ({critical} critical)"),
        ),
        Some((_, total)) => (
            LogLevel::Warn,
            format!("Audit found {total} vulnerabilities (none critical)"),
        ),
        None => (
            LogLevel::Warn,
            "Audit output could not be parsed".to_string(),
        ),
    };
    stage_log(ctx, &build.id, StageKind::Security, level, &message).await;
    Ok(())
}

async fn run_preview(ctx: &PipelineContext, build: &Build) -> Result<(), StageError> {
    // Deterministic bookkeeping, no sandbox call.
    let short_id: String = build.id.chars().take(8).collect();
    let preview_url = format!("https://{}.{}", short_id, ctx.config.preview_domain);
    let _ = ctx
        .store
        .update(&build.id, |b| b.preview_url = Some(preview_url.clone()))
        .await;
    stage_log(
        ctx,
        &build.id,
        StageKind::Preview,
        LogLevel::Info,
        &format!("Preview available at {preview_url}"),
    )
    .await;
    Ok(())
}

// ── Output classification ────────────────────────────────────────────

static LINT_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+errors?").expect("lint summary regex"));
static AUDIT_CRITICAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+critical").expect("audit critical regex"));

fn is_missing_lint_config(output: &str) -> bool {
    output.contains("No ESLint configuration")
        || output.contains("couldn't find a configuration file")
        || output.contains("could not find a configuration file")
}

/// Pull the error count out of eslint's `N problems (M errors, ...)`
/// summary line.
fn parse_lint_error_count(output: &str) -> Option<u32> {
    LINT_SUMMARY_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// `npm pkg get scripts.test` prints `{}` or an empty value when the
/// script is absent.
fn has_test_script(stdout: &str) -> bool {
    let trimmed = stdout.trim();
    !(trimmed.is_empty() || trimmed == "{}" || trimmed == "undefined")
}

/// Returns `(critical, total)` vulnerability counts from `npm audit
/// --json` output, falling back to a text scrape when the JSON is
/// malformed.
fn parse_audit_counts(stdout: &str) -> Option<(u64, u64)> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout)
        && let Some(vulns) = value
            .get("metadata")
            .and_then(|m| m.get("vulnerabilities"))
            .and_then(|v| v.as_object())
    {
        let critical = vulns.get("critical").and_then(|v| v.as_u64()).unwrap_or(0);
        let total = vulns
            .values()
            .filter_map(|v| v.as_u64())
            .sum::<u64>()
            // `total` is reported alongside the severity buckets; avoid
            // double-counting when present.
            .min(vulns.get("total").and_then(|v| v.as_u64()).unwrap_or(u64::MAX));
        return Some((critical, total));
    }
    AUDIT_CRITICAL_RE
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .map(|critical| (critical, critical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lint_error_count_from_summary_line() {
        let output = "\n/app/src/index.ts\n  1:1  error  Unexpected var\n\n\u{2716} 3 problems (2 errors, 1 warning)\n";
        assert_eq!(parse_lint_error_count(output), Some(2));
    }

    #[test]
    fn lint_single_error_singular_form() {
        assert_eq!(parse_lint_error_count("1 problem (1 error, 0 warnings)"), Some(1));
    }

    #[test]
    fn lint_count_absent_when_unparsable() {
        assert_eq!(parse_lint_error_count("command blew up"), None);
    }

    #[test]
    fn missing_lint_config_is_detected() {
        assert!(is_missing_lint_config(
            "Oops! Something went wrong!\nESLint couldn't find a configuration file."
        ));
        assert!(is_missing_lint_config("No ESLint configuration found in /app"));
        assert!(!is_missing_lint_config("2 problems (2 errors, 0 warnings)"));
    }

    #[test]
    fn test_script_probe() {
        assert!(!has_test_script("{}"));
        assert!(!has_test_script(""));
        assert!(!has_test_script("  undefined\n"));
        assert!(has_test_script("\"vitest run\"\n"));
    }

    #[test]
    fn audit_counts_from_json() {
        let stdout = r#"{"metadata":{"vulnerabilities":{"info":0,"low":1,"moderate":0,"high":2,"critical":1,"total":4}}}"#;
        assert_eq!(parse_audit_counts(stdout), Some((1, 4)));
    }

    #[test]
    fn audit_counts_clean() {
        let stdout = r#"{"metadata":{"vulnerabilities":{"info":0,"low":0,"moderate":0,"high":0,"critical":0,"total":0}}}"#;
        assert_eq!(parse_audit_counts(stdout), Some((0, 0)));
    }

    #[test]
    fn audit_counts_text_fallback() {
        assert_eq!(parse_audit_counts("found 2 critical vulnerabilities"), Some((2, 2)));
        assert_eq!(parse_audit_counts("garbage"), None);
    }

    #[test]
    fn truncation_keeps_the_tail() {
        let long = "x".repeat(MAX_CAPTURED_OUTPUT + 100);
        let truncated = truncate_output(&long);
        assert!(truncated.starts_with("..."));
        assert!(truncated.len() <= MAX_CAPTURED_OUTPUT + 3);
        assert_eq!(truncate_output(" short "), "short");
    }

    #[test]
    fn build_event_serializes_tagged() {
        let event = BuildEvent::StageStarted {
            build_id: "b1".into(),
            stage: StageKind::Install,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("stage_started"));
        assert!(json.contains("install"));
    }
}
