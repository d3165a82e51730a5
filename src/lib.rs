//! Conveyor: an in-process build orchestration pipeline.
//!
//! Builds move through a fixed six-stage pipeline (install, lint, test,
//! build, security, preview) inside a caller-provided sandbox. A ticking
//! scheduler drains a FIFO queue under a global concurrency ceiling, and
//! a log broker streams per-stage output to subscribers with
//! replay-then-live semantics.
//!
//! The [`orchestrator::BuildOrchestrator`] facade is the public entry
//! point; callers inject a [`sandbox::SandboxExecutor`] and a
//! [`sandbox::FrameworkDetector`].

pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod logs;
pub mod orchestrator;
pub mod sandbox;
pub mod stage;
pub mod store;

mod scheduler;

pub use build::{
    Build, BuildMetrics, BuildRequest, BuildStatus, StageKind, StageRecord, StageStatus,
    TriggerSource,
};
pub use cache::{CacheEntry, CacheStats};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, StageError};
pub use logs::{LogEntry, LogLevel};
pub use orchestrator::BuildOrchestrator;
pub use sandbox::{DetectedConfig, ExecOutput, FrameworkDetector, SandboxExecutor};
pub use stage::BuildEvent;
