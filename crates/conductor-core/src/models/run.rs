//! Workflow run and step models.
//!
//! A run is one execution instance of a declared step graph. Step kinds form
//! a closed sum type so the engine's dispatch is exhaustive at compile time
//! when new kinds are added.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::approval::RiskLevel;
use crate::models::condition::Condition;

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Status of a single step within a run.
///
/// `skipped` marks the not-chosen branch of a conditional (and its
/// descendants); `aborted` marks cooperative cancellation, distinct from
/// `failed` so resume can re-dispatch the step with its preserved token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One prompt of a `parallel` step, dispatched on its own session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelTask {
    pub role: String,
    pub task: String,
}

/// Kind-specific step behavior. Closed set — the engine matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    /// A single template-substituted prompt sent to the assigned role's session.
    Task,
    /// Several prompts dispatched concurrently; completes when all succeed.
    Parallel { tasks: Vec<ParallelTask> },
    /// Evaluates a predicate over accumulated step outputs, then marks only
    /// the chosen branch eligible; the other branch is permanently skipped.
    Conditional {
        predicate: Condition,
        true_branch: String,
        false_branch: String,
    },
    /// Iterates a bounded item list, one task execution per item with the
    /// loop variable substituted into the task template.
    Loop {
        items: Vec<String>,
        loop_var: String,
        max_iterations: u32,
    },
    /// Pauses the run until an external decision resolves the approval.
    HumanApproval {
        prompt: String,
        #[serde(default)]
        risk_level: RiskLevel,
        timeout_seconds: i64,
        #[serde(default)]
        auto_approve_after_timeout: bool,
    },
}

impl StepKind {
    /// Discriminator string, used as the `kind` column for queries.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Parallel { .. } => "parallel",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
            Self::HumanApproval { .. } => "human-approval",
        }
    }
}

/// Declared step of a workflow graph, as submitted to `start()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id (unique within the run, used for dependency references).
    pub id: String,

    /// Role/agent assigned to execute this step.
    #[serde(default)]
    pub role: String,

    /// Task template — supports `${steps.<id>.output}` and `${<var>}`.
    #[serde(default)]
    pub task: String,

    /// Ids of steps that must complete before this one becomes ready.
    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(flatten)]
    pub kind: StepKind,

    /// When set, a failure here only skip-propagates to dependents instead
    /// of failing the whole run.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl StepSpec {
    /// Convenience constructor for a plain task step.
    pub fn task(id: &str, role: &str, task: &str, deps: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            task: task.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            kind: StepKind::Task,
            continue_on_error: false,
        }
    }
}

/// Options accepted by `WorkflowEngine::start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOptions {
    /// Parallelism bound for in-flight steps.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Working directory handed to agent sessions.
    #[serde(default)]
    pub working_directory: String,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            working_directory: String::new(),
        }
    }
}

/// Persisted run header row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub status: RunStatus,
    pub max_parallel: usize,
    /// Working directory handed to agent sessions; persisted so resume
    /// dispatches into the same tree.
    pub working_directory: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted per-step row: the declared spec plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRow {
    pub run_id: String,
    pub id: String,
    pub position: i64,
    pub role: String,
    pub task: String,
    pub deps: Vec<String>,
    pub kind: StepKind,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub continuation_token: Option<String>,
    pub continue_on_error: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-step slice of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCheckpoint {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// Persisted snapshot of run progress, appended after every step transition.
/// Resume restores from a checkpoint so completed work never re-executes and
/// issued continuation tokens are never lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    /// Step ids ready or in flight at snapshot time.
    pub frontier: Vec<String>,
    pub step_state: HashMap<String, StepCheckpoint>,
    pub created_at: i64,
}

/// Read-only projection returned by `WorkflowEngine::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub steps: Vec<StepRow>,
    pub frontier: Vec<String>,
}

impl RunSnapshot {
    /// Status of a single step, if present.
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.id == step_id).map(|s| s.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_kind_round_trips_through_json() {
        let spec = StepSpec {
            id: "gate".into(),
            role: "ops".into(),
            task: String::new(),
            deps: vec!["build".into()],
            kind: StepKind::HumanApproval {
                prompt: "Deploy to prod?".into(),
                risk_level: RiskLevel::High,
                timeout_seconds: 3600,
                auto_approve_after_timeout: false,
            },
            continue_on_error: false,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"human-approval\""));
        let back: StepSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind.tag(), "human-approval");
        assert_eq!(back.deps, vec!["build".to_string()]);
    }

    #[test]
    fn statuses_parse_back() {
        for s in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Aborted,
        ] {
            assert_eq!(StepStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("aborted"), Some(RunStatus::Aborted));
        assert_eq!(RunStatus::parse("nope"), None);
    }
}
