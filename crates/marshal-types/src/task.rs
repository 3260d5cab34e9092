use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::step::{RiskLevel, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Planning,
    Planned,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal edges of the lifecycle state machine. `Planned -> Completed`
    /// is the dry-run short-circuit; `Cancelled` is reachable from every
    /// non-terminal state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Created, TaskStatus::Planning)
                | (TaskStatus::Planning, TaskStatus::Planned)
                | (TaskStatus::Planning, TaskStatus::Failed)
                | (TaskStatus::Planned, TaskStatus::AwaitingApproval)
                | (TaskStatus::Planned, TaskStatus::Executing)
                | (TaskStatus::Planned, TaskStatus::Completed)
                | (TaskStatus::AwaitingApproval, TaskStatus::Executing)
                | (TaskStatus::AwaitingApproval, TaskStatus::Failed)
                | (TaskStatus::Executing, TaskStatus::Completed)
                | (TaskStatus::Executing, TaskStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planning => "planning",
            TaskStatus::Planned => "planned",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    PlanningFailed,
    Rejected,
    StepFailed,
    Cancelled,
    LockTimeout,
}

/// Structured terminal error: kind plus the failing step where one applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step_index: None,
            message: message.into(),
        }
    }

    pub fn at_step(kind: TaskErrorKind, index: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            step_index: Some(index),
            message: message.into(),
        }
    }
}

/// Structured hints accompanying the instruction; immutable after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub generate_preview: bool,
}

/// Lifecycle timestamps, each set at most once and in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl TaskTimestamps {
    pub fn now() -> Self {
        Self {
            created: Utc::now(),
            planning_started: None,
            planning_finished: None,
            execution_started: None,
            finished: None,
        }
    }
}

/// Deterministic preview of what a frozen plan would do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPreview {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub step_summaries: Vec<String>,
    pub risk: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub headline: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// One instruction's full lifecycle record, from submission to terminal
/// state. Mutated only by its owning orchestrator task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instruction: String,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub options: TaskOptions,
    pub status: TaskStatus,
    #[serde(default)]
    pub plan: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    /// Present once planning finishes when the task asked for a preview
    /// (or is a dry run), so observers can inspect it before approving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PlanPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalDecision>,
    pub timestamps: TaskTimestamps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskSummary>,
}

impl Task {
    pub fn new(instruction: impl Into<String>, context: TaskContext, options: TaskOptions) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            instruction: instruction.into(),
            context,
            options,
            status: TaskStatus::Created,
            plan: Vec::new(),
            risk_level: None,
            preview: None,
            approval: None,
            timestamps: TaskTimestamps::now(),
            error: None,
            result: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(!terminal.can_transition_to(TaskStatus::Executing));
            assert!(!terminal.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn cancellation_reachable_from_every_non_terminal_state() {
        for state in [
            TaskStatus::Created,
            TaskStatus::Planning,
            TaskStatus::Planned,
            TaskStatus::AwaitingApproval,
            TaskStatus::Executing,
        ] {
            assert!(state.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn lifecycle_edges_match_the_state_machine() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Planning));
        assert!(TaskStatus::Planning.can_transition_to(TaskStatus::Planned));
        assert!(TaskStatus::Planning.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Planned.can_transition_to(TaskStatus::AwaitingApproval));
        assert!(TaskStatus::Planned.can_transition_to(TaskStatus::Executing));
        assert!(TaskStatus::Planned.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::AwaitingApproval.can_transition_to(TaskStatus::Executing));
        assert!(TaskStatus::AwaitingApproval.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Executing.can_transition_to(TaskStatus::Completed));

        assert!(!TaskStatus::Created.can_transition_to(TaskStatus::Executing));
        assert!(!TaskStatus::Planned.can_transition_to(TaskStatus::Planning));
        assert!(!TaskStatus::Executing.can_transition_to(TaskStatus::AwaitingApproval));
    }

    #[test]
    fn new_task_starts_created_with_fresh_id() {
        let a = Task::new("do something", TaskContext::default(), TaskOptions::default());
        let b = Task::new("do something", TaskContext::default(), TaskOptions::default());
        assert_eq!(a.status, TaskStatus::Created);
        assert!(a.id.starts_with("task_"));
        assert_ne!(a.id, b.id);
        assert!(a.plan.is_empty());
        assert!(a.risk_level.is_none());
    }
}
