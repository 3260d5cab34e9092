/// Errors surfaced to callers of the registry/orchestration API. Terminal
/// task failures are carried on the task record itself (`TaskError`); these
/// cover commands that cannot be accepted at all.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("invalid transition for task `{task_id}`: {detail}")]
    InvalidTransition { task_id: String, detail: String },
    #[error("task `{0}` has not reached a terminal state")]
    NotTerminal(String),
}

impl OrchestratorError {
    pub fn invalid_transition(task_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("planner backend failed: {0}")]
    Backend(String),
    #[error("planner produced an empty plan")]
    EmptyPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for workspace lock")]
    Timeout,
    #[error("lock wait aborted by cancellation")]
    Cancelled,
}
