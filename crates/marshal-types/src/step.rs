use serde::{Deserialize, Serialize};

use crate::tool::{ToolAccess, ToolCall, ToolKind, ToolResult};

/// Coarse hazard band driving the approval policy. Ordered so that
/// `Task.risk_level` can be taken as the max over step risks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One planned unit of work, mapped to exactly one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub description: String,
    pub call: ToolCall,
    pub kind: ToolKind,
    pub access: ToolAccess,
    pub risk: RiskLevel,
    #[serde(default)]
    pub resource_paths: Vec<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn is_read_only(&self) -> bool {
        matches!(self.access, ToolAccess::ReadOnly)
    }
}

/// Planner output before the engine freezes it into a `Step`: the engine
/// fills in tool kind, access, risk, and derived resource paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    pub call: ToolCall,
    #[serde(default)]
    pub resource_paths: Vec<String>,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>, call: ToolCall) -> Self {
        Self {
            description: description.into(),
            call,
            resource_paths: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_order_by_severity() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(
            [RiskLevel::Medium, RiskLevel::Critical, RiskLevel::Low]
                .into_iter()
                .max(),
            Some(RiskLevel::Critical)
        );
    }

    #[test]
    fn step_terminal_statuses() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }
}
