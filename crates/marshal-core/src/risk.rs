use marshal_types::{RiskLevel, Step, ToolKind};

/// Deterministic, total mapping from tool family to hazard band. Anything
/// the engine cannot identify classifies as High.
pub fn classify_tool(kind: ToolKind) -> RiskLevel {
    match kind {
        ToolKind::FsRead | ToolKind::FsList | ToolKind::GitRead => RiskLevel::Low,
        ToolKind::FsWrite | ToolKind::Patch | ToolKind::GitWrite => RiskLevel::Medium,
        ToolKind::Command | ToolKind::Network | ToolKind::Unknown => RiskLevel::High,
        ToolKind::FsDelete => RiskLevel::Critical,
    }
}

/// A plan is as risky as its riskiest step.
pub fn plan_risk(steps: &[Step]) -> RiskLevel {
    steps
        .iter()
        .map(|step| step.risk)
        .max()
        .unwrap_or(RiskLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_types::{StepStatus, ToolAccess, ToolCall};

    fn step(index: usize, kind: ToolKind) -> Step {
        Step {
            index,
            description: format!("step {index}"),
            call: ToolCall::new("x", serde_json::Value::Null),
            kind,
            access: ToolAccess::ReadOnly,
            risk: classify_tool(kind),
            resource_paths: Vec::new(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
        }
    }

    #[test]
    fn every_tool_kind_classifies() {
        let kinds = [
            ToolKind::FsRead,
            ToolKind::FsList,
            ToolKind::FsWrite,
            ToolKind::FsDelete,
            ToolKind::Patch,
            ToolKind::Command,
            ToolKind::GitRead,
            ToolKind::GitWrite,
            ToolKind::Network,
            ToolKind::Unknown,
        ];
        for kind in kinds {
            // total: must not panic, and returns one of the four bands
            let _ = classify_tool(kind);
        }
    }

    #[test]
    fn unknown_tools_fail_safe_to_high() {
        assert_eq!(classify_tool(ToolKind::Unknown), RiskLevel::High);
    }

    #[test]
    fn deletion_is_critical() {
        assert_eq!(classify_tool(ToolKind::FsDelete), RiskLevel::Critical);
    }

    #[test]
    fn plan_risk_is_max_over_steps() {
        let steps = vec![
            step(0, ToolKind::FsRead),
            step(1, ToolKind::FsDelete),
            step(2, ToolKind::FsWrite),
        ];
        assert_eq!(plan_risk(&steps), RiskLevel::Critical);
        assert_eq!(plan_risk(&[]), RiskLevel::Low);
    }
}
