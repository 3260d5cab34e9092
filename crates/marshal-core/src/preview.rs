use marshal_types::{PlanPreview, Step, ToolAccess, ToolKind};

use crate::planner::TaskMode;
use crate::risk::plan_risk;

const TITLE_LIMIT: usize = 60;

/// Build the deterministic preview of a frozen plan: what it would touch,
/// what it would run, and one line per step.
pub fn build_plan_preview(instruction: &str, mode: TaskMode, steps: &[Step]) -> PlanPreview {
    let files_affected = affected_files(steps);
    let commands = planned_commands(steps);
    let risk = plan_risk(steps);

    let summary = format!(
        "{} planned step(s); {} file(s) affected; overall risk {}",
        steps.len(),
        files_affected.len(),
        risk.as_str()
    );

    PlanPreview {
        title: format!("{}: {}", mode.title(), truncate(instruction, TITLE_LIMIT)),
        summary,
        files_affected,
        commands,
        step_summaries: steps
            .iter()
            .map(|step| {
                format!(
                    "{}. {} [{}]",
                    step.index + 1,
                    step.description,
                    step.call.tool
                )
            })
            .collect(),
        risk,
    }
}

fn affected_files(steps: &[Step]) -> Vec<String> {
    let mut files = Vec::new();
    for step in steps {
        if step.access != ToolAccess::Mutating {
            continue;
        }
        for path in &step.resource_paths {
            if !files.contains(path) {
                files.push(path.clone());
            }
        }
    }
    files
}

fn planned_commands(steps: &[Step]) -> Vec<String> {
    steps
        .iter()
        .filter(|step| step.kind == ToolKind::Command)
        .filter_map(|step| {
            step.call
                .args
                .get("command")
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
        })
        .collect()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}...")
}
