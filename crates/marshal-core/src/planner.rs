use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use marshal_types::{PlannedStep, TaskContext, ToolCall};

use crate::error::PlanningError;

/// The planning collaborator: instruction + context in, ordered steps out.
/// The orchestrator treats it as a black box and never inspects how the
/// steps were produced.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        instruction: &str,
        context: &TaskContext,
    ) -> Result<Vec<PlannedStep>, PlanningError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Edit,
    Explain,
    Refactor,
    Test,
    Create,
    Debug,
    Optimize,
    Document,
}

impl TaskMode {
    pub fn title(self) -> &'static str {
        match self {
            TaskMode::Edit => "Edit",
            TaskMode::Explain => "Explain",
            TaskMode::Refactor => "Refactor",
            TaskMode::Test => "Test",
            TaskMode::Create => "Create",
            TaskMode::Debug => "Debug",
            TaskMode::Optimize => "Optimize",
            TaskMode::Document => "Document",
        }
    }
}

const MODE_KEYWORDS: &[(TaskMode, &[&str])] = &[
    (
        TaskMode::Edit,
        &["edit", "modify", "change", "update", "fix", "correct"],
    ),
    (
        TaskMode::Explain,
        &["explain", "describe", "what does", "how does", "analyze"],
    ),
    (
        TaskMode::Refactor,
        &["refactor", "restructure", "reorganize", "clean up"],
    ),
    (TaskMode::Test, &["test", "verify", "validate"]),
    (
        TaskMode::Create,
        &["create", "make", "build", "generate", "new", "add"],
    ),
    (TaskMode::Debug, &["debug", "troubleshoot", "diagnose"]),
    (
        TaskMode::Optimize,
        &["optimize", "speed up", "performance"],
    ),
    (
        TaskMode::Document,
        &["document", "comment", "docstring", "readme"],
    ),
];

pub fn detect_task_mode(instruction: &str, context: &TaskContext) -> TaskMode {
    let lowered = instruction.to_lowercase();
    for (mode, keywords) in MODE_KEYWORDS {
        if keywords.iter().any(|keyword| lowered.contains(keyword)) {
            return *mode;
        }
    }
    if !context.target_files.is_empty() {
        return TaskMode::Edit;
    }
    TaskMode::Create
}

/// Deterministic planner used when no model-backed planner is wired in. It
/// produces conservative plans: inspection steps for most modes, a single
/// write or delete where the instruction names an obvious target.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPlanner;

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(
        &self,
        instruction: &str,
        context: &TaskContext,
    ) -> Result<Vec<PlannedStep>, PlanningError> {
        if let Some(target) = deletion_target(instruction) {
            let mut step = PlannedStep::new(
                format!("Delete `{target}` from the workspace"),
                ToolCall::new("delete_path", json!({ "path": target })),
            );
            step.resource_paths = vec![target];
            return Ok(vec![step]);
        }

        let mode = detect_task_mode(instruction, context);
        let plan = match mode {
            TaskMode::Create => match created_file_target(instruction) {
                Some(target) => {
                    let mut step = PlannedStep::new(
                        format!("Create `{target}`"),
                        ToolCall::new("write_file", json!({ "path": target, "content": "" })),
                    );
                    step.resource_paths = vec![target];
                    vec![step]
                }
                None => fallback_plan(instruction),
            },
            TaskMode::Explain
            | TaskMode::Document
            | TaskMode::Edit
            | TaskMode::Refactor
            | TaskMode::Optimize => {
                if context.target_files.is_empty() {
                    fallback_plan(instruction)
                } else {
                    context
                        .target_files
                        .iter()
                        .map(|path| {
                            let mut step = PlannedStep::new(
                                format!("Read `{path}`"),
                                ToolCall::new("read_file", json!({ "path": path })),
                            );
                            step.resource_paths = vec![path.clone()];
                            step
                        })
                        .collect()
                }
            }
            TaskMode::Debug => vec![
                PlannedStep::new(
                    "Inspect pending workspace changes",
                    ToolCall::new("git_status", json!({})),
                ),
                PlannedStep::new(
                    "Review the unstaged diff",
                    ToolCall::new("git_diff", json!({})),
                ),
            ],
            TaskMode::Test => {
                let command = context
                    .hints
                    .as_ref()
                    .and_then(|hints| hints.get("test_command"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("make test")
                    .to_string();
                vec![PlannedStep::new(
                    format!("Run the test suite via `{command}`"),
                    ToolCall::new("run_command", json!({ "command": command })),
                )]
            }
        };
        Ok(plan)
    }
}

/// Fallback when the instruction gives the planner nothing concrete to do.
fn fallback_plan(instruction: &str) -> Vec<PlannedStep> {
    vec![PlannedStep::new(
        format!("Survey the workspace for: {instruction}"),
        ToolCall::new("list_dir", json!({ "path": "." })),
    )]
}

fn deletion_target(instruction: &str) -> Option<String> {
    let lowered = instruction.to_lowercase();
    // Slice the original text so the target keeps its casing; fall back to
    // the lowered copy when case mapping shifted byte offsets.
    let source = if lowered.len() == instruction.len() {
        instruction
    } else {
        lowered.as_str()
    };
    let keyword_at = ["delete ", "remove "]
        .iter()
        .filter_map(|keyword| lowered.find(keyword).map(|at| at + keyword.len()))
        .min()?;
    source[keyword_at..]
        .split_whitespace()
        .map(clean_token)
        .find(|token| {
            !token.is_empty()
                && !["the", "a", "an", "file", "directory", "folder"]
                    .iter()
                    .any(|noise| token.eq_ignore_ascii_case(noise))
        })
}

fn created_file_target(instruction: &str) -> Option<String> {
    instruction
        .split_whitespace()
        .map(clean_token)
        .find(|token| {
            token.contains('.') && !token.starts_with('.') && !token.ends_with('.')
                || token.contains('/')
        })
}

fn clean_token(token: &str) -> String {
    token
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | ',' | ';' | ':' | '(' | ')'))
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_instruction_plans_a_single_write() {
        let plan = HeuristicPlanner
            .plan("create hello.py", &TaskContext::default())
            .await
            .expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].call.tool, "write_file");
        assert_eq!(plan[0].call.args["path"], "hello.py");
        assert_eq!(plan[0].resource_paths, vec!["hello.py".to_string()]);
    }

    #[tokio::test]
    async fn delete_instruction_plans_a_delete_step() {
        let plan = HeuristicPlanner
            .plan("delete the build directory", &TaskContext::default())
            .await
            .expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].call.tool, "delete_path");
        assert_eq!(plan[0].call.args["path"], "build");
    }

    #[tokio::test]
    async fn explain_with_targets_reads_each_file() {
        let context = TaskContext {
            target_files: vec!["src/lib.rs".to_string(), "src/main.rs".to_string()],
            ..Default::default()
        };
        let plan = HeuristicPlanner
            .plan("explain how the parser works", &context)
            .await
            .expect("plan");
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|step| step.call.tool == "read_file"));
    }

    #[tokio::test]
    async fn vague_instruction_falls_back_to_a_survey() {
        let plan = HeuristicPlanner
            .plan("tidy things please", &TaskContext::default())
            .await
            .expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].call.tool, "list_dir");
    }

    #[test]
    fn mode_detection_prefers_earlier_keyword_bands() {
        let ctx = TaskContext::default();
        assert_eq!(detect_task_mode("fix the login bug", &ctx), TaskMode::Edit);
        assert_eq!(
            detect_task_mode("explain this module", &ctx),
            TaskMode::Explain
        );
        assert_eq!(detect_task_mode("create hello.py", &ctx), TaskMode::Create);
        assert_eq!(
            detect_task_mode("troubleshoot the crash", &ctx),
            TaskMode::Debug
        );
    }

    #[test]
    fn mode_detection_uses_context_targets_when_keywords_miss() {
        let context = TaskContext {
            target_files: vec!["src/lib.rs".to_string()],
            ..Default::default()
        };
        assert_eq!(detect_task_mode("something vague", &context), TaskMode::Edit);
        assert_eq!(
            detect_task_mode("something vague", &TaskContext::default()),
            TaskMode::Create
        );
    }
}
