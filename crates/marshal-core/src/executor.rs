use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use marshal_tools::{ToolError, ToolRegistry};
use marshal_types::{Step, TaskEventKind, ToolResult};

use crate::config::RetryPolicy;
use crate::error::LockError;
use crate::events::TaskEventBus;
use crate::locks::{LockMode, WorkspaceLockManager};

#[derive(Debug)]
pub enum StepDisposition {
    Succeeded(ToolResult),
    Skipped { reason: String },
    Failed { reason: String },
    LockTimeout { reason: String },
    Interrupted,
}

#[derive(Debug)]
pub struct StepRun {
    pub disposition: StepDisposition,
    pub attempts: u32,
}

/// Runs one step at a time: acquires the step's workspace locks, invokes
/// the tool under a timeout, and retries transient failures with capped
/// exponential backoff. Locks are released as soon as the step concludes.
pub struct StepExecutor {
    tools: ToolRegistry,
    locks: WorkspaceLockManager,
    workspace: PathBuf,
    retry: RetryPolicy,
    lock_wait_timeout: Duration,
    tool_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        tools: ToolRegistry,
        locks: WorkspaceLockManager,
        workspace: PathBuf,
        retry: RetryPolicy,
        lock_wait_timeout: Duration,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            tools,
            locks,
            workspace,
            retry,
            lock_wait_timeout,
            tool_timeout,
        }
    }

    pub async fn run_step(
        &self,
        step: &Step,
        dry_run: bool,
        cancel: &CancellationToken,
        bus: Option<&TaskEventBus>,
    ) -> StepRun {
        if let Some(reason) = self.satisfied_precondition(step).await {
            return StepRun {
                disposition: StepDisposition::Skipped { reason },
                attempts: 0,
            };
        }

        if dry_run {
            return StepRun {
                disposition: StepDisposition::Succeeded(synthetic_result(step)),
                attempts: 0,
            };
        }

        let mode = if step.is_read_only() {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let guard = match self
            .locks
            .acquire(&step.resource_paths, mode, cancel, self.lock_wait_timeout)
            .await
        {
            Ok(guard) => guard,
            Err(LockError::Cancelled) => {
                return StepRun {
                    disposition: StepDisposition::Interrupted,
                    attempts: 0,
                }
            }
            Err(LockError::Timeout) => {
                return StepRun {
                    disposition: StepDisposition::LockTimeout {
                        reason: format!(
                            "could not lock {:?} within {}ms",
                            step.resource_paths,
                            self.lock_wait_timeout.as_millis()
                        ),
                    },
                    attempts: 0,
                }
            }
        };

        let mut attempts = 0u32;
        let disposition = loop {
            attempts += 1;
            let invocation = self.tools.execute(
                &step.call.tool,
                &self.workspace,
                step.call.args.clone(),
                cancel.child_token(),
            );
            let result = match tokio::time::timeout(self.tool_timeout, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::transient(format!(
                    "tool `{}` timed out after {}ms",
                    step.call.tool,
                    self.tool_timeout.as_millis()
                ))),
            };

            match result {
                Ok(output) => break StepDisposition::Succeeded(output),
                Err(_) if cancel.is_cancelled() => break StepDisposition::Interrupted,
                Err(ToolError::Fatal { reason }) => break StepDisposition::Failed { reason },
                Err(ToolError::Transient { reason }) => {
                    if attempts >= self.retry.max_attempts {
                        break StepDisposition::Failed {
                            reason: format!("retries exhausted after {attempts} attempts: {reason}"),
                        };
                    }
                    let delay = self.retry.backoff_delay(attempts);
                    tracing::debug!(
                        tool = %step.call.tool,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "retrying transient step failure"
                    );
                    if let Some(bus) = bus {
                        bus.publish(TaskEventKind::StepProgress {
                            index: step.index,
                            note: format!("attempt {attempts} hit a transient error; retrying"),
                        });
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break StepDisposition::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        drop(guard);

        StepRun {
            disposition,
            attempts,
        }
    }

    /// Skip policy: a step may declare its own precondition as already
    /// satisfied via `skip_if_path_exists`.
    async fn satisfied_precondition(&self, step: &Step) -> Option<String> {
        let path = step
            .call
            .args
            .get("skip_if_path_exists")
            .and_then(|v| v.as_str())?;
        let resolved = marshal_tools::resolve_workspace_path(&self.workspace, path).ok()?;
        tokio::fs::metadata(&resolved)
            .await
            .is_ok()
            .then(|| format!("precondition already satisfied: `{path}` exists"))
    }
}

/// Dry-run short circuit: no lock, no tool call, just a description of the
/// effect built from the call metadata.
pub fn synthetic_result(step: &Step) -> ToolResult {
    let path = step.call.args.get("path").and_then(|v| v.as_str());
    let output = match (step.call.tool.as_str(), path) {
        ("read_file", Some(path)) => format!("would read `{path}`"),
        ("list_dir", Some(path)) => format!("would list `{path}`"),
        ("write_file", Some(path)) => format!("would write `{path}`"),
        ("delete_path", Some(path)) => format!("would delete `{path}`"),
        ("apply_patch", Some(path)) => format!("would patch `{path}`"),
        ("run_command", _) => {
            let command = step
                .call
                .args
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or("<unspecified>");
            format!("would run `{command}`")
        }
        (tool, _) => format!("would execute `{tool}`"),
    };
    ToolResult {
        output,
        metadata: json!({"dry_run": true, "tool": step.call.tool}),
    }
}
