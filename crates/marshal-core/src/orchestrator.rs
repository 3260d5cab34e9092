use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use marshal_observability::{emit_event, ObservabilityEvent, ProcessKind};
use marshal_tools::ToolRegistry;
use marshal_types::{
    ApprovalDecision, PlannedStep, Step, StepStatus, Task, TaskError, TaskErrorKind, TaskEventKind,
    TaskStatus, TaskSummary, ToolAccess, ToolKind, ToolResult,
};

use crate::approval::ApprovalGate;
use crate::cancellation::CancellationRegistry;
use crate::config::EngineConfig;
use crate::events::TaskEventBus;
use crate::executor::{StepDisposition, StepExecutor};
use crate::locks::WorkspaceLockManager;
use crate::memory::{MemorySink, NullMemorySink};
use crate::planner::{detect_task_mode, Planner};
use crate::preview::build_plan_preview;
use crate::risk::{classify_tool, plan_risk};

/// Shared collaborators and policy for every task the engine runs.
pub struct EngineContext {
    pub planner: Arc<dyn Planner>,
    pub tools: ToolRegistry,
    pub locks: WorkspaceLockManager,
    pub memory: Arc<dyn MemorySink>,
    pub gate: ApprovalGate,
    pub cancellations: CancellationRegistry,
    pub config: EngineConfig,
    pub workspace: PathBuf,
}

impl EngineContext {
    pub fn new(
        planner: Arc<dyn Planner>,
        tools: ToolRegistry,
        workspace: PathBuf,
        config: EngineConfig,
    ) -> Self {
        Self {
            planner,
            tools,
            locks: WorkspaceLockManager::new(),
            memory: Arc::new(NullMemorySink),
            gate: ApprovalGate::new(),
            cancellations: CancellationRegistry::new(),
            config,
            workspace,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = memory;
        self
    }

    fn step_executor(&self) -> StepExecutor {
        StepExecutor::new(
            self.tools.clone(),
            self.locks.clone(),
            self.workspace.clone(),
            self.config.retry.clone(),
            self.config.lock_wait_timeout(),
            self.config.tool_timeout(),
        )
    }
}

/// The single logical owner of one task record. Drives planning, the
/// approval gate, and step execution; consumes approval/cancel signals only
/// at the defined boundaries, never mid-step.
pub(crate) struct TaskOrchestrator {
    task: Task,
    bus: Arc<TaskEventBus>,
    snapshot: watch::Sender<Task>,
    cancel: CancellationToken,
    ctx: Arc<EngineContext>,
    executor: StepExecutor,
}

impl TaskOrchestrator {
    pub(crate) fn spawn(
        task: Task,
        bus: Arc<TaskEventBus>,
        snapshot: watch::Sender<Task>,
        cancel: CancellationToken,
        ctx: Arc<EngineContext>,
    ) -> tokio::task::JoinHandle<()> {
        let executor = ctx.step_executor();
        let worker = Self {
            task,
            bus,
            snapshot,
            cancel,
            ctx,
            executor,
        };
        tokio::spawn(worker.run())
    }

    async fn run(mut self) {
        if self.cancel.is_cancelled() {
            self.finish_cancelled(None).await;
            return;
        }

        self.task.timestamps.planning_started = Some(Utc::now());
        self.transition(TaskStatus::Planning);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.planning.start",
                component: "engine.orchestrator",
                task_id: Some(&self.task.id),
                step_index: None,
                tool: None,
                status: Some("planning"),
                error_code: None,
                detail: None,
            },
        );

        let planned = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self
                .ctx
                .planner
                .plan(&self.task.instruction, &self.task.context) => Some(result),
        };

        let planned = match planned {
            None => {
                self.finish_cancelled(None).await;
                return;
            }
            Some(Ok(steps)) if steps.is_empty() => {
                self.fail(TaskError::new(
                    TaskErrorKind::PlanningFailed,
                    "planner produced an empty plan",
                ))
                .await;
                return;
            }
            Some(Ok(steps)) => steps,
            Some(Err(err)) => {
                self.fail(TaskError::new(TaskErrorKind::PlanningFailed, err.to_string()))
                    .await;
                return;
            }
        };

        self.freeze_plan(planned).await;
        let risk = self.task.risk_level.unwrap_or_default();
        self.transition(TaskStatus::Planned);
        self.bus.publish(TaskEventKind::PlanReady {
            steps: self.task.plan.len(),
            risk,
        });

        if self.task.options.generate_preview || self.task.options.dry_run {
            self.task.preview = Some(build_plan_preview(
                &self.task.instruction,
                detect_task_mode(&self.task.instruction, &self.task.context),
                &self.task.plan,
            ));
            self.push_snapshot();
        }

        if self.task.options.dry_run {
            self.run_dry().await;
            return;
        }

        if self
            .ctx
            .config
            .approval
            .requires_approval(risk, self.task.options.auto_approve)
        {
            let rx = self.ctx.gate.request(&self.task.id);
            self.transition(TaskStatus::AwaitingApproval);
            self.bus.publish(TaskEventKind::ApprovalRequired { risk });

            let decision = self.ctx.gate.wait(&self.task.id, rx, &self.cancel).await;
            match decision {
                None => {
                    self.finish_cancelled(None).await;
                    return;
                }
                Some(decision) => {
                    self.task.approval = Some(decision);
                    self.bus
                        .publish(TaskEventKind::ApprovalResolved { decision });
                    self.push_snapshot();
                    if decision == ApprovalDecision::Rejected {
                        self.fail(TaskError::new(
                            TaskErrorKind::Rejected,
                            "approval rejected",
                        ))
                        .await;
                        return;
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.finish_cancelled(None).await;
            return;
        }

        self.task.timestamps.execution_started = Some(Utc::now());
        self.transition(TaskStatus::Executing);
        self.execute_steps().await;
    }

    /// Resolve each planned step against the tool catalog and freeze the
    /// plan: kinds, access, per-step risk, and the overall risk level are
    /// all fixed before any approval decision is requested.
    async fn freeze_plan(&mut self, planned: Vec<PlannedStep>) {
        let mut steps = Vec::with_capacity(planned.len());
        for (index, item) in planned.into_iter().enumerate() {
            let (kind, access) = match self.ctx.tools.spec_for(&item.call.tool).await {
                Some(spec) => (spec.kind, spec.access),
                None => (ToolKind::Unknown, ToolAccess::Mutating),
            };
            let resource_paths = if item.resource_paths.is_empty() {
                self.ctx
                    .tools
                    .resource_paths_for(&item.call.tool, &item.call.args)
                    .await
            } else {
                item.resource_paths
            };
            steps.push(Step {
                index,
                description: item.description,
                call: item.call,
                kind,
                access,
                risk: classify_tool(kind),
                resource_paths,
                status: StepStatus::Pending,
                attempts: 0,
                output: None,
                error: None,
            });
        }
        self.task.risk_level = Some(plan_risk(&steps));
        self.task.plan = steps;
        self.task.timestamps.planning_finished = Some(Utc::now());
    }

    async fn execute_steps(&mut self) {
        for index in 0..self.task.plan.len() {
            if self.cancel.is_cancelled() {
                self.finish_cancelled(None).await;
                return;
            }

            self.start_step(index);
            let step = self.task.plan[index].clone();
            let run = self
                .executor
                .run_step(&step, false, &self.cancel, Some(self.bus.as_ref()))
                .await;
            self.task.plan[index].attempts = run.attempts;

            match run.disposition {
                StepDisposition::Succeeded(output) => {
                    self.finish_step(index, StepStatus::Succeeded, Some(output), None);
                }
                StepDisposition::Skipped { reason } => {
                    self.finish_step(
                        index,
                        StepStatus::Skipped,
                        Some(ToolResult::text(reason)),
                        None,
                    );
                }
                StepDisposition::Failed { reason } => {
                    self.finish_step(index, StepStatus::Failed, None, Some(reason.clone()));
                    self.fail(TaskError::at_step(TaskErrorKind::StepFailed, index, reason))
                        .await;
                    return;
                }
                StepDisposition::LockTimeout { reason } => {
                    self.finish_step(index, StepStatus::Failed, None, Some(reason.clone()));
                    self.fail(TaskError::at_step(TaskErrorKind::LockTimeout, index, reason))
                        .await;
                    return;
                }
                StepDisposition::Interrupted => {
                    self.finish_step(
                        index,
                        StepStatus::Failed,
                        None,
                        Some("cancelled".to_string()),
                    );
                    self.finish_cancelled(Some(index)).await;
                    return;
                }
            }
        }

        let artifacts = self.mutated_paths();
        self.task.result = Some(TaskSummary {
            headline: format!("completed {} step(s)", self.task.plan.len()),
            artifacts,
            dry_run: false,
        });
        self.finish(TaskStatus::Completed, None).await;
    }

    /// Dry-run path: each step yields a synthetic "would execute" record,
    /// no tool runs, no lock is taken, and the task completes from
    /// `Planned` without consulting the approval gate.
    async fn run_dry(&mut self) {
        for index in 0..self.task.plan.len() {
            if self.cancel.is_cancelled() {
                self.finish_cancelled(None).await;
                return;
            }
            self.start_step(index);
            let step = self.task.plan[index].clone();
            let run = self
                .executor
                .run_step(&step, true, &self.cancel, Some(self.bus.as_ref()))
                .await;
            self.task.plan[index].attempts = run.attempts;
            match run.disposition {
                StepDisposition::Succeeded(output) => {
                    self.finish_step(index, StepStatus::Succeeded, Some(output), None);
                }
                StepDisposition::Skipped { reason } => {
                    self.finish_step(
                        index,
                        StepStatus::Skipped,
                        Some(ToolResult::text(reason)),
                        None,
                    );
                }
                _ => {
                    self.finish_step(
                        index,
                        StepStatus::Failed,
                        None,
                        Some("cancelled".to_string()),
                    );
                    self.finish_cancelled(Some(index)).await;
                    return;
                }
            }
        }

        self.task.result = Some(TaskSummary {
            headline: format!(
                "dry run: previewed {} step(s), no side effects applied",
                self.task.plan.len()
            ),
            artifacts: Vec::new(),
            dry_run: true,
        });
        self.finish(TaskStatus::Completed, None).await;
    }

    fn start_step(&mut self, index: usize) {
        self.task.plan[index].status = StepStatus::Running;
        self.bus.publish(TaskEventKind::StepStarted { index });
        self.push_snapshot();
    }

    fn finish_step(
        &mut self,
        index: usize,
        status: StepStatus,
        output: Option<ToolResult>,
        error: Option<String>,
    ) {
        let attempts = {
            let step = &mut self.task.plan[index];
            step.status = status;
            step.output = output;
            step.error = error.clone();
            step.attempts
        };
        self.bus.publish(TaskEventKind::StepFinished {
            index,
            status,
            attempts,
        });
        self.push_snapshot();
        if let Some(error) = error {
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "task.step.failed",
                    component: "engine.orchestrator",
                    task_id: Some(&self.task.id),
                    step_index: Some(index),
                    tool: Some(&self.task.plan[index].call.tool),
                    status: Some("failed"),
                    error_code: None,
                    detail: Some(&error),
                },
            );
        }
    }

    fn mutated_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for step in &self.task.plan {
            if step.access != ToolAccess::Mutating || step.status != StepStatus::Succeeded {
                continue;
            }
            for path in &step.resource_paths {
                if !paths.contains(path) {
                    paths.push(path.clone());
                }
            }
        }
        paths
    }

    fn transition(&mut self, to: TaskStatus) {
        let from = self.task.status;
        if !from.can_transition_to(to) {
            tracing::error!(
                task_id = %self.task.id,
                from = from.as_str(),
                to = to.as_str(),
                "illegal status transition suppressed"
            );
            return;
        }
        self.task.status = to;
        self.bus
            .publish(TaskEventKind::StatusChanged { from, to });
        self.push_snapshot();
    }

    async fn fail(&mut self, error: TaskError) {
        self.finish(TaskStatus::Failed, Some(error)).await;
    }

    async fn finish_cancelled(&mut self, step_index: Option<usize>) {
        let mut error = TaskError::new(TaskErrorKind::Cancelled, "task cancelled");
        error.step_index = step_index;
        self.finish(TaskStatus::Cancelled, Some(error)).await;
    }

    async fn finish(&mut self, status: TaskStatus, error: Option<TaskError>) {
        self.task.timestamps.finished = Some(Utc::now());
        self.task.error = error.clone();
        self.transition(status);
        self.bus
            .publish(TaskEventKind::TaskFinished { status, error });

        if let Err(err) = self.ctx.memory.record_outcome(&self.task).await {
            tracing::warn!(
                task_id = %self.task.id,
                error = %err,
                "memory sink rejected task outcome"
            );
        }
        self.ctx.cancellations.remove(&self.task.id).await;

        emit_event(
            if status == TaskStatus::Failed {
                Level::WARN
            } else {
                Level::INFO
            },
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.finished",
                component: "engine.orchestrator",
                task_id: Some(&self.task.id),
                step_index: self.task.error.as_ref().and_then(|e| e.step_index),
                tool: None,
                status: Some(status.as_str()),
                error_code: None,
                detail: self.task.error.as_ref().map(|e| e.message.as_str()),
            },
        );
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot.send(self.task.clone());
    }
}
