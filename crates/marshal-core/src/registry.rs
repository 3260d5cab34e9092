use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use marshal_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use marshal_types::{ApprovalDecision, Task, TaskContext, TaskOptions, TaskStatus};

use crate::error::OrchestratorError;
use crate::events::{Subscription, TaskEventBus};
use crate::orchestrator::{EngineContext, TaskOrchestrator};

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub instruction: String,
    pub context: TaskContext,
    pub options: TaskOptions,
}

impl SubmitRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: TaskContext::default(),
            options: TaskOptions::default(),
        }
    }
}

struct TaskHandle {
    snapshot: watch::Receiver<Task>,
    bus: Arc<TaskEventBus>,
    cancel: CancellationToken,
}

/// Process-wide map from task id to its live handle. Tasks are inserted on
/// submission, retained after they finish for inspection, and evicted only
/// by explicit removal or retention expiry. Ids are never reused.
pub struct TaskRegistry {
    ctx: Arc<EngineContext>,
    tasks: RwLock<HashMap<String, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Create and register a task, then hand it to its orchestrator.
    pub async fn submit(&self, request: SubmitRequest) -> String {
        let task = Task::new(request.instruction, request.context, request.options);
        let task_id = task.id.clone();
        let bus = Arc::new(TaskEventBus::new(&task_id, self.ctx.config.event_capacity));
        let (snapshot_tx, snapshot_rx) = watch::channel(task.clone());
        let cancel = self.ctx.cancellations.create(&task_id).await;

        self.tasks.write().await.insert(
            task_id.clone(),
            TaskHandle {
                snapshot: snapshot_rx,
                bus: bus.clone(),
                cancel: cancel.clone(),
            },
        );

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "task.submitted",
                component: "engine.registry",
                task_id: Some(&task_id),
                step_index: None,
                tool: None,
                status: Some("created"),
                error_code: None,
                detail: Some(&redact_text(&task.instruction)),
            },
        );

        TaskOrchestrator::spawn(task, bus, snapshot_tx, cancel, self.ctx.clone());
        task_id
    }

    pub async fn snapshot(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let snapshot = handle.snapshot.borrow().clone();
        Ok(snapshot)
    }

    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks
            .values()
            .map(|handle| handle.snapshot.borrow().clone())
            .collect();
        all.sort_by(|a, b| a.timestamps.created.cmp(&b.timestamps.created));
        all
    }

    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, OrchestratorError> {
        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        Ok(handle.bus.subscribe())
    }

    /// Deliver the one allowed approval decision. Fails with
    /// `InvalidTransition` when the task is not parked at the gate.
    pub async fn resolve_approval(
        &self,
        task_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), OrchestratorError> {
        let status = self.snapshot(task_id).await?.status;
        if status != TaskStatus::AwaitingApproval {
            return Err(OrchestratorError::invalid_transition(
                task_id,
                format!("cannot resolve approval in state `{}`", status.as_str()),
            ));
        }
        self.ctx.gate.resolve(task_id, decision)
    }

    /// Request cooperative cancellation; it takes effect at the task's next
    /// boundary. Terminal tasks no longer accept the command.
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let tasks = self.tasks.read().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let status = handle.snapshot.borrow().status;
        if status.is_terminal() {
            return Err(OrchestratorError::invalid_transition(
                task_id,
                format!("task already terminal in state `{}`", status.as_str()),
            ));
        }
        handle.cancel.cancel();
        Ok(())
    }

    /// Evict one finished task record (and its event bus).
    pub async fn remove(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        let handle = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let task = handle.snapshot.borrow().clone();
        if !task.status.is_terminal() {
            return Err(OrchestratorError::NotTerminal(task_id.to_string()));
        }
        tasks.remove(task_id);
        self.ctx.cancellations.remove(task_id).await;
        Ok(task)
    }

    /// Evict terminal tasks whose finish time is past the retention window.
    pub async fn cleanup_expired(&self) -> usize {
        let retention = match chrono::Duration::from_std(self.ctx.config.task_retention()) {
            Ok(duration) => duration,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - retention;

        let mut tasks = self.tasks.write().await;
        let expired: Vec<String> = tasks
            .iter()
            .filter(|(_, handle)| {
                let task = handle.snapshot.borrow();
                task.status.is_terminal()
                    && task
                        .timestamps
                        .finished
                        .map(|finished| finished < cutoff)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &expired {
            tasks.remove(task_id);
            self.ctx.cancellations.remove(task_id).await;
        }
        expired.len()
    }
}
