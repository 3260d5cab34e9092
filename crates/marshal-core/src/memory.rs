use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use marshal_types::{Task, TaskStatus};

/// Notified once per terminal task so past outcomes can be recalled later.
/// A failing sink is logged by the orchestrator and never fails the task.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn record_outcome(&self, task: &Task) -> anyhow::Result<()>;
}

pub struct NullMemorySink;

#[async_trait]
impl MemorySink for NullMemorySink {
    async fn record_outcome(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub task_id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub headline: Option<String>,
}

/// In-process sink keeping outcomes for the lifetime of the engine.
#[derive(Clone, Default)]
pub struct RecordingMemorySink {
    records: Arc<Mutex<Vec<MemoryRecord>>>,
}

impl RecordingMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MemorySink for RecordingMemorySink {
    async fn record_outcome(&self, task: &Task) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(MemoryRecord {
                task_id: task.id.clone(),
                instruction: task.instruction.clone(),
                status: task.status,
                headline: task.result.as_ref().map(|r| r.headline.clone()),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_types::{TaskContext, TaskOptions};

    #[tokio::test]
    async fn recording_sink_keeps_terminal_outcomes() {
        let sink = RecordingMemorySink::new();
        let mut task = Task::new("list files", TaskContext::default(), TaskOptions::default());
        task.status = TaskStatus::Completed;

        sink.record_outcome(&task).await.expect("record");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, task.id);
        assert_eq!(records[0].status, TaskStatus::Completed);
    }
}
