use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::step::{RiskLevel, StepStatus};
use crate::task::{ApprovalDecision, TaskError, TaskStatus};

/// Immutable, append-only record published to a task's event bus.
/// Sequence numbers are strictly increasing per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub seq: u64,
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
    },
    PlanReady {
        steps: usize,
        risk: RiskLevel,
    },
    StepStarted {
        index: usize,
    },
    StepProgress {
        index: usize,
        note: String,
    },
    StepFinished {
        index: usize,
        status: StepStatus,
        attempts: u32,
    },
    ApprovalRequired {
        risk: RiskLevel,
    },
    ApprovalResolved {
        decision: ApprovalDecision,
    },
    TaskFinished {
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
    },
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, TaskEventKind::TaskFinished { .. })
    }
}

/// What a subscriber actually receives: ordered events, or an explicit gap
/// marker when it fell behind (publication never stalls on slow readers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum EventFrame {
    Event {
        #[serde(flatten)]
        event: TaskEvent,
    },
    Gap {
        missed: u64,
    },
}

impl EventFrame {
    pub fn as_event(&self) -> Option<&TaskEvent> {
        match self {
            EventFrame::Event { event } => Some(event),
            EventFrame::Gap { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_flattened_kind() {
        let event = TaskEvent {
            seq: 3,
            task_id: "task_1".to_string(),
            at: Utc::now(),
            kind: TaskEventKind::StepStarted { index: 0 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seq"], 3);
        assert_eq!(value["taskID"], "task_1");
        assert_eq!(value["type"], "step_started");
        assert_eq!(value["index"], 0);
    }

    #[test]
    fn gap_frame_round_trips() {
        let frame = EventFrame::Gap { missed: 7 };
        let json = serde_json::to_string(&frame).unwrap();
        let back: EventFrame = serde_json::from_str(&json).unwrap();
        match back {
            EventFrame::Gap { missed } => assert_eq!(missed, 7),
            _ => panic!("expected gap frame"),
        }
    }
}
