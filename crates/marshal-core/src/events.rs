use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use futures::Stream;
use tokio::sync::broadcast;

use marshal_types::{EventFrame, TaskEvent, TaskEventKind};

/// Per-task fan-out channel. Publication never blocks: a subscriber that
/// falls behind loses old events and sees an explicit gap marker instead.
pub struct TaskEventBus {
    task_id: String,
    tx: broadcast::Sender<TaskEvent>,
    seq: AtomicU64,
    sealed: RwLock<Option<TaskEvent>>,
}

impl TaskEventBus {
    pub fn new(task_id: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            task_id: task_id.into(),
            tx,
            seq: AtomicU64::new(0),
            sealed: RwLock::new(None),
        }
    }

    pub fn publish(&self, kind: TaskEventKind) -> TaskEvent {
        let event = TaskEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            task_id: self.task_id.clone(),
            at: Utc::now(),
            kind,
        };
        if event.is_terminal() {
            *self
                .sealed
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(event.clone());
        }
        let _ = self.tx.send(event.clone());
        event
    }

    /// Live subscribers receive everything from now on, in order. After the
    /// terminal event the bus is sealed: late subscribers get one replayed
    /// final frame and then end-of-stream.
    pub fn subscribe(&self) -> Subscription {
        let sealed = self
            .sealed
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sealed {
            Some(final_event) => Subscription {
                rx: None,
                replay: Some(final_event),
                done: false,
            },
            None => Subscription {
                rx: Some(self.tx.subscribe()),
                replay: None,
                done: false,
            },
        }
    }

    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

pub struct Subscription {
    rx: Option<broadcast::Receiver<TaskEvent>>,
    replay: Option<TaskEvent>,
    done: bool,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<EventFrame> {
        if self.done {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.done = true;
            return Some(EventFrame::Event { event });
        }
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(event) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(EventFrame::Event { event })
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(EventFrame::Gap { missed }),
            Err(broadcast::error::RecvError::Closed) => {
                self.done = true;
                None
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = EventFrame> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|frame| (frame, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_types::{TaskStatus, TaskEventKind};

    #[tokio::test]
    async fn subscribers_see_events_in_sequence_order() {
        let bus = TaskEventBus::new("task_a", 64);
        let mut sub = bus.subscribe();

        bus.publish(TaskEventKind::StepStarted { index: 0 });
        bus.publish(TaskEventKind::StepProgress {
            index: 0,
            note: "halfway".to_string(),
        });
        bus.publish(TaskEventKind::StepFinished {
            index: 0,
            status: marshal_types::StepStatus::Succeeded,
            attempts: 1,
        });

        let mut last_seq = 0;
        for _ in 0..3 {
            let frame = sub.next().await.expect("frame");
            let event = frame.as_event().expect("event frame");
            assert!(event.seq > last_seq);
            last_seq = event.seq;
        }
        assert_eq!(last_seq, 3);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap_marker_not_stall() {
        let bus = TaskEventBus::new("task_a", 16);
        let mut sub = bus.subscribe();

        for i in 0..64 {
            bus.publish(TaskEventKind::StepProgress {
                index: 0,
                note: format!("tick {i}"),
            });
        }

        let first = sub.next().await.expect("frame");
        match first {
            EventFrame::Gap { missed } => assert!(missed > 0),
            EventFrame::Event { .. } => panic!("expected a gap after overflow"),
        }
        // stream resumes with ordered events after the gap
        let next = sub.next().await.expect("frame");
        assert!(next.as_event().is_some());
    }

    #[tokio::test]
    async fn terminal_event_closes_live_subscriptions() {
        let bus = TaskEventBus::new("task_a", 16);
        let mut sub = bus.subscribe();
        bus.publish(TaskEventKind::TaskFinished {
            status: TaskStatus::Completed,
            error: None,
        });
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_gets_final_frame_then_closes() {
        let bus = TaskEventBus::new("task_a", 16);
        bus.publish(TaskEventKind::StepStarted { index: 0 });
        bus.publish(TaskEventKind::TaskFinished {
            status: TaskStatus::Failed,
            error: None,
        });

        let mut sub = bus.subscribe();
        let frame = sub.next().await.expect("replayed frame");
        let event = frame.as_event().expect("event");
        assert!(event.is_terminal());
        assert!(sub.next().await.is_none());
    }
}
