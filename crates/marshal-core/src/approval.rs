use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use marshal_types::ApprovalDecision;

use crate::error::OrchestratorError;

struct PendingApproval {
    tx: watch::Sender<Option<ApprovalDecision>>,
    resolved: bool,
}

/// Parks a task until exactly one approve/reject decision arrives. The gate
/// imposes no timeout; a supervisor that gives up cancels the task instead.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-use waiter for the task. Called by the task's
    /// orchestrator right before it enters the awaiting-approval state.
    pub fn request(&self, task_id: &str) -> watch::Receiver<Option<ApprovalDecision>> {
        let (tx, rx) = watch::channel(None);
        self.lock_pending().insert(
            task_id.to_string(),
            PendingApproval {
                tx,
                resolved: false,
            },
        );
        rx
    }

    /// Deliver a decision. The first resolution wins; anything after that,
    /// or a resolution for a task that is not parked, is a typed error.
    pub fn resolve(
        &self,
        task_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), OrchestratorError> {
        let mut pending = self.lock_pending();
        match pending.get_mut(task_id) {
            None => Err(OrchestratorError::invalid_transition(
                task_id,
                "no approval is pending",
            )),
            Some(entry) if entry.resolved => Err(OrchestratorError::invalid_transition(
                task_id,
                "approval already resolved",
            )),
            Some(entry) => {
                entry.resolved = true;
                let _ = entry.tx.send(Some(decision));
                Ok(())
            }
        }
    }

    /// Wait for the decision, or for cancellation, whichever comes first.
    /// The waiter is deregistered either way, so a late `resolve` fails.
    pub async fn wait(
        &self,
        task_id: &str,
        mut rx: watch::Receiver<Option<ApprovalDecision>>,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let decision = loop {
            let current = *rx.borrow();
            if let Some(decision) = current {
                break Some(decision);
            }
            tokio::select! {
                _ = cancel.cancelled() => break None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
            }
        };
        self.clear(task_id);
        decision
    }

    pub fn clear(&self, task_id: &str) {
        self.lock_pending().remove(task_id);
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.lock_pending().contains_key(task_id)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_the_delivered_decision() {
        let gate = ApprovalGate::new();
        let rx = gate.request("task_a");

        let resolver = gate.clone();
        tokio::spawn(async move {
            resolver
                .resolve("task_a", ApprovalDecision::Approved)
                .expect("resolve");
        });

        let cancel = CancellationToken::new();
        let decision = gate.wait("task_a", rx, &cancel).await;
        assert_eq!(decision, Some(ApprovalDecision::Approved));
        assert!(!gate.is_pending("task_a"));
    }

    #[test]
    fn resolve_without_pending_request_is_invalid() {
        let gate = ApprovalGate::new();
        let err = gate
            .resolve("task_a", ApprovalDecision::Approved)
            .expect_err("nothing pending");
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[test]
    fn second_resolution_is_rejected_not_overwritten() {
        let gate = ApprovalGate::new();
        let _rx = gate.request("task_a");
        gate.resolve("task_a", ApprovalDecision::Rejected)
            .expect("first resolution");
        let err = gate
            .resolve("task_a", ApprovalDecision::Approved)
            .expect_err("second resolution");
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait_and_clears_the_waiter() {
        let gate = ApprovalGate::new();
        let rx = gate.request("task_a");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let decision = gate.wait("task_a", rx, &cancel).await;
        assert_eq!(decision, None);
        assert!(gate
            .resolve("task_a", ApprovalDecision::Approved)
            .is_err());
    }
}
