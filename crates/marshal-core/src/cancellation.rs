use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Process-wide map from task id to its cancellation token. Every
/// suspension point of a task (lock wait, tool call, approval wait,
/// inter-step boundary) observes the same token.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub async fn get(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(task_id).cloned()
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.tokens.write().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_the_created_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("task_a").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("task_a").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_a_no_op() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("task_missing").await);
    }

    #[tokio::test]
    async fn removed_tokens_are_forgotten() {
        let registry = CancellationRegistry::new();
        registry.create("task_a").await;
        registry.remove("task_a").await;
        assert!(registry.get("task_a").await.is_none());
    }
}
