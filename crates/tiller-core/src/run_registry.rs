use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Handle for one active run. `finish` only clears the registry slot
/// if the slot still belongs to this run.
#[derive(Clone)]
pub struct RunSlot {
    pub token: CancellationToken,
    id: u64,
}

/// Enforces the one-active-loop-per-workspace rule. Beginning a run
/// for a workspace cancels and supersedes whatever run held the slot,
/// so tool calls never interleave against the same execution context.
#[derive(Clone, Default)]
pub struct RunRegistry {
    active: Arc<RwLock<HashMap<String, RunSlot>>>,
    next_id: Arc<AtomicU64>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, workspace_id: &str) -> RunSlot {
        let slot = RunSlot {
            token: CancellationToken::new(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let mut active = self.active.write().await;
        if let Some(previous) = active.insert(workspace_id.to_string(), slot.clone()) {
            previous.token.cancel();
        }
        slot
    }

    pub async fn cancel(&self, workspace_id: &str) -> bool {
        let active = self.active.read().await;
        match active.get(workspace_id) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn finish(&self, workspace_id: &str, slot: &RunSlot) {
        let mut active = self.active.write().await;
        if active.get(workspace_id).is_some_and(|held| held.id == slot.id) {
            active.remove(workspace_id);
        }
    }

    pub async fn is_active(&self, workspace_id: &str) -> bool {
        self.active.read().await.contains_key(workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn beginning_a_second_run_cancels_the_first() {
        let registry = RunRegistry::new();
        let first = registry.begin("ws-1").await;
        assert!(!first.token.is_cancelled());

        let second = registry.begin("ws-1").await;
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(registry.is_active("ws-1").await);
    }

    #[tokio::test]
    async fn finish_only_clears_the_owning_run() {
        let registry = RunRegistry::new();
        let first = registry.begin("ws-1").await;
        let second = registry.begin("ws-1").await;

        registry.finish("ws-1", &first).await;
        assert!(registry.is_active("ws-1").await);
        registry.finish("ws-1", &second).await;
        assert!(!registry.is_active("ws-1").await);
    }

    #[tokio::test]
    async fn workspaces_are_independent() {
        let registry = RunRegistry::new();
        let a = registry.begin("ws-a").await;
        let _b = registry.begin("ws-b").await;
        assert!(!a.token.is_cancelled());
        assert!(registry.cancel("ws-a").await);
        assert!(a.token.is_cancelled());
        assert!(!registry.cancel("ws-missing").await);
    }
}
