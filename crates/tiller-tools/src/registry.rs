use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use tiller_types::{ToolCall, ToolCallEntry, ToolCallStatus, ToolResult};

/// Tracks the lifecycle of every tool invocation in one run. Entries
/// move forward only (pending → running → complete/error); a
/// regressive transition is dropped with a warning rather than applied.
#[derive(Clone, Default)]
pub struct ToolCallRegistry {
    entries: Arc<RwLock<HashMap<String, ToolCallEntry>>>,
    order: Arc<RwLock<Vec<String>>>,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, call: ToolCall) -> ToolCallEntry {
        let entry = ToolCallEntry {
            call: call.clone(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.write().await;
        if entries.contains_key(&call.id) {
            tracing::warn!(tool_call_id = %call.id, "duplicate tool call id re-registered");
        } else {
            self.order.write().await.push(call.id.clone());
        }
        entries.insert(call.id.clone(), entry.clone());
        entry
    }

    pub async fn mark_running(&self, id: &str) {
        self.transition(id, ToolCallStatus::Running, None, None)
            .await;
    }

    pub async fn mark_complete(&self, id: &str, result: ToolResult) {
        self.transition(id, ToolCallStatus::Complete, Some(result), None)
            .await;
    }

    pub async fn mark_error(&self, id: &str, error: impl Into<String>) {
        self.transition(id, ToolCallStatus::Error, None, Some(error.into()))
            .await;
    }

    pub async fn get(&self, id: &str) -> Option<ToolCallEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// All entries in registration order.
    pub async fn entries(&self) -> Vec<ToolCallEntry> {
        let entries = self.entries.read().await;
        self.order
            .read()
            .await
            .iter()
            .filter_map(|id| entries.get(id).cloned())
            .collect()
    }

    async fn transition(
        &self,
        id: &str,
        status: ToolCallStatus,
        result: Option<ToolResult>,
        error: Option<String>,
    ) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            tracing::warn!(tool_call_id = %id, "transition for unknown tool call");
            return;
        };
        if !allows(entry.status, status) {
            tracing::warn!(
                tool_call_id = %id,
                from = ?entry.status,
                to = ?status,
                "ignoring regressive tool call transition"
            );
            return;
        }
        entry.status = status;
        entry.timestamp = Utc::now();
        if result.is_some() {
            entry.result = result;
        }
        if error.is_some() {
            entry.error = error;
        }
    }
}

fn allows(from: ToolCallStatus, to: ToolCallStatus) -> bool {
    use ToolCallStatus::*;
    matches!(
        (from, to),
        (Pending, Running) | (Pending, Complete) | (Pending, Error) | (Running, Complete) | (Running, Error)
    )
}
