use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::FileDiff;
use crate::tool::{CommandExecution, PendingApproval, ToolCallEntry};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    WaitingApproval,
    Complete,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }
}

/// Persisted snapshot of one run. Created on the first save after task
/// submission, mutated on each significant event, finalized on
/// completion/error/cancel, then eligible for restoration until
/// dismissed or superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    pub task: String,
    pub status: SessionStatus,
    #[serde(rename = "currentStep")]
    pub current_step: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, rename = "toolCalls")]
    pub tool_calls: Vec<ToolCallEntry>,
    #[serde(default, rename = "pendingApprovals")]
    pub pending_approvals: Vec<PendingApproval>,
    #[serde(default)]
    pub diffs: Vec<FileDiff>,
    #[serde(default)]
    pub executions: Vec<CommandExecution>,
    /// Set when the user declines to resume a restorable session.
    /// Orthogonal to `status`, which stays whatever it was.
    #[serde(default)]
    pub dismissed: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(workspace_id: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            task: task.into(),
            status: SessionStatus::Running,
            current_step: 0,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            pending_approvals: Vec::new(),
            diffs: Vec::new(),
            executions: Vec::new(),
            dismissed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_restorable(&self) -> bool {
        !self.status.is_terminal() && !self.dismissed
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            task: self.task.clone(),
            status: self.status,
            current_step: self.current_step,
            updated_at: self.updated_at,
        }
    }
}

/// Read surface for session-history UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    pub task: String,
    pub status: SessionStatus,
    #[serde(rename = "currentStep")]
    pub current_step: u32,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}
