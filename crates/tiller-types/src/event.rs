use serde::{Deserialize, Serialize};

use crate::tool::{PendingApproval, ToolCall, ToolResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    MaxStepsReached,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
}

/// Everything the agent loop can emit, as a closed sum type so the
/// event sink can match exhaustively. Exactly one stream per run,
/// strictly ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StepStart {
        step: u32,
    },
    LlmChunk {
        content: String,
    },
    LlmComplete {
        content: String,
    },
    ToolStart {
        tool_call: ToolCall,
    },
    ToolComplete {
        tool_call_id: String,
        result: ToolResult,
    },
    ApprovalNeeded {
        approvals: Vec<PendingApproval>,
    },
    Complete {
        result: RunOutcome,
    },
    Error {
        error: String,
    },
}

impl AgentEvent {
    pub fn complete(status: RunStatus) -> Self {
        Self::Complete {
            result: RunOutcome { status },
        }
    }

    /// True for the events that end a run; at most one of these is
    /// observed per event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = AgentEvent::StepStart { step: 3 };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "step_start");
        assert_eq!(value["step"], 3);

        let event = AgentEvent::complete(RunStatus::MaxStepsReached);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "complete");
        assert_eq!(value["result"]["status"], "max_steps_reached");
    }

    #[test]
    fn terminal_events_are_complete_and_error() {
        assert!(AgentEvent::complete(RunStatus::Cancelled).is_terminal());
        assert!(AgentEvent::Error {
            error: "boom".to_string()
        }
        .is_terminal());
        assert!(!AgentEvent::LlmChunk {
            content: "hi".to_string()
        }
        .is_terminal());
    }
}
