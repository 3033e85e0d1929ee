use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tool::ToolTier;

/// Whether a tool tier runs without asking or pauses for the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Auto,
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub read: ApprovalMode,
    pub write: ApprovalMode,
    pub exec: ApprovalMode,
    pub other: ApprovalMode,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            read: ApprovalMode::Auto,
            write: ApprovalMode::Ask,
            exec: ApprovalMode::Ask,
            other: ApprovalMode::Ask,
        }
    }
}

impl ApprovalPolicy {
    pub fn mode_for(&self, tier: ToolTier) -> ApprovalMode {
        match tier {
            ToolTier::Read => self.read,
            ToolTier::Write => self.write,
            ToolTier::Exec => self.exec,
            ToolTier::Other => self.other,
        }
    }
}

/// Immutable per-run configuration, loaded once at loop construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub max_steps: u32,
    #[serde(default)]
    pub approvals: ApprovalPolicy,
    /// Per-tool tier overrides on top of the built-in table.
    #[serde(default)]
    pub tier_overrides: HashMap<String, ToolTier>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider_id: None,
            model_id: None,
            max_steps: 25,
            approvals: ApprovalPolicy::default(),
            tier_overrides: HashMap::new(),
        }
    }
}
