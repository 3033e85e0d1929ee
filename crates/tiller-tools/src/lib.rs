pub mod artifacts;
pub mod registry;
pub mod tiers;

pub use artifacts::*;
pub use registry::*;
pub use tiers::*;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tiller_types::{ToolCall, ToolResult, Workspace};

/// The execution endpoint the loop hands tool calls to. From the
/// loop's perspective this is synchronous: one call in, one result
/// out, however remote the backend actually is.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        call: &ToolCall,
        workspace: &Workspace,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult>;
}

/// Executor that acknowledges every call without doing anything.
/// Useful as a stand-in while wiring a frontend against the loop.
pub struct NullExecutor;

#[async_trait]
impl ToolExecutor for NullExecutor {
    async fn execute(
        &self,
        call: &ToolCall,
        _workspace: &Workspace,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        Ok(ToolResult::success(
            json!({ "tool": call.function.name, "acknowledged": true }),
        ))
    }
}
