use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use tiller_diff::parse_diff;
use tiller_types::{CommandExecution, ExecutionStatus, FileDiff, ToolCallEntry, ToolCallStatus};

/// Reviewable side effects recovered from a finished tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolArtifacts {
    pub diffs: Vec<FileDiff>,
    pub execution: Option<CommandExecution>,
}

impl ToolArtifacts {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty() && self.execution.is_none()
    }
}

/// Best-effort decoration over a completed call: a patch-application
/// call yields file diffs, a command-execution call yields an execution
/// record, anything else yields nothing. Malformed payloads also yield
/// nothing; extraction is never allowed to fail the call it decorates.
pub fn extract_artifacts(entry: &ToolCallEntry) -> ToolArtifacts {
    if !matches!(
        entry.status,
        ToolCallStatus::Complete | ToolCallStatus::Error
    ) {
        return ToolArtifacts::default();
    }
    match entry.call.function.name.as_str() {
        "fs_apply_patch" => ToolArtifacts {
            diffs: extract_diffs(entry),
            execution: None,
        },
        "exec_run" => ToolArtifacts {
            diffs: Vec::new(),
            execution: extract_execution(entry),
        },
        _ => ToolArtifacts::default(),
    }
}

fn extract_diffs(entry: &ToolCallEntry) -> Vec<FileDiff> {
    let args = entry.call.args();
    let Some(patch) = args.get("patch").and_then(Value::as_str) else {
        tracing::debug!(
            tool_call_id = %entry.call.id,
            "patch argument missing or not a string, skipping diff extraction"
        );
        return Vec::new();
    };
    parse_diff(patch)
}

fn extract_execution(entry: &ToolCallEntry) -> Option<CommandExecution> {
    let args = entry.call.args();
    let payload = entry
        .result
        .as_ref()
        .and_then(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let status = match entry.status {
        ToolCallStatus::Complete => ExecutionStatus::Complete,
        _ => ExecutionStatus::Error,
    };
    Some(CommandExecution {
        id: Uuid::new_v4().to_string(),
        command_id: entry.call.id.clone(),
        args: args.clone(),
        cwd: args
            .get("cwd")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        status,
        exit_code: payload.get("exit_code").and_then(Value::as_i64),
        stdout: payload
            .get("stdout")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        stderr: payload
            .get("stderr")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        duration_ms: payload.get("duration_ms").and_then(Value::as_u64),
        timestamp: Utc::now(),
    })
}
