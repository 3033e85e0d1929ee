use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Incremental output of one model turn. Tool call arguments arrive as
/// string deltas keyed by call id and are assembled by the consumer.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_delta: String },
    ToolCallEnd { id: String },
    Done { finish_reason: String },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// The streaming endpoint the agent loop talks to. Implementations are
/// remote transports; the loop only sees an ordered chunk stream.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

/// Replays pre-scripted chunk sequences, one script per `stream` call.
/// Exists so the loop can be exercised without a live backend; an
/// exhausted script queue ends the run like a model that stops calling
/// tools.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Vec<anyhow::Result<StreamChunk>>>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, chunks: Vec<anyhow::Result<StreamChunk>>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(chunks);
    }

    /// Convenience: a turn that streams `text` and finishes clean.
    pub fn push_text_turn(&self, text: &str) {
        self.push_script(vec![
            Ok(StreamChunk::TextDelta(text.to_string())),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
            }),
        ]);
    }

    /// Convenience: a turn that requests one tool call.
    pub fn push_tool_turn(&self, call_id: &str, name: &str, arguments: &str) {
        self.push_script(vec![
            Ok(StreamChunk::ToolCallStart {
                id: call_id.to_string(),
                name: name.to_string(),
            }),
            Ok(StreamChunk::ToolCallDelta {
                id: call_id.to_string(),
                args_delta: arguments.to_string(),
            }),
            Ok(StreamChunk::ToolCallEnd {
                id: call_id.to_string(),
            }),
            Ok(StreamChunk::Done {
                finish_reason: "tool_calls".to_string(),
            }),
        ]);
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| {
                vec![Ok(StreamChunk::Done {
                    finish_reason: "stop".to_string(),
                })]
            });
        Ok(Box::pin(futures::stream::iter(script)))
    }
}
