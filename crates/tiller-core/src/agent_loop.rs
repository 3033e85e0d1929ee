use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tiller_observability::{emit_event, RunEvent};
use tiller_providers::{ChatMessage, ModelClient, StreamChunk};
use tiller_tools::{extract_artifacts, tier_for, ToolCallRegistry, ToolExecutor};
use tiller_types::{
    AgentEvent, AgentSettings, ApprovalStatus, Message, MessageRole, PendingApproval, RunStatus,
    Session, SessionStatus, ToolCall, ToolResult, Workspace,
};

use crate::approvals::{collect_pending, requires_approval, ApprovalGate};
use crate::session_store::SessionStore;

/// External collaborators the loop drives. The client and executor are
/// transports; the store is the durability sink.
pub struct LoopDeps {
    pub client: Arc<dyn ModelClient>,
    pub executor: Arc<dyn ToolExecutor>,
    pub store: SessionStore,
}

#[derive(Default)]
struct StreamedToolCall {
    name: String,
    args: String,
}

struct TurnOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
}

/// The driver state machine for one agent run: streams model output,
/// dispatches tool calls through the registry and the approval gate,
/// and emits a single ordered event stream until completion,
/// cancellation, or a fatal transport error.
///
/// Exactly one run per instance. `cancel`, `approve_pending` and
/// `reject_pending` are safe to call from the UI side while `run` is
/// in flight.
pub struct AgentLoop {
    workspace: Workspace,
    task: String,
    settings: AgentSettings,
    deps: LoopDeps,
    events: mpsc::UnboundedSender<AgentEvent>,
    session_id: String,
    cancel: CancellationToken,
    gate: ApprovalGate,
    registry: ToolCallRegistry,
}

impl AgentLoop {
    pub fn new(
        workspace: Workspace,
        task: impl Into<String>,
        settings: AgentSettings,
        deps: LoopDeps,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            workspace,
            task: task.into(),
            settings,
            deps,
            events,
            session_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            gate: ApprovalGate::new(),
            registry: ToolCallRegistry::new(),
        }
    }

    /// Ties this run to an externally owned token (a `RunRegistry`
    /// slot); cancelling either side stops the run.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cooperative: flips the flag checked at the top of each step and
    /// at every suspension point. Never aborts an in-flight tool call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn approve_pending(&self, ids: &[String]) {
        self.gate.approve(ids).await;
    }

    pub async fn reject_pending(&self, ids: &[String]) {
        self.gate.reject(ids).await;
    }

    pub async fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.pending().await
    }

    /// Drives the run to a terminal event. Returns `Err` only for the
    /// transport/model failure that also produced the `Error` event;
    /// retry policy stays with the caller.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut session = Session::new(self.workspace.id.clone(), self.task.clone());
        session.id = self.session_id.clone();
        session
            .messages
            .push(Message::new(MessageRole::User, self.task.clone()));
        let mut messages = vec![ChatMessage::new("user", self.task.clone())];
        self.deps.store.save(session.clone());

        match self.drive(&mut session, &mut messages).await {
            Ok(status) => {
                session.status = match status {
                    RunStatus::Cancelled => SessionStatus::Cancelled,
                    RunStatus::Complete | RunStatus::MaxStepsReached => SessionStatus::Complete,
                };
                session.updated_at = Utc::now();
                self.emit(AgentEvent::complete(status));
                self.checkpoint(&session).await;
                self.observe(Level::INFO, "run.finished", None, Some(status_name(status)), None);
                Ok(())
            }
            Err(err) => {
                session.status = SessionStatus::Error;
                session.updated_at = Utc::now();
                self.emit(AgentEvent::Error {
                    error: err.to_string(),
                });
                self.checkpoint(&session).await;
                self.observe(
                    Level::ERROR,
                    "run.failed",
                    None,
                    Some("error"),
                    Some(&err.to_string()),
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        messages: &mut Vec<ChatMessage>,
    ) -> anyhow::Result<RunStatus> {
        let max_steps = self.settings.max_steps.max(1);
        for step in 1..=max_steps {
            if self.cancel.is_cancelled() {
                return Ok(RunStatus::Cancelled);
            }
            session.current_step = step;
            session.updated_at = Utc::now();
            self.emit(AgentEvent::StepStart { step });
            self.observe(Level::INFO, "provider.call.start", Some(step), None, None);
            self.deps.store.save(session.clone());

            let turn = self.stream_turn(messages.clone(), step).await?;
            // A cancel observed mid-stream suppresses the assistant
            // turn entirely; the terminal event is the only thing left.
            if self.cancel.is_cancelled() {
                return Ok(RunStatus::Cancelled);
            }
            if !turn.text.is_empty() {
                self.emit(AgentEvent::LlmComplete {
                    content: turn.text.clone(),
                });
                session
                    .messages
                    .push(Message::new(MessageRole::Assistant, turn.text.clone()));
                messages.push(ChatMessage::new("assistant", turn.text.clone()));
            }
            if turn.tool_calls.is_empty() {
                // No tool requests: the model considers the task done.
                return Ok(RunStatus::Complete);
            }

            let mut auto = Vec::new();
            let mut gated = Vec::new();
            for call in &turn.tool_calls {
                self.registry.register(call.clone()).await;
                self.emit(AgentEvent::ToolStart {
                    tool_call: call.clone(),
                });
                let tier = tier_for(&call.function.name, &self.settings);
                if requires_approval(tier, &self.settings) {
                    gated.push(call.clone());
                } else {
                    auto.push(call.clone());
                }
            }

            for call in &auto {
                self.run_tool(call, session, messages).await;
                self.deps.store.save(session.clone());
            }

            if !gated.is_empty() {
                let batch = collect_pending(&gated, &self.settings);
                self.gate.offer(batch.clone()).await;
                session.pending_approvals = batch.clone();
                session.status = SessionStatus::WaitingApproval;
                session.updated_at = Utc::now();
                // Durable before the user ever sees the prompt; the
                // browser may go away while we wait.
                self.checkpoint(session).await;
                self.observe(
                    Level::INFO,
                    "approval.asked",
                    Some(step),
                    Some("pending"),
                    None,
                );
                self.emit(AgentEvent::ApprovalNeeded { approvals: batch });

                if !self.gate.wait_resolved(self.cancel.clone()).await {
                    return Ok(RunStatus::Cancelled);
                }
                session.pending_approvals.clear();
                session.status = SessionStatus::Running;
                for resolution in self.gate.take_resolved().await {
                    let Some(call) = turn
                        .tool_calls
                        .iter()
                        .find(|c| c.id == resolution.tool_call_id)
                        .cloned()
                    else {
                        continue;
                    };
                    let outcome = match resolution.status {
                        ApprovalStatus::Approved => "approved",
                        ApprovalStatus::Rejected => "rejected",
                        ApprovalStatus::Pending => "pending",
                    };
                    emit_event(
                        Level::INFO,
                        RunEvent {
                            event: "approval.resolved",
                            component: "agent_loop",
                            workspace_id: Some(&self.workspace.id),
                            session_id: Some(&self.session_id),
                            step: Some(step),
                            tool: Some(&resolution.tool_name),
                            status: Some(outcome),
                            detail: Some(&resolution.tool_call_id),
                        },
                    );
                    match resolution.status {
                        ApprovalStatus::Approved => {
                            self.run_tool(&call, session, messages).await;
                        }
                        ApprovalStatus::Rejected => {
                            self.reject_tool(&call, session, messages).await;
                        }
                        ApprovalStatus::Pending => {}
                    }
                }
                self.deps.store.save(session.clone());
            }
        }
        Ok(RunStatus::MaxStepsReached)
    }

    /// One model turn: forwards text deltas as they arrive and
    /// assembles streamed tool calls by id. Transport errors are
    /// terminal and bubble to `run`.
    async fn stream_turn(
        &self,
        messages: Vec<ChatMessage>,
        step: u32,
    ) -> anyhow::Result<TurnOutput> {
        let stream = self
            .deps
            .client
            .stream(messages, self.cancel.clone())
            .await
            .inspect_err(|err| {
                self.observe(
                    Level::ERROR,
                    "provider.call.error",
                    Some(step),
                    Some("failed"),
                    Some(&err.to_string()),
                );
            })?;
        tokio::pin!(stream);

        let mut text = String::new();
        let mut streamed: HashMap<String, StreamedToolCall> = HashMap::new();
        let mut arrival: Vec<String> = Vec::new();
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            let chunk = chunk.inspect_err(|err| {
                self.observe(
                    Level::ERROR,
                    "provider.call.error",
                    Some(step),
                    Some("failed"),
                    Some(&err.to_string()),
                );
            })?;
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    text.push_str(&delta);
                    self.emit(AgentEvent::LlmChunk { content: delta });
                }
                StreamChunk::ToolCallStart { id, name } => {
                    if !streamed.contains_key(&id) {
                        arrival.push(id.clone());
                    }
                    let entry = streamed.entry(id).or_default();
                    if entry.name.is_empty() {
                        entry.name = name;
                    }
                }
                StreamChunk::ToolCallDelta { id, args_delta } => {
                    if !streamed.contains_key(&id) {
                        arrival.push(id.clone());
                    }
                    streamed.entry(id).or_default().args.push_str(&args_delta);
                }
                StreamChunk::ToolCallEnd { .. } => {}
                StreamChunk::Done { .. } => break,
            }
        }
        self.observe(Level::INFO, "provider.call.finish", Some(step), Some("ok"), None);

        let tool_calls = arrival
            .into_iter()
            .filter_map(|id| {
                let call = streamed.remove(&id)?;
                if call.name.trim().is_empty() {
                    return None;
                }
                Some(ToolCall::new(id, call.name, call.args))
            })
            .collect();
        Ok(TurnOutput { text, tool_calls })
    }

    /// Executes one approved/auto call. Executor failures become a
    /// failing `ToolResult`; they never terminate the run, the model
    /// gets to react next step.
    async fn run_tool(
        &self,
        call: &ToolCall,
        session: &mut Session,
        messages: &mut Vec<ChatMessage>,
    ) {
        self.registry.mark_running(&call.id).await;
        self.observe(
            Level::INFO,
            "tool.call.start",
            Some(session.current_step),
            Some("running"),
            Some(&call.function.name),
        );
        let result = match self
            .deps
            .executor
            .execute(call, &self.workspace, self.cancel.clone())
            .await
        {
            Ok(result) => {
                self.registry.mark_complete(&call.id, result.clone()).await;
                result
            }
            Err(err) => {
                self.registry.mark_error(&call.id, err.to_string()).await;
                self.observe(
                    Level::WARN,
                    "tool.call.error",
                    Some(session.current_step),
                    Some("error"),
                    Some(&err.to_string()),
                );
                ToolResult::failure(err.to_string())
            }
        };
        if let Some(entry) = self.registry.get(&call.id).await {
            // Decoration only: extraction failure cannot fail the call.
            let artifacts = extract_artifacts(&entry);
            session.diffs.extend(artifacts.diffs);
            if let Some(execution) = artifacts.execution {
                session.executions.push(execution);
            }
        }
        self.finish_tool(call, result, session, messages).await;
    }

    async fn reject_tool(
        &self,
        call: &ToolCall,
        session: &mut Session,
        messages: &mut Vec<ChatMessage>,
    ) {
        let result = ToolResult::failure("rejected by user");
        self.registry.mark_complete(&call.id, result.clone()).await;
        self.finish_tool(call, result, session, messages).await;
    }

    async fn finish_tool(
        &self,
        call: &ToolCall,
        result: ToolResult,
        session: &mut Session,
        messages: &mut Vec<ChatMessage>,
    ) {
        self.emit(AgentEvent::ToolComplete {
            tool_call_id: call.id.clone(),
            result: result.clone(),
        });
        let payload = serde_json::json!({
            "tool_call_id": call.id,
            "tool": call.function.name,
            "result": result,
        })
        .to_string();
        session
            .messages
            .push(Message::new(MessageRole::Tool, payload.clone()));
        messages.push(ChatMessage::new("tool", payload));
        session.tool_calls = self.registry.entries().await;
        session.updated_at = Utc::now();
    }

    /// Immediate, awaited persistence for risk points. A failure here
    /// is logged and absorbed: durability is best-effort, never a
    /// correctness dependency of the run.
    async fn checkpoint(&self, session: &Session) {
        if let Err(err) = self.deps.store.save_immediate(session.clone()).await {
            self.observe(
                Level::WARN,
                "session.checkpoint.failed",
                Some(session.current_step),
                None,
                Some(&err.to_string()),
            );
        }
    }

    fn emit(&self, event: AgentEvent) {
        // A dropped receiver must not wedge the run.
        let _ = self.events.send(event);
    }

    fn observe(
        &self,
        level: Level,
        event: &str,
        step: Option<u32>,
        status: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            RunEvent {
                event,
                component: "agent_loop",
                workspace_id: Some(&self.workspace.id),
                session_id: Some(&self.session_id),
                step,
                tool: None,
                status,
                detail,
            },
        );
    }
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Complete => "complete",
        RunStatus::MaxStepsReached => "max_steps_reached",
        RunStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tiller_providers::{ChunkStream, ScriptedClient};
    use tiller_types::ToolTier;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(
            &self,
            call: &ToolCall,
            _workspace: &Workspace,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::success(json!({ "echo": call.function.name })))
        }
    }

    /// Client whose stream is fed chunk by chunk from the test body.
    struct FedClient {
        rx: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Result<StreamChunk>>>>,
    }

    impl FedClient {
        fn new() -> (Self, mpsc::UnboundedSender<anyhow::Result<StreamChunk>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    rx: Mutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl ModelClient for FedClient {
        async fn stream(
            &self,
            _messages: Vec<ChatMessage>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChunkStream> {
            let rx = self
                .rx
                .lock()
                .expect("rx lock")
                .take()
                .expect("single stream per FedClient");
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(stream))
        }
    }

    struct Harness {
        agent: Arc<AgentLoop>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        store: SessionStore,
        _dir: tempfile::TempDir,
    }

    fn harness(client: Arc<dyn ModelClient>, settings: AgentSettings) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::with_debounce(dir.path(), Duration::from_millis(10));
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = AgentLoop::new(
            Workspace::new("ws-1", "/work"),
            "do the task",
            settings,
            LoopDeps {
                client,
                executor: Arc::new(EchoExecutor),
                store: store.clone(),
            },
            tx,
        );
        Harness {
            agent: Arc::new(agent),
            events: rx,
            store,
            _dir: dir,
        }
    }

    async fn drain_until_terminal(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                AgentEvent::StepStart { .. } => "step_start",
                AgentEvent::LlmChunk { .. } => "llm_chunk",
                AgentEvent::LlmComplete { .. } => "llm_complete",
                AgentEvent::ToolStart { .. } => "tool_start",
                AgentEvent::ToolComplete { .. } => "tool_complete",
                AgentEvent::ApprovalNeeded { .. } => "approval_needed",
                AgentEvent::Complete { .. } => "complete",
                AgentEvent::Error { .. } => "error",
            })
            .collect()
    }

    #[tokio::test]
    async fn read_tier_tool_runs_without_approval() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_read", r#"{"path":"README.md"}"#);
        client.push_text_turn("all done");
        let mut h = harness(client, AgentSettings::default());

        h.agent.run().await.expect("run");
        let events = drain_until_terminal(&mut h.events).await;
        assert_eq!(
            kinds(&events),
            vec![
                "step_start",
                "tool_start",
                "tool_complete",
                "step_start",
                "llm_chunk",
                "llm_complete",
                "complete",
            ]
        );
        match events.last().expect("terminal") {
            AgentEvent::Complete { result } => assert_eq!(result.status, RunStatus::Complete),
            other => panic!("unexpected terminal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn step_numbers_are_monotonic() {
        let client = Arc::new(ScriptedClient::new());
        for i in 0..3 {
            client.push_tool_turn(&format!("c{i}"), "fs_read", "{}");
        }
        client.push_text_turn("done");
        let mut h = harness(client, AgentSettings::default());

        h.agent.run().await.expect("run");
        let events = drain_until_terminal(&mut h.events).await;
        let steps: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StepStart { step } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn write_tier_tool_suspends_until_approved() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_write", r#"{"path":"a.txt","content":"hi"}"#);
        client.push_text_turn("wrote it");
        let mut h = harness(client, AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });

        let mut seen = Vec::new();
        loop {
            let event = h.events.recv().await.expect("event");
            let is_batch = matches!(event, AgentEvent::ApprovalNeeded { .. });
            seen.push(event);
            if is_batch {
                break;
            }
        }
        match seen.last().expect("batch") {
            AgentEvent::ApprovalNeeded { approvals } => {
                assert_eq!(approvals.len(), 1);
                assert_eq!(approvals[0].tier, ToolTier::Write);
                assert_eq!(approvals[0].tool_call_id, "c1");
            }
            _ => unreachable!(),
        }
        // Suspended: nothing more until the user acts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.events.try_recv().is_err());

        h.agent.approve_pending(&["c1".to_string()]).await;
        let events = drain_until_terminal(&mut h.events).await;
        assert_eq!(
            kinds(&events),
            vec![
                "tool_complete",
                "step_start",
                "llm_chunk",
                "llm_complete",
                "complete",
            ]
        );
        run.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn rejected_tool_reports_failure_and_run_continues() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "exec_run", r#"{"command":"rm -rf /"}"#);
        client.push_text_turn("understood, stopping");
        let mut h = harness(client, AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });
        loop {
            if matches!(
                h.events.recv().await.expect("event"),
                AgentEvent::ApprovalNeeded { .. }
            ) {
                break;
            }
        }
        h.agent.reject_pending(&["c1".to_string()]).await;

        let events = drain_until_terminal(&mut h.events).await;
        let tool_complete = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolComplete { result, .. } => Some(result.clone()),
                _ => None,
            })
            .expect("tool_complete");
        assert!(!tool_complete.ok);
        assert_eq!(tool_complete.error.as_deref(), Some("rejected by user"));
        match events.last().expect("terminal") {
            AgentEvent::Complete { result } => assert_eq!(result.status, RunStatus::Complete),
            other => panic!("unexpected terminal: {other:?}"),
        }
        run.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn duplicate_approval_does_not_duplicate_tool_complete() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_write", "{}");
        client.push_text_turn("done");
        let mut h = harness(client, AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });
        loop {
            if matches!(
                h.events.recv().await.expect("event"),
                AgentEvent::ApprovalNeeded { .. }
            ) {
                break;
            }
        }
        h.agent.approve_pending(&["c1".to_string()]).await;
        h.agent.approve_pending(&["c1".to_string()]).await;

        let events = drain_until_terminal(&mut h.events).await;
        let completions = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        run.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn cancel_mid_stream_stops_chunks_and_ends_cancelled() {
        let (client, feed) = FedClient::new();
        let mut h = harness(Arc::new(client), AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });

        feed.send(Ok(StreamChunk::TextDelta("hello".to_string())))
            .expect("feed");
        // Wait until the loop has surfaced the first chunk.
        loop {
            match h.events.recv().await.expect("event") {
                AgentEvent::LlmChunk { content } => {
                    assert_eq!(content, "hello");
                    break;
                }
                AgentEvent::StepStart { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        h.agent.cancel();
        feed.send(Ok(StreamChunk::TextDelta("world".to_string())))
            .expect("feed");
        feed.send(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
        }))
        .expect("feed");

        let events = drain_until_terminal(&mut h.events).await;
        assert!(events
            .iter()
            .all(|e| !matches!(e, AgentEvent::LlmChunk { .. })));
        match events.last().expect("terminal") {
            AgentEvent::Complete { result } => assert_eq!(result.status, RunStatus::Cancelled),
            other => panic!("expected cancelled, got {other:?}"),
        }
        run.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn max_steps_exhaustion_is_its_own_outcome() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_read", "{}");
        // Second script never consumed: max_steps stops the run first.
        client.push_tool_turn("c2", "fs_read", "{}");
        let settings = AgentSettings {
            max_steps: 1,
            ..AgentSettings::default()
        };
        let mut h = harness(client, settings);

        h.agent.run().await.expect("run");
        let events = drain_until_terminal(&mut h.events).await;
        let steps = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::StepStart { .. }))
            .count();
        assert_eq!(steps, 1);
        match events.last().expect("terminal") {
            AgentEvent::Complete { result } => {
                assert_eq!(result.status, RunStatus::MaxStepsReached)
            }
            other => panic!("unexpected terminal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_is_terminal_and_marks_the_session() {
        let client = Arc::new(ScriptedClient::new());
        client.push_script(vec![Err(anyhow::anyhow!("connection reset"))]);
        let mut h = harness(client, AgentSettings::default());

        let session_id = h.agent.session_id().to_string();
        assert!(h.agent.run().await.is_err());
        let events = drain_until_terminal(&mut h.events).await;
        match events.last().expect("terminal") {
            AgentEvent::Error { error } => assert!(error.contains("connection reset")),
            other => panic!("expected error, got {other:?}"),
        }
        let session = h
            .store
            .load("ws-1", &session_id)
            .await
            .expect("session persisted");
        assert_eq!(session.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn waiting_approval_checkpoint_is_restorable_after_restart() {
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_apply_patch", r#"{"patch":"--- a/x\n+++ b/x\n"}"#);
        let mut h = harness(client, AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });
        loop {
            if matches!(
                h.events.recv().await.expect("event"),
                AgentEvent::ApprovalNeeded { .. }
            ) {
                break;
            }
        }

        // Simulated restart: fresh store over the same directory.
        let fresh = SessionStore::new(h._dir.path());
        let restorable = fresh.find_restorable("ws-1").await.expect("restorable");
        assert_eq!(restorable.id, h.agent.session_id());
        assert_eq!(restorable.status, SessionStatus::WaitingApproval);
        assert_eq!(restorable.pending_approvals.len(), 1);
        assert_eq!(restorable.pending_approvals[0].tool_call_id, "c1");

        h.agent.cancel();
        let events = drain_until_terminal(&mut h.events).await;
        match events.last().expect("terminal") {
            AgentEvent::Complete { result } => assert_eq!(result.status, RunStatus::Cancelled),
            other => panic!("expected cancelled, got {other:?}"),
        }
        run.await.expect("join").expect("run ok");
    }

    #[derive(Clone, Default)]
    struct ObsCapture {
        names: Arc<Mutex<Vec<String>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ObsCapture {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct EventName(Option<String>);
            impl tracing::field::Visit for EventName {
                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    if field.name() == "event" {
                        self.0 = Some(value.to_string());
                    }
                }
                fn record_debug(
                    &mut self,
                    _field: &tracing::field::Field,
                    _value: &dyn std::fmt::Debug,
                ) {
                }
            }
            let mut name = EventName(None);
            event.record(&mut name);
            if let Some(name) = name.0 {
                self.names.lock().expect("names lock").push(name);
            }
        }
    }

    #[tokio::test]
    async fn approval_outcomes_leave_a_structured_trace() {
        use tracing_subscriber::layer::SubscriberExt;
        let capture = ObsCapture::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(capture.clone()),
        );

        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_write", "{}");
        client.push_text_turn("done");
        let mut h = harness(client, AgentSettings::default());

        let agent = h.agent.clone();
        let run = tokio::spawn(async move { agent.run().await });
        loop {
            if matches!(
                h.events.recv().await.expect("event"),
                AgentEvent::ApprovalNeeded { .. }
            ) {
                break;
            }
        }
        h.agent.approve_pending(&["c1".to_string()]).await;
        drain_until_terminal(&mut h.events).await;
        run.await.expect("join").expect("run ok");

        let names = capture.names.lock().expect("names lock").clone();
        assert!(names.iter().any(|n| n == "approval.asked"));
        assert!(names.iter().any(|n| n == "approval.resolved"));
    }

    #[tokio::test]
    async fn patch_tool_results_populate_session_diffs() {
        let patch = "diff --git a/a.rs b/a.rs\n--- a/a.rs\n+++ b/a.rs\n@@ -1 +1 @@\n-x\n+y\n";
        let args = serde_json::to_string(&json!({ "patch": patch })).expect("args");
        let client = Arc::new(ScriptedClient::new());
        client.push_tool_turn("c1", "fs_apply_patch", &args);
        client.push_text_turn("patched");
        let mut settings = AgentSettings::default();
        // Let the patch through without a human for this test.
        settings.approvals.write = tiller_types::ApprovalMode::Auto;
        let mut h = harness(client, settings);

        let session_id = h.agent.session_id().to_string();
        h.agent.run().await.expect("run");
        drain_until_terminal(&mut h.events).await;

        let session = h.store.load("ws-1", &session_id).await.expect("session");
        assert_eq!(session.diffs.len(), 1);
        assert_eq!(session.diffs[0].new_path, "a.rs");
        assert_eq!(session.tool_calls.len(), 1);
    }
}
