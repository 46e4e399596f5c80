//! The single-consumer event loop that owns one session's [`AgentState`]
//! exclusively: one mailbox, operations and stream/tool completions all
//! serialised through it, nothing outside `run` ever touches state
//! directly.

use crate::config::{AgentConfig, ConfigPatch};
use crate::emitter::EventEmitter;
use crate::events::AgentEvent;
use crate::repair;
use crate::retry;
use crate::session::SessionCollaborator;
use crate::state::{AgentState, Status};
use crate::stream_parser;
use crate::tool_runner;
use crate::usage;
use agentcore_provider::{LlmError, LlmProvider, LlmRequest, ProviderStream, StreamEvent};
use agentcore_tools::ToolRegistry;
use agentcore_types::{Message, SessionKey, ToolCall, ToolDefinition};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub status: Status,
    pub model: String,
    pub message_count: usize,
    pub token_usage: agentcore_types::TokenUsage,
    pub retry_count: u32,
}

enum AgentCommand {
    Prompt(String, oneshot::Sender<bool>),
    Abort,
    GetState(oneshot::Sender<StateSnapshot>),
    GetContext(oneshot::Sender<Vec<Message>>),
    SetModel(String),
    SetProvider(Arc<dyn LlmProvider>),
    SyncMessages(Vec<Message>),
    Configure(ConfigPatch),
}

/// A cheap, cloneable handle implementing the eight operations described
/// for the agent state machine: `prompt`, `abort`, `get_state`,
/// `get_context`, `set_model`, `set_provider`, `sync_messages`, `configure`.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    /// Send a prompt. Replies `true` if it was queued behind a turn already
    /// in progress, `false` if it started a new turn immediately.
    pub async fn prompt(&self, text: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(AgentCommand::Prompt(text.into(), tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn abort(&self) {
        let _ = self.commands.send(AgentCommand::Abort);
    }

    pub async fn get_state(&self) -> Option<StateSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(AgentCommand::GetState(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn get_context(&self) -> Option<Vec<Message>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(AgentCommand::GetContext(tx)).ok()?;
        rx.await.ok()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let _ = self.commands.send(AgentCommand::SetModel(model.into()));
    }

    pub fn set_provider(&self, provider: Arc<dyn LlmProvider>) {
        let _ = self.commands.send(AgentCommand::SetProvider(provider));
    }

    pub fn sync_messages(&self, messages: Vec<Message>) {
        let _ = self.commands.send(AgentCommand::SyncMessages(messages));
    }

    pub fn configure(&self, patch: ConfigPatch) {
        let _ = self.commands.send(AgentCommand::Configure(patch));
    }
}

type ToolTaskFuture =
    Pin<Box<dyn Future<Output = (ToolCall, Result<agentcore_tools::ToolOutcome, tokio::task::JoinError>)> + Send>>;

pub struct AgentRuntime {
    state: AgentState,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    session: Option<Arc<dyn SessionCollaborator>>,
    emitter: Arc<EventEmitter>,
    commands: mpsc::UnboundedReceiver<AgentCommand>,
    tool_tasks: FuturesUnordered<ToolTaskFuture>,
    pending_tool_order: Vec<ToolCall>,
    /// Bumped on every abort; an in-flight retry backoff checks this after
    /// waking up and discards itself if it no longer matches.
    generation: u64,
}

impl AgentRuntime {
    pub fn new(
        session_id: SessionKey,
        config: AgentConfig,
        working_dir: std::path::PathBuf,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        session: Option<Arc<dyn SessionCollaborator>>,
        emitter: Arc<EventEmitter>,
    ) -> (Self, AgentHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = AgentState::new(session_id, config, working_dir);
        let runtime = Self {
            state,
            provider,
            tools,
            session,
            emitter,
            commands: rx,
            tool_tasks: FuturesUnordered::new(),
            pending_tool_order: Vec::new(),
            generation: 0,
        };
        (runtime, AgentHandle { commands: tx })
    }

    fn emit(&self, event: AgentEvent) {
        self.emitter.broadcast(&self.state.session_id, event, now_ms());
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            status: self.state.status,
            model: self.state.model.clone(),
            message_count: self.state.messages.len(),
            token_usage: self.state.usage.token_usage,
            retry_count: self.state.resilience.retry_count,
        }
    }

    /// Drive the mailbox until every [`AgentHandle`] has been dropped and
    /// no tool task is outstanding.
    pub async fn run(mut self) {
        loop {
            enum Step {
                Cmd(AgentCommand),
                ToolDone(ToolCall, Result<agentcore_tools::ToolOutcome, tokio::task::JoinError>),
                Closed,
            }

            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(c) => Step::Cmd(c),
                    None => Step::Closed,
                },
                Some((call, joined)) = self.tool_tasks.next() => Step::ToolDone(call, joined),
            };

            match step {
                Step::Cmd(cmd) => self.handle_command(cmd).await,
                Step::ToolDone(call, joined) => self.on_tool_completed(call, joined).await,
                Step::Closed => {
                    if self.tool_tasks.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Prompt(text, reply) => {
                if self.state.status == Status::Idle {
                    let message = Message::user(text);
                    self.state.messages.push(message.clone());
                    self.mirror_to_session(std::slice::from_ref(&message)).await;
                    self.emit(AgentEvent::AgentStart);
                    let _ = reply.send(false);
                    self.run_turn().await;
                } else {
                    // Steering: incorporated at the next opportunity rather
                    // than interrupting the turn in progress.
                    self.state.pending_messages.push(text.clone());
                    self.emit(AgentEvent::MessageQueued { text });
                    let _ = reply.send(true);
                }
            }
            AgentCommand::Abort => self.on_abort(),
            other => {
                self.apply_non_prompt_command(other);
            }
        }
    }

    /// Commands that never start a turn and are safe to apply immediately
    /// regardless of status; used both from the idle dispatcher and from
    /// inside an in-progress stream.
    fn apply_non_prompt_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::GetState(reply) => {
                let _ = reply.send(self.snapshot());
            }
            AgentCommand::GetContext(reply) => {
                let _ = reply.send(self.state.messages.clone());
            }
            AgentCommand::SetModel(model) => self.state.model = model,
            AgentCommand::SetProvider(provider) => self.provider = provider,
            AgentCommand::SyncMessages(messages) => self.state.messages = messages,
            AgentCommand::Configure(patch) => {
                self.state.config.apply_patch(patch);
                self.state.disabled_tools = self.state.config.disabled_tools.clone();
                self.emitter
                    .set_debug_enabled(self.state.config.features.debug.enabled);
            }
            AgentCommand::Prompt(_, _) | AgentCommand::Abort => unreachable!("handled by caller"),
        }
    }

    /// Returns `true` if the caller (a mid-stream select loop) should treat
    /// this as an abort request and tear the stream down.
    fn handle_command_during_turn(&mut self, cmd: AgentCommand) -> bool {
        match cmd {
            AgentCommand::Abort => true,
            AgentCommand::Prompt(text, reply) => {
                self.state.pending_messages.push(text.clone());
                self.emit(AgentEvent::MessageQueued { text });
                let _ = reply.send(true);
                false
            }
            other => {
                self.apply_non_prompt_command(other);
                false
            }
        }
    }

    fn on_abort(&mut self) {
        if let Some(cancel) = self.state.stream_health.streaming_cancel.take() {
            cancel.cancel();
        }
        tool_runner::cancel_all(&mut self.state);
        // Straggling tool futures launched before the abort must not be
        // allowed to resurface through `run()`'s select loop and drive
        // `on_tool_completed` after the turn they belonged to is gone.
        self.tool_tasks.clear();
        self.pending_tool_order.clear();
        self.state.resilience.retry_count = 0;
        self.state.status = Status::Idle;
        self.generation = self.generation.wrapping_add(1);
        self.emit(AgentEvent::AgentAbort);
    }

    /// Record a mid-stream failure — an in-band `error` event or a
    /// transport break — as a terminal, non-retried outcome: unlike a
    /// failed `stream()` call, this is never routed through
    /// [`Self::handle_turn_failure`].
    fn fail_stream(&mut self, reason: String) {
        self.state.stream_health.stream_errored = Some(reason.clone());
        self.state.status = Status::Idle;
        self.emit(AgentEvent::Error { reason });
    }

    async fn mirror_to_session(&self, messages: &[Message]) {
        if let Some(session) = &self.session {
            for m in messages {
                session.append(m.clone()).await;
            }
        }
    }

    fn check_stalled(&mut self) {
        if let Some(last) = self.state.stream_health.last_chunk_at {
            let elapsed = last.elapsed().as_secs();
            if elapsed >= 10 {
                self.emit(AgentEvent::StreamStalled {
                    elapsed_seconds: elapsed,
                });
            }
        }
    }

    /// The fourteen-step turn execution algorithm. Boxed because it
    /// recurses (resuming after compaction, draining steered messages,
    /// retrying after a transient failure).
    fn run_turn(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            // Step 1: proactive compaction, or overflow recovery if a prior
            // turn already flagged the window as exceeded.
            if self.state.usage.overflow_detected {
                let (recovered, events) =
                    usage::handle_overflow_compaction(&mut self.state, self.session.as_deref()).await;
                for e in events {
                    self.emit(e);
                }
                if !recovered {
                    self.state.status = Status::Idle;
                    return;
                }
            } else {
                let events = usage::maybe_auto_compact(&mut self.state, self.session.as_deref()).await;
                for e in events {
                    self.emit(e);
                }
            }

            // Step 2: Layer 1 repair.
            repair::repair_orphaned_calls(&mut self.state.messages);

            // Step 3: build the message list the provider will see.
            let repaired = repair::ensure_tool_results(&self.state.messages);
            let system = {
                let prompt = self.tools.combined_prompts();
                if prompt.is_empty() {
                    None
                } else {
                    Some(prompt)
                }
            };

            // Step 4: active tools for this turn.
            let active =
                tool_runner::active_tool_names(&self.state.config, &self.state.disabled_tools, &self.tools);
            let tool_defs: Vec<ToolDefinition> = self
                .tools
                .get_definitions()
                .into_iter()
                .filter(|d| active.contains(&d.name))
                .map(|d| ToolDefinition {
                    name: d.name,
                    description: d.description,
                    input_schema: d.input_schema,
                })
                .collect();

            let llm_messages = self.provider.convert_messages(&repaired);
            let llm_tools = if tool_defs.is_empty() {
                None
            } else {
                Some(self.provider.convert_tools(&tool_defs))
            };

            let request = LlmRequest {
                model: self.state.model.clone(),
                messages: llm_messages,
                tools: llm_tools,
                system,
                ..Default::default()
            };

            // Step 5
            self.emit(AgentEvent::RequestStart {
                model: self.state.model.clone(),
                message_count: repaired.len(),
            });

            // Step 6
            let stream_result = self.provider.stream(request).await;

            // Step 7
            self.emit(AgentEvent::RequestEnd);

            let provider_stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    self.handle_turn_failure(e).await;
                    return;
                }
            };

            // Step 8/9: stream and fold chunks until done or error. A
            // mid-stream failure (in-band `error` event or a transport
            // break) is never retried: stream_turn has already reset state
            // to idle and emitted the terminal event via fold_event or
            // fail_stream, so there is nothing left to do here but an abort
            // requires on_abort's extra cleanup (retry state, tool tasks).
            let stream_outcome = self.stream_turn(provider_stream).await;
            if let Err(e) = stream_outcome {
                if matches!(e, LlmError::Cancelled) {
                    self.on_abort();
                }
                return;
            }

            // Step 10: finalize the assistant turn.
            let tool_calls = stream_parser::finalize_tool_calls(&self.state.accumulator.current_tool_calls);
            let assistant_message = if tool_calls.is_empty() {
                Message::assistant(self.state.accumulator.current_text.clone())
            } else {
                Message::assistant_with_tools(self.state.accumulator.current_text.clone(), tool_calls.clone())
            };
            self.state.messages.push(assistant_message.clone());
            self.mirror_to_session(std::slice::from_ref(&assistant_message)).await;

            // Step 11
            self.state.resilience.retry_count = 0;

            // Step 12: overflow recovery if this turn's usage exceeded the window.
            if self.state.usage.overflow_detected {
                let (recovered, events) =
                    usage::handle_overflow_compaction(&mut self.state, self.session.as_deref()).await;
                for e in events {
                    self.emit(e);
                }
                if recovered {
                    self.run_turn().await;
                } else {
                    self.state.status = Status::Idle;
                }
                return;
            }

            // Step 13/14
            if !tool_calls.is_empty() {
                self.emit(AgentEvent::TurnEnd { assistant_message });
                self.begin_tool_execution(tool_calls).await;
            } else {
                self.state.status = Status::Running;
                self.finish_or_continue().await;
            }
        })
    }

    async fn finish_or_continue(&mut self) {
        if !self.state.pending_messages.is_empty() {
            let drained: Vec<String> = self.state.pending_messages.drain(..).collect();
            for text in drained {
                let message = Message::user(text.clone());
                self.state.messages.push(message.clone());
                self.mirror_to_session(std::slice::from_ref(&message)).await;
                self.emit(AgentEvent::MessageApplied { text });
            }
            self.run_turn().await;
        } else {
            self.state.status = Status::Idle;
            self.emit(AgentEvent::AgentEnd {
                messages: self.state.messages.clone(),
                final_usage: self.state.usage.token_usage,
            });
        }
    }

    async fn handle_turn_failure(&mut self, err: LlmError) {
        match retry::classify_llm_error(&err) {
            retry::Classification::Overflow => {
                let (recovered, events) =
                    usage::handle_overflow_compaction(&mut self.state, self.session.as_deref()).await;
                for e in events {
                    self.emit(e);
                }
                if recovered {
                    self.run_turn().await;
                } else {
                    self.state.status = Status::Idle;
                }
            }
            retry::Classification::Transient
                if self.state.resilience.retry_count < self.state.resilience.max_retries =>
            {
                self.state.resilience.retry_count += 1;
                let attempt = self.state.resilience.retry_count;
                let delay = retry::delay_ms(
                    attempt,
                    self.state.resilience.retry_base_delay_ms,
                    self.state.resilience.retry_max_delay_ms,
                );
                self.emit(AgentEvent::Retry {
                    attempt,
                    delay_ms: delay,
                    reason: err.reason(),
                });
                let generation = self.generation;
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                if generation != self.generation {
                    // Aborted during the backoff: this retry is stale.
                    return;
                }
                self.run_turn().await;
            }
            _ => {
                self.emit(AgentEvent::Error { reason: err.reason() });
                self.state.resilience.retry_count = 0;
                self.state.status = Status::Idle;
            }
        }
    }

    /// Step 8/9: transition to streaming, reset the accumulator, and fold
    /// chunks until the stream reports done or errors.
    async fn stream_turn(&mut self, provider_stream: ProviderStream) -> Result<(), LlmError> {
        self.state.status = Status::Streaming;
        self.state.reset_accumulator();
        self.state.stream_health.last_chunk_at = Some(std::time::Instant::now());
        let cancel = provider_stream.cancel_handle();
        self.state.stream_health.streaming_cancel = Some(cancel.clone());

        let mut watchdog = tokio::time::interval(std::time::Duration::from_secs(5));
        watchdog.tick().await; // first tick fires immediately

        enum ChunkStep {
            Cmd(AgentCommand),
            CommandsClosed,
            Event(StreamEvent),
            Bytes(bytes::Bytes),
            Ended,
            Error(LlmError),
            Tick,
        }

        let result = match provider_stream {
            ProviderStream::Native { mut events, .. } => loop {
                let step = tokio::select! {
                    biased;
                    cmd = self.commands.recv() => match cmd {
                        Some(c) => ChunkStep::Cmd(c),
                        None => ChunkStep::CommandsClosed,
                    },
                    item = events.next() => match item {
                        Some(Ok(ev)) => ChunkStep::Event(ev),
                        Some(Err(e)) => ChunkStep::Error(e),
                        None => ChunkStep::Ended,
                    },
                    _ = watchdog.tick() => ChunkStep::Tick,
                };

                match step {
                    ChunkStep::Cmd(cmd) => {
                        if self.handle_command_during_turn(cmd) {
                            cancel.cancel();
                            break Err(LlmError::Cancelled);
                        }
                    }
                    ChunkStep::CommandsClosed => {}
                    ChunkStep::Event(event) => {
                        self.state.stream_health.last_chunk_at = Some(std::time::Instant::now());
                        let done = matches!(event, StreamEvent::ResponseDone { .. });
                        let error_reason = match &event {
                            StreamEvent::Error(reason) => Some(reason.clone()),
                            _ => None,
                        };
                        let agent_events = stream_parser::fold_event(&mut self.state, event);
                        for e in agent_events {
                            self.emit(e);
                        }
                        if let Some(reason) = error_reason {
                            break Err(LlmError::StreamError(reason));
                        }
                        if done {
                            break Ok(());
                        }
                    }
                    ChunkStep::Bytes(_) => unreachable!("native stream never yields raw bytes"),
                    ChunkStep::Ended => break Ok(()),
                    ChunkStep::Error(e) => {
                        self.fail_stream(e.reason());
                        break Err(e);
                    }
                    ChunkStep::Tick => self.check_stalled(),
                }
            },
            ProviderStream::Sse { mut body, .. } => {
                let mut buf = String::new();
                loop {
                    let step = tokio::select! {
                        biased;
                        cmd = self.commands.recv() => match cmd {
                            Some(c) => ChunkStep::Cmd(c),
                            None => ChunkStep::CommandsClosed,
                        },
                        item = body.next() => match item {
                            Some(Ok(bytes)) => ChunkStep::Bytes(bytes),
                            Some(Err(e)) => ChunkStep::Error(e),
                            None => ChunkStep::Ended,
                        },
                        _ = watchdog.tick() => ChunkStep::Tick,
                    };

                    match step {
                        ChunkStep::Cmd(cmd) => {
                            if self.handle_command_during_turn(cmd) {
                                cancel.cancel();
                                break Err(LlmError::Cancelled);
                            }
                        }
                        ChunkStep::CommandsClosed => {}
                        ChunkStep::Bytes(chunk) => {
                            self.state.stream_health.last_chunk_at = Some(std::time::Instant::now());
                            let lines = stream_parser::frame_sse_lines(&mut buf, &chunk);
                            let mut done = false;
                            let mut stream_error = None;
                            for line in lines {
                                for event in self.provider.parse_stream_event(&line) {
                                    if matches!(event, StreamEvent::ResponseDone { .. }) {
                                        done = true;
                                    }
                                    if let StreamEvent::Error(reason) = &event {
                                        stream_error = Some(reason.clone());
                                    }
                                    let agent_events = stream_parser::fold_event(&mut self.state, event);
                                    for e in agent_events {
                                        self.emit(e);
                                    }
                                }
                                if stream_error.is_some() {
                                    break;
                                }
                            }
                            if let Some(reason) = stream_error {
                                break Err(LlmError::StreamError(reason));
                            }
                            if done {
                                break Ok(());
                            }
                        }
                        ChunkStep::Event(_) => unreachable!("sse stream never yields parsed events"),
                        ChunkStep::Ended => break Ok(()),
                        ChunkStep::Error(e) => {
                            self.fail_stream(e.reason());
                            break Err(e);
                        }
                        ChunkStep::Tick => self.check_stalled(),
                    }
                }
            }
        };

        self.state.stream_health.streaming_cancel = None;
        result
    }

    async fn begin_tool_execution(&mut self, calls: Vec<ToolCall>) {
        self.state.tool_results.clear();
        let launched = tool_runner::launch_batch(
            self.tools.clone(),
            &calls,
            &self.state.working_dir,
            &self.state.session_id,
            serde_json::Value::Null,
        );
        tool_runner::register_pending(&mut self.state, &launched);

        for call in &calls {
            self.emit(AgentEvent::ToolExecutionStart {
                name: call.name.clone(),
                call_id: call.id.clone(),
                arguments: serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null),
            });
        }

        self.pending_tool_order = calls;
        for tool in launched {
            let tool_runner::LaunchedTool { call, handle, .. } = tool;
            self.tool_tasks.push(Box::pin(async move {
                let joined = handle.await;
                (call, joined)
            }));
        }
    }

    async fn on_tool_completed(
        &mut self,
        call: ToolCall,
        joined: Result<agentcore_tools::ToolOutcome, tokio::task::JoinError>,
    ) {
        let (call, outcome) = tool_runner::join_result(call, joined);
        // A tool effect (e.g. `load_skill`) may push a message directly
        // into state as a side effect of `record_result`; mirror whatever
        // it added along with everything else.
        let before = self.state.messages.len();
        let events = tool_runner::record_result(&mut self.state, call, outcome);
        if self.state.messages.len() > before {
            let added = self.state.messages[before..].to_vec();
            self.mirror_to_session(&added).await;
        }
        for e in events {
            self.emit(e);
        }

        if tool_runner::all_settled(&self.state) {
            let order = std::mem::take(&mut self.pending_tool_order);
            let results = tool_runner::finalize_tool_results(&self.state, &order);
            self.mirror_to_session(&results).await;
            self.state.messages.extend(results);
            self.state.status = Status::Running;
            self.run_turn().await;
        }
    }
}
