//! The agent driver: classify the user's intent, dispatch by mode, and
//! run the prepare → infer → execute-tools loop until the model rests or
//! the iteration cap trips.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{
    ContextManager, PrepareFormat, PrepareOptions, PreparedOutput, ToolResultItem,
};
use crate::conversation::ContentPart;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::idempotency::IdempotencyCache;
use crate::intent::{self, Intent};
use crate::mode::{recommend_mode, AgentMode, ModeManager, ModeState};
use crate::plan::{Plan, Task, TaskStatus};
use crate::session::{NoSessionStore, SessionStore};
use crate::tools::{ToolContext, ToolRegistry};
use crate::transport::{
    LlmTransport, StopReason, StreamEvent, TransportRequest, TransportResponse, Usage,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub session_id: Option<String>,
    pub idempotency_ttl: Duration,
    pub idempotency_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            max_iterations: 20,
            session_id: None,
            idempotency_ttl: Duration::from_secs(300),
            idempotency_capacity: 128,
        }
    }
}

/// What one `handle` call produced.
#[derive(Debug)]
pub struct AgentTurn {
    pub text: String,
    pub iterations: usize,
    pub usage: Usage,
    pub mode: AgentMode,
}

const PLAN_INSTRUCTIONS: &str = "\
Break the user's goal into an ordered task list. Respond with ONLY a JSON \
object of the shape {\"goal\": string, \"tasks\": [{\"id\": string, \"name\": \
string, \"description\": string, \"depends_on\": [string]}]}. Three to seven \
tasks; ids t1, t2, …; keep descriptions actionable.";

/// The agent. Wire up a transport, a context manager, tools, and go.
pub struct Agent {
    transport: Box<dyn LlmTransport>,
    context: ContextManager,
    tools: ToolRegistry,
    store: Box<dyn SessionStore>,
    modes: ModeManager,
    idempotency: Option<Arc<Mutex<IdempotencyCache>>>,
    config: AgentConfig,
    events: Option<UnboundedSender<AgentEvent>>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(
        transport: impl LlmTransport + 'static,
        context: ContextManager,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        let idempotency = context.features().memory.then(|| {
            Arc::new(Mutex::new(IdempotencyCache::new(
                config.idempotency_ttl,
                config.idempotency_capacity,
            )))
        });
        Self {
            transport: Box::new(transport),
            context,
            tools,
            store: Box::new(NoSessionStore),
            modes: ModeManager::new(),
            idempotency,
            config,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<AgentEvent>) -> Self {
        self.context.set_events(events.clone());
        self.events = Some(events);
        self
    }

    /// Token callers can use to abort in-flight work from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn mode(&self) -> AgentMode {
        self.modes.mode()
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn pending_plan(&self) -> Option<&Plan> {
        self.modes.pending_plan()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn bare_turn(&self, text: impl Into<String>) -> AgentTurn {
        AgentTurn {
            text: text.into(),
            iterations: 0,
            usage: Usage::default(),
            mode: self.modes.mode(),
        }
    }

    /// One user turn. Classifies, dispatches by mode, and drives the loop.
    pub async fn handle(&mut self, input: &str) -> Result<AgentTurn, AgentError> {
        let intent = intent::classify(input);
        let recommended = recommend_mode(intent, self.modes.mode(), self.modes.awaiting_approval());
        info!(?intent, current = ?self.modes.mode(), ?recommended, "turn dispatched");

        match intent {
            Intent::Interrupt => {
                if self.modes.mode() == AgentMode::Executing {
                    self.modes.pause_execution();
                    Ok(self.bare_turn("Execution paused. Say \"resume\" to continue."))
                } else {
                    Ok(self.bare_turn("Nothing is running."))
                }
            }
            Intent::StatusQuery => Ok(self.status_turn()),
            Intent::Approval if self.modes.awaiting_approval() => {
                let plan = self.modes.approve_plan()?.clone();
                self.emit(AgentEvent::PlanApproved {
                    goal: plan.goal.clone(),
                });
                let old_mode = self.modes.mode();
                self.context
                    .set_task_type(crate::context::detect_task_type(&plan.goal));
                self.modes.enter_executing()?;
                self.emit(AgentEvent::ModeChanged {
                    from: old_mode,
                    to: AgentMode::Executing,
                });
                self.run_plan().await
            }
            Intent::Rejection if self.modes.awaiting_approval() => {
                if let Some(plan) = self.modes.reject_plan() {
                    self.emit(AgentEvent::PlanRejected { goal: plan.goal });
                }
                Ok(self.bare_turn("Plan discarded. What should change?"))
            }
            Intent::Complex if self.modes.mode() == AgentMode::Interactive => {
                self.modes.enter_planning("complex request");
                self.emit(AgentEvent::ModeChanged {
                    from: AgentMode::Interactive,
                    to: AgentMode::Planning,
                });
                self.context.add_user_message(input);
                let (plan, usage) = self.build_plan().await?;
                let summary = format!(
                    "Proposed plan for \"{}\": {} tasks. Approve to start.",
                    plan.goal,
                    plan.tasks.len()
                );
                let mut turn = self.bare_turn(summary);
                turn.usage = usage;
                turn.iterations = 1;
                Ok(turn)
            }
            Intent::PlanModify if self.modes.awaiting_approval() => {
                self.context.add_user_message(input);
                let (plan, usage) = self.build_plan().await?;
                let mut turn = self.bare_turn(format!(
                    "Updated plan for \"{}\": {} tasks. Approve to start.",
                    plan.goal,
                    plan.tasks.len()
                ));
                turn.usage = usage;
                turn.iterations = 1;
                Ok(turn)
            }
            _ => {
                // Simple requests, feedback, and everything that falls
                // through runs as a plain conversation turn.
                if self.modes.is_paused() && wants_resume(input) {
                    self.modes.resume_execution();
                    return self.run_plan().await;
                }
                self.context.add_user_message(input);
                let turn = self.run_conversation().await?;
                self.checkpoint().await?;
                Ok(turn)
            }
        }
    }

    fn status_turn(&self) -> AgentTurn {
        let mut lines = vec![format!("mode: {:?}", self.modes.mode())];
        if self.modes.is_paused() {
            lines.push("execution is paused".into());
        }
        if let Some(plan) = self.modes.pending_plan() {
            lines.push(format!(
                "plan \"{}\" awaiting approval ({} tasks)",
                plan.goal,
                plan.tasks.len()
            ));
        }
        if let Some(plan) = self.modes.active_plan() {
            lines.push(format!(
                "plan \"{}\": {} done, {} failed, {} pending of {}",
                plan.goal,
                plan.count(TaskStatus::Completed),
                plan.count(TaskStatus::Failed),
                plan.count(TaskStatus::Pending),
                plan.tasks.len()
            ));
        }
        self.bare_turn(lines.join("\n"))
    }

    /// Ask the model for a task breakdown and stage it for approval.
    async fn build_plan(&mut self) -> Result<(Plan, Usage), AgentError> {
        let prepared = self.context.prepare(PrepareOptions {
            instruction_override: Some(PLAN_INSTRUCTIONS.into()),
            format: PrepareFormat::LlmInput,
        })?;
        let request = self.request_from(prepared.output, Vec::new())?;
        let response = self.infer(request).await?;

        let text: String = response
            .output
            .iter()
            .filter_map(|p| match p {
                ContentPart::OutputText { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let goal_fallback = self
            .context
            .conversation()
            .messages()
            .last()
            .map(|m| m.text())
            .unwrap_or_default();
        let plan = parse_plan(&text, &goal_fallback);
        self.emit(AgentEvent::PlanPending {
            goal: plan.goal.clone(),
            tasks: plan.tasks.len(),
        });
        self.modes.set_pending_plan(plan.clone())?;
        Ok((plan, response.usage))
    }

    /// Execute the active plan task by task, honoring the pause flag at
    /// task boundaries.
    async fn run_plan(&mut self) -> Result<AgentTurn, AgentError> {
        let mut usage = Usage::default();
        let mut iterations = 0usize;
        let mut last_text = String::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if self.modes.is_paused() {
                info!("execution paused at task boundary");
                return Ok(AgentTurn {
                    text: "Execution paused.".into(),
                    iterations,
                    usage,
                    mode: self.modes.mode(),
                });
            }

            let Some(task) = self
                .modes
                .active_plan()
                .and_then(Plan::next_ready)
                .cloned()
            else {
                break;
            };

            self.emit(AgentEvent::TaskStarted {
                id: task.id.clone(),
                name: task.name.clone(),
            });
            if let Some(plan) = self.modes.active_plan_mut() {
                plan.set_status(&task.id, TaskStatus::InProgress)?;
            }

            let prompt = format!(
                "Work on task {} — {}: {}",
                task.id, task.name, task.description
            );
            self.context.add_user_message(&prompt);

            match self.run_loop(&mut usage, &mut iterations).await {
                Ok(text) => {
                    last_text = text.clone();
                    if let Some(plan) = self.modes.active_plan_mut() {
                        plan.set_status(&task.id, TaskStatus::Completed)?;
                        plan.set_result(&task.id, text);
                    }
                    self.emit(AgentEvent::TaskCompleted { id: task.id.clone() });
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!(task = %task.id, error = %e, "task failed");
                    if let Some(plan) = self.modes.active_plan_mut() {
                        plan.set_status(&task.id, TaskStatus::Failed)?;
                        plan.propagate_blocks();
                    }
                    self.emit(AgentEvent::TaskFailed {
                        id: task.id.clone(),
                        error: e.to_string(),
                    });
                }
            }

            self.checkpoint().await?;
        }

        let (completed, failed) = self
            .modes
            .active_plan()
            .map(|p| (p.count(TaskStatus::Completed), p.count(TaskStatus::Failed)))
            .unwrap_or((0, 0));
        self.emit(AgentEvent::ExecutionDone { completed, failed });

        let old_mode = self.modes.mode();
        self.modes.return_to_interactive("plan settled");
        self.emit(AgentEvent::ModeChanged {
            from: old_mode,
            to: AgentMode::Interactive,
        });
        self.checkpoint().await?;

        Ok(AgentTurn {
            text: if last_text.is_empty() {
                format!("Plan finished: {completed} completed, {failed} failed.")
            } else {
                last_text
            },
            iterations,
            usage,
            mode: self.modes.mode(),
        })
    }

    async fn run_conversation(&mut self) -> Result<AgentTurn, AgentError> {
        let mut usage = Usage::default();
        let mut iterations = 0usize;
        let text = self.run_loop(&mut usage, &mut iterations).await?;
        self.emit(AgentEvent::Finished { iterations });
        Ok(AgentTurn {
            text,
            iterations,
            usage,
            mode: self.modes.mode(),
        })
    }

    /// The core loop: prepare → infer → record → execute tools → repeat.
    async fn run_loop(
        &mut self,
        usage: &mut Usage,
        iterations: &mut usize,
    ) -> Result<String, AgentError> {
        let mut final_text = String::new();

        for _ in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            *iterations += 1;
            self.emit(AgentEvent::IterationStart {
                iteration: *iterations,
            });

            if let Some(cache) = &self.idempotency {
                lock(cache).tick();
            }

            let prepared = self.context.prepare(PrepareOptions::default())?;
            let request = self.request_from(prepared.output, self.tools.schemas())?;
            let response = self.infer(request).await?;
            usage.accumulate(&response.usage);

            for part in &response.output {
                if let ContentPart::OutputText { text } = part {
                    final_text = text.clone();
                    self.emit(AgentEvent::Text {
                        content: text.clone(),
                    });
                }
            }
            self.context.add_assistant_response(response.output.clone());

            match response.stop_reason {
                StopReason::EndTurn => return Ok(final_text),
                StopReason::MaxTokens => {
                    info!("response truncated, continuing");
                }
                StopReason::ToolUse => {
                    let mut results = Vec::new();
                    let mut cancelled = false;
                    for part in &response.output {
                        let ContentPart::ToolUse { id, name, input } = part else {
                            continue;
                        };
                        self.emit(AgentEvent::ToolStart {
                            name: name.clone(),
                            input: input.clone(),
                        });

                        let (content, error) = if cancelled {
                            ("cancelled".to_string(), Some("cancelled".to_string()))
                        } else {
                            let outcome = self.execute_tool(name, input).await;
                            cancelled = self.cancel.is_cancelled();
                            outcome
                        };

                        self.emit(AgentEvent::ToolComplete {
                            name: name.clone(),
                            output: content.clone(),
                            is_error: error.is_some(),
                        });
                        let (describe_call, expected_small) = self
                            .tools
                            .get(name)
                            .map(|t| {
                                (
                                    t.describe_call(input),
                                    t.expected_output() == crate::tools::ExpectedOutput::Small,
                                )
                            })
                            .unwrap_or((None, false));
                        results.push(ToolResultItem {
                            tool_use_id: id.clone(),
                            tool_name: name.clone(),
                            content,
                            error,
                            tool_args: input.clone(),
                            describe_call,
                            expected_small,
                        });
                    }
                    // Admission guard: make room before the results land.
                    let incoming: u32 = results
                        .iter()
                        .map(|r| crate::estimator::estimate(&r.content, crate::estimator::ContentKind::Mixed))
                        .sum();
                    if !self.context.ensure_capacity(incoming)? {
                        warn!(incoming, "tool results exceed remaining capacity even after compaction");
                    }
                    // Results land even on cancellation so no tool_use is
                    // left dangling.
                    self.context.add_tool_results(results)?;
                    if cancelled {
                        return Err(AgentError::Cancelled);
                    }
                }
            }
        }

        warn!(
            max_iterations = self.config.max_iterations,
            "agent hit iteration limit"
        );
        Ok(final_text)
    }

    fn request_from(
        &self,
        output: PreparedOutput,
        tools: Vec<Value>,
    ) -> Result<TransportRequest, AgentError> {
        match output {
            PreparedOutput::LlmInput { system, messages } => Ok(TransportRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                system: (!system.is_empty()).then_some(system),
                tools,
                messages,
            }),
            PreparedOutput::Components(_) => Err(AgentError::Context(
                "prepare returned components for an llm-input request".into(),
            )),
        }
    }

    /// Run one inference, streaming progress events when a listener is
    /// attached and honoring cancellation either way.
    async fn infer(&mut self, request: TransportRequest) -> Result<TransportResponse, AgentError> {
        if let Some(events) = self.events.clone() {
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);
            let response = {
                let mut call = Box::pin(self.transport.stream(request, tx));
                loop {
                    tokio::select! {
                        result = &mut call => {
                            while let Ok(event) = rx.try_recv() {
                                forward_stream_event(&events, event);
                            }
                            break result?;
                        }
                        Some(event) = rx.recv() => {
                            forward_stream_event(&events, event);
                        }
                        _ = self.cancel.cancelled() => {
                            return Err(AgentError::Cancelled);
                        }
                    }
                }
            };
            Ok(response)
        } else {
            tokio::select! {
                result = self.transport.run(request) => Ok(result?),
                _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            }
        }
    }

    /// Execute one tool call: consult the idempotency cache for safe
    /// tools, otherwise run with the shared handles and the abort signal.
    async fn execute_tool(&self, name: &str, args: &Value) -> (String, Option<String>) {
        let safe = self
            .tools
            .get(name)
            .map(|t| t.idempotency_safe())
            .unwrap_or(false);

        if safe {
            if let Some(cache) = &self.idempotency {
                if let Some(hit) = lock(cache).get(name, args) {
                    info!(tool = name, "idempotency cache hit");
                    return (hit, None);
                }
            }
        }

        let ctx = ToolContext {
            memory: self.context.memory_handle(),
            idempotency: self.idempotency.clone(),
            auto_spill: self.context.auto_spill_handle(),
            cancel: self.cancel.child_token(),
        };

        let result = tokio::select! {
            result = self.tools.execute(name, args, &ctx) => result,
            _ = self.cancel.cancelled() => Err("cancelled".to_string()),
        };

        match result {
            Ok(output) => {
                if safe {
                    if let Some(cache) = &self.idempotency {
                        lock(cache).set(name, args, output.clone());
                    }
                }
                (output, None)
            }
            Err(error) => (error.clone(), Some(error)),
        }
    }

    /// Persistence callback: runs at iteration and task boundaries when a
    /// session id is configured.
    async fn checkpoint(&mut self) -> Result<(), AgentError> {
        let Some(id) = self.config.session_id.clone() else {
            return Ok(());
        };
        let mut state = self.context.state();
        state["agent_state"] = json!(self.modes.to_state());
        state["tools"] = json!(self.tools.names());
        state["config"]["model"] = json!(self.config.model);
        self.store.save(&id, &state, None).await
    }

    /// Restore a previous session into this agent.
    pub async fn resume(&mut self, session_id: &str) -> Result<bool, AgentError> {
        let Some(stored) = self.store.load(session_id).await? else {
            return Ok(false);
        };
        self.context.restore_state(&stored.state)?;
        if let Some(agent_state) = stored.state.get("agent_state") {
            if !agent_state.is_null() {
                let mode_state: ModeState = serde_json::from_value(agent_state.clone())
                    .map_err(|e| AgentError::Session(format!("bad agent state: {e}")))?;
                self.modes = ModeManager::from_state(mode_state);
            }
        }
        self.config.session_id = Some(session_id.to_string());
        info!(session_id, "session resumed");
        Ok(true)
    }
}

fn forward_stream_event(events: &UnboundedSender<AgentEvent>, event: StreamEvent) {
    match event {
        StreamEvent::TextDelta { text } => {
            let _ = events.send(AgentEvent::TextDelta { content: text });
        }
        StreamEvent::ToolUseStart { .. } | StreamEvent::Done => {}
    }
}

fn wants_resume(input: &str) -> bool {
    let lowered = input.trim().to_lowercase();
    lowered.starts_with("resume") || lowered.starts_with("continue")
}

/// Parse the model's plan JSON, tolerating code fences and prose around
/// the object. Falls back to a single-task plan.
fn parse_plan(text: &str, fallback_goal: &str) -> Plan {
    #[derive(serde::Deserialize)]
    struct TaskSpec {
        id: Option<String>,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        depends_on: Vec<String>,
    }
    #[derive(serde::Deserialize)]
    struct PlanSpec {
        goal: Option<String>,
        tasks: Vec<TaskSpec>,
    }

    let start = text.find('{');
    let end = text.rfind('}');
    let parsed = match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str::<PlanSpec>(&text[s..=e]).ok(),
        _ => None,
    };

    match parsed {
        Some(parsed) if !parsed.tasks.is_empty() => {
            let tasks = parsed
                .tasks
                .into_iter()
                .enumerate()
                .map(|(i, t)| {
                    let id = t.id.unwrap_or_else(|| format!("t{}", i + 1));
                    Task::new(id, t.name, t.description).depends_on(t.depends_on)
                })
                .collect();
            Plan::new(parsed.goal.unwrap_or_else(|| fallback_goal.to_string()), tasks)
        }
        _ => {
            warn!("plan response was not parseable JSON, using single-task fallback");
            Plan::new(
                fallback_goal,
                vec![Task::new("t1", "complete the request", fallback_goal)],
            )
        }
    }
}
