//! A single model step with a bounded tool loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use triage_core::events::PipelineEvent;
use triage_core::hooks::HookDecision;
use triage_core::ids::SessionId;
use triage_core::messages::{Message, ToolCallBlock};
use triage_core::provider::{Completion, CompletionRequest, ModelProvider};
use triage_core::state::{Slot, State, StateDelta};
use triage_core::tools::{Tool, ToolContext, ToolResult};

use crate::approval::{Disposition, ResumeFeedback, ToolInvocationRecord};
use crate::emitter::Emitter;
use crate::error::EngineError;
use crate::governor::{Admission, GovernorKey, ToolCallGovernor};
use crate::hooks::{HookSet, Interceptor, SummarizationPolicy};
use crate::registry::ToolRegistry;
use crate::truncate::{truncate_output, MAX_TOOL_OUTPUT};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Collaborators shared by every stage of a session run.
#[derive(Clone)]
pub struct RunContext {
    pub provider: Arc<dyn ModelProvider>,
    pub governor: Arc<ToolCallGovernor>,
    pub emitter: Emitter,
    pub tool_timeout: Duration,
}

impl RunContext {
    pub fn new(provider: Arc<dyn ModelProvider>, governor: Arc<ToolCallGovernor>) -> Self {
        Self {
            provider,
            governor,
            emitter: Emitter::disabled(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }
}

/// Where a suspended stage stopped. Persisted with the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageCursor {
    pub stage: String,
    pub conversation: Vec<Message>,
    pub iteration: u32,
    /// The gated call awaiting a decision.
    pub pending: ToolCallBlock,
    /// Calls from the same model turn that come after `pending`.
    #[serde(default)]
    pub queued: Vec<ToolCallBlock>,
    #[serde(default)]
    pub captured: StateDelta,
    #[serde(default)]
    pub last_text: String,
    /// Governor count for this stage at suspension.
    #[serde(default)]
    pub dispatched: u32,
}

#[derive(Clone, Debug)]
pub enum StageOutcome {
    Completed { delta: StateDelta, truncated: bool },
    Suspended {
        cursor: StageCursor,
        invocation: ToolInvocationRecord,
    },
    Failed { error: String },
}

#[derive(Debug)]
pub struct StageRun {
    pub outcome: StageOutcome,
    /// Events emitted during this run, in order.
    pub events: Vec<PipelineEvent>,
}

struct LoopState {
    conversation: Vec<Message>,
    iteration: u32,
    captured: StateDelta,
    last_text: String,
}

struct Recorder<'a> {
    emitter: &'a Emitter,
    events: Vec<PipelineEvent>,
}

impl<'a> Recorder<'a> {
    fn new(emitter: &'a Emitter) -> Self {
        Self {
            emitter,
            events: Vec::new(),
        }
    }

    fn emit(&mut self, event: PipelineEvent) {
        self.emitter.emit(event.clone());
        self.events.push(event);
    }
}

pub struct Stage {
    name: String,
    instruction: String,
    tools: ToolRegistry,
    output: Slot,
    reads: Vec<Slot>,
    hooks: HookSet,
    tool_call_ceiling: Option<u32>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("reads", &self.reads)
            .field("tools", &self.tools)
            .finish()
    }
}

impl Stage {
    pub fn builder(name: impl Into<String>, output: Slot) -> StageBuilder {
        StageBuilder {
            name: name.into(),
            instruction: String::new(),
            tools: ToolRegistry::new(),
            output,
            reads: Vec::new(),
            hooks: HookSet::default(),
            tool_call_ceiling: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn output(&self) -> Slot {
        self.output
    }

    pub fn reads(&self) -> &[Slot] {
        &self.reads
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    /// Opening user message: every read slot present in the state, in order.
    pub fn render_input(&self, state: &State) -> String {
        let sections: Vec<String> = self
            .reads
            .iter()
            .filter_map(|slot| {
                state
                    .get(*slot)
                    .map(|value| format!("## {slot}\n{}", value.render()))
            })
            .collect();
        if sections.is_empty() {
            "(no input)".to_string()
        } else {
            sections.join("\n\n")
        }
    }

    pub async fn run(&self, session_id: &SessionId, state: &State, ctx: &RunContext) -> StageRun {
        let mut rec = Recorder::new(&ctx.emitter);
        rec.emit(PipelineEvent::StageStarted {
            session_id: session_id.clone(),
            stage: self.name.clone(),
        });
        debug!(stage = %self.name, session_id = %session_id, "stage started");

        let lp = LoopState {
            conversation: vec![Message::user_text(self.render_input(state))],
            iteration: 0,
            captured: StateDelta::new(),
            last_text: String::new(),
        };
        let outcome = self.drive(session_id, lp, VecDeque::new(), ctx, &mut rec).await;
        StageRun {
            outcome,
            events: rec.events,
        }
    }

    /// Continue a suspended stage with the reviewer's decision on its pending call.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        cursor: StageCursor,
        feedback: &ResumeFeedback,
        ctx: &RunContext,
    ) -> StageRun {
        let mut rec = Recorder::new(&ctx.emitter);
        ctx.governor
            .restore(&GovernorKey::new(session_id, &self.name), cursor.dispatched);

        let StageCursor {
            conversation,
            iteration,
            pending,
            queued,
            captured,
            last_text,
            ..
        } = cursor;
        let mut lp = LoopState {
            conversation,
            iteration,
            captured,
            last_text,
        };

        match feedback.disposition {
            Disposition::Rejected => {
                info!(stage = %self.name, tool = %pending.name, "tool call rejected");
                rec.emit(PipelineEvent::ToolRejected {
                    session_id: session_id.clone(),
                    stage: self.name.clone(),
                    invocation_id: pending.id.clone(),
                    tool: pending.name.clone(),
                });
                lp.conversation.push(Message::tool_result(
                    pending.id.clone(),
                    feedback.rejection_message(&pending.name),
                    true,
                ));
            }
            Disposition::Approved | Disposition::Pending => {
                let result = match &feedback.result {
                    Some(text) => {
                        self.announce(session_id, &pending, &mut rec);
                        ToolResult::text(text.clone())
                    }
                    None => {
                        let key = GovernorKey::new(session_id, &self.name);
                        if let Admission::Deny { ceiling } =
                            ctx.governor.admit(&key, self.tool_call_ceiling)
                        {
                            let outcome = self.deny(session_id, ceiling, lp, &mut rec);
                            return StageRun {
                                outcome,
                                events: rec.events,
                            };
                        }
                        let arguments = feedback
                            .arguments
                            .clone()
                            .unwrap_or_else(|| pending.arguments.clone());
                        self.execute(session_id, &pending, arguments, ctx, &mut rec)
                            .await
                    }
                };
                self.absorb(session_id, &pending, result, &mut lp, &mut rec);
            }
        }

        let outcome = self
            .drive(session_id, lp, queued.into(), ctx, &mut rec)
            .await;
        StageRun {
            outcome,
            events: rec.events,
        }
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        mut lp: LoopState,
        mut queued: VecDeque<ToolCallBlock>,
        ctx: &RunContext,
        rec: &mut Recorder<'_>,
    ) -> StageOutcome {
        let key = GovernorKey::new(session_id, &self.name);
        loop {
            while let Some(call) = queued.pop_front() {
                if let HookDecision::Suspend { description } = self.hooks.pre_dispatch(&call) {
                    let dispatched = ctx.governor.count(&key);
                    return self.suspend(session_id, lp, call, queued, description, dispatched, rec);
                }
                if let Admission::Deny { ceiling } = ctx.governor.admit(&key, self.tool_call_ceiling) {
                    return self.deny(session_id, ceiling, lp, rec);
                }
                let result = self
                    .execute(session_id, &call, call.arguments.clone(), ctx, rec)
                    .await;
                self.absorb(session_id, &call, result, &mut lp, rec);
            }

            lp.iteration += 1;
            self.hooks.pre_call(&self.name, &mut lp.conversation);
            let request = CompletionRequest {
                system: self.instruction.clone(),
                messages: lp.conversation.clone(),
                tools: self.tools.definitions(),
            };

            let completion = match ctx.provider.complete(&request).await {
                Ok(completion) => completion,
                Err(e) => {
                    warn!(stage = %self.name, error = %e, kind = e.error_kind(), "model call failed");
                    rec.emit(PipelineEvent::StageFailed {
                        session_id: session_id.clone(),
                        stage: self.name.clone(),
                        error: e.to_string(),
                    });
                    return StageOutcome::Failed {
                        error: e.to_string(),
                    };
                }
            };

            let text = completion.text();
            rec.emit(PipelineEvent::StageIteration {
                session_id: session_id.clone(),
                stage: self.name.clone(),
                iteration: lp.iteration,
                text: (!text.is_empty()).then(|| text.to_string()),
                tool_calls: match &completion {
                    Completion::ToolCalls { calls, .. } => {
                        calls.iter().map(|c| c.name.clone()).collect()
                    }
                    Completion::Final { .. } => Vec::new(),
                },
            });
            if !text.is_empty() {
                lp.last_text = text.to_string();
            }
            lp.conversation.push(Message::Assistant(completion.to_message()));

            match completion {
                Completion::ToolCalls { calls, .. } if !calls.is_empty() => queued.extend(calls),
                _ => return self.finish(session_id, lp, false, rec),
            }
        }
    }

    fn deny(
        &self,
        session_id: &SessionId,
        ceiling: u32,
        lp: LoopState,
        rec: &mut Recorder<'_>,
    ) -> StageOutcome {
        rec.emit(PipelineEvent::GovernorDenied {
            session_id: session_id.clone(),
            stage: self.name.clone(),
            ceiling,
        });
        self.finish(session_id, lp, true, rec)
    }

    fn announce(&self, session_id: &SessionId, call: &ToolCallBlock, rec: &mut Recorder<'_>) {
        rec.emit(PipelineEvent::ToolDispatched {
            session_id: session_id.clone(),
            stage: self.name.clone(),
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
        });
    }

    async fn execute(
        &self,
        session_id: &SessionId,
        call: &ToolCallBlock,
        arguments: serde_json::Value,
        ctx: &RunContext,
        rec: &mut Recorder<'_>,
    ) -> ToolResult {
        self.announce(session_id, call, rec);
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(stage = %self.name, tool = %call.name, "unknown tool requested");
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };

        let tool_ctx = ToolContext {
            session_id: session_id.clone(),
            stage: self.name.clone(),
        };
        let start = Instant::now();
        let outcome = tokio::time::timeout(
            ctx.tool_timeout,
            std::panic::AssertUnwindSafe(tool.execute(arguments, &tool_ctx)).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Ok(Ok(Ok(r))) => r,
            Ok(Ok(Err(e))) => ToolResult::error(e.to_string()),
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                ToolResult::error("internal error: tool crashed")
            }
            Err(_) => {
                warn!(
                    tool = %call.name,
                    timeout_secs = ctx.tool_timeout.as_secs(),
                    "tool timed out"
                );
                ToolResult::error(format!(
                    "tool timed out after {}s",
                    ctx.tool_timeout.as_secs()
                ))
            }
        };
        result.timed(start.elapsed())
    }

    fn absorb(
        &self,
        session_id: &SessionId,
        call: &ToolCallBlock,
        result: ToolResult,
        lp: &mut LoopState,
        rec: &mut Recorder<'_>,
    ) {
        self.hooks.post_tool_result(call, &result, &mut lp.captured);
        rec.emit(PipelineEvent::ToolCompleted {
            session_id: session_id.clone(),
            stage: self.name.clone(),
            tool_call_id: call.id.clone(),
            tool: call.name.clone(),
            is_error: result.is_error,
            duration_ms: result.elapsed_ms,
        });

        let content = truncate_output(&result.content, MAX_TOOL_OUTPUT);
        let content = if result.is_error {
            format!("[error] {content}")
        } else {
            content
        };
        lp.conversation
            .push(Message::tool_result(call.id.clone(), content, result.is_error));
    }

    #[allow(clippy::too_many_arguments)]
    fn suspend(
        &self,
        session_id: &SessionId,
        lp: LoopState,
        call: ToolCallBlock,
        queued: VecDeque<ToolCallBlock>,
        description: String,
        dispatched: u32,
        rec: &mut Recorder<'_>,
    ) -> StageOutcome {
        let invocation = ToolInvocationRecord::pending(&self.name, &call, description);
        info!(
            stage = %self.name,
            tool = %call.name,
            invocation_id = %call.id,
            "tool call awaiting approval"
        );
        rec.emit(PipelineEvent::ApprovalRequired {
            session_id: session_id.clone(),
            stage: self.name.clone(),
            invocation_id: invocation.invocation_id.clone(),
            tool: invocation.tool_name.clone(),
            arguments: invocation.arguments.clone(),
            description: invocation.description.clone(),
        });
        StageOutcome::Suspended {
            cursor: StageCursor {
                stage: self.name.clone(),
                conversation: lp.conversation,
                iteration: lp.iteration,
                pending: call,
                queued: queued.into(),
                captured: lp.captured,
                last_text: lp.last_text,
                dispatched,
            },
            invocation,
        }
    }

    fn finish(
        &self,
        session_id: &SessionId,
        lp: LoopState,
        truncated: bool,
        rec: &mut Recorder<'_>,
    ) -> StageOutcome {
        let mut delta = StateDelta::new();
        delta.set(self.output, lp.last_text.clone());
        self.hooks.pre_termination(lp.captured, self.output, &mut delta);

        info!(
            stage = %self.name,
            iterations = lp.iteration,
            truncated,
            "stage completed"
        );
        rec.emit(PipelineEvent::StageCompleted {
            session_id: session_id.clone(),
            stage: self.name.clone(),
            slot: self.output,
            output: lp.last_text,
            truncated,
        });
        StageOutcome::Completed { delta, truncated }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

pub struct StageBuilder {
    name: String,
    instruction: String,
    tools: ToolRegistry,
    output: Slot,
    reads: Vec<Slot>,
    hooks: HookSet,
    tool_call_ceiling: Option<u32>,
}

impl StageBuilder {
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn reads(mut self, slots: impl IntoIterator<Item = Slot>) -> Self {
        self.reads.extend(slots);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn hook(mut self, interceptor: Interceptor) -> Self {
        self.hooks.push(interceptor);
        self
    }

    pub fn summarization(self, policy: SummarizationPolicy) -> Self {
        self.hook(Interceptor::Summarization(policy))
    }

    pub fn approval_gate(self, tool: impl Into<String>, description: impl Into<String>) -> Self {
        self.hook(Interceptor::ApprovalGate {
            tool: tool.into(),
            description: description.into(),
        })
    }

    pub fn capture(self, tool: impl Into<String>, slot: Slot) -> Self {
        self.hook(Interceptor::CaptureDetails {
            tool: tool.into(),
            slot,
        })
    }

    pub fn tool_call_ceiling(mut self, ceiling: u32) -> Self {
        self.tool_call_ceiling = Some(ceiling);
        self
    }

    pub fn build(self) -> Result<Stage, EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidPipeline("stage name is empty".into()));
        }
        if self.output == Slot::Input {
            return Err(EngineError::InvalidPipeline(format!(
                "stage {} cannot write the input slot",
                self.name
            )));
        }
        for interceptor in self.hooks.iter() {
            if let Some(tool) = interceptor.tool() {
                if !self.tools.contains(tool) {
                    return Err(EngineError::InvalidPipeline(format!(
                        "stage {} hooks unknown tool {tool}",
                        self.name
                    )));
                }
            }
            if let Interceptor::CaptureDetails { slot: Slot::Input, .. } = interceptor {
                return Err(EngineError::InvalidPipeline(format!(
                    "stage {} cannot capture into the input slot",
                    self.name
                )));
            }
        }
        let reads = if self.reads.is_empty() {
            vec![Slot::Input]
        } else {
            self.reads
        };
        Ok(Stage {
            name: self.name,
            instruction: self.instruction,
            tools: self.tools,
            output: self.output,
            reads,
            hooks: self.hooks,
            tool_call_ceiling: self.tool_call_ceiling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingTool, EchoTool, FailingTool, PanicTool, SlowTool};
    use serde_json::json;
    use triage_core::errors::GatewayError;
    use triage_core::state::SlotValue;
    use triage_llm::{MockProvider, MockResponse};

    fn ctx(provider: Arc<MockProvider>) -> RunContext {
        RunContext::new(provider, Arc::new(ToolCallGovernor::default()))
    }

    fn echo_stage() -> Stage {
        Stage::builder("classifier", Slot::ClassificationResult)
            .instruction("Classify the ticket.")
            .tool(Arc::new(EchoTool))
            .build()
            .unwrap()
    }

    fn output(outcome: &StageOutcome) -> (&StateDelta, bool) {
        match outcome {
            StageOutcome::Completed { delta, truncated } => (delta, *truncated),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    fn last_tool_result(request: &CompletionRequest) -> String {
        match request.messages.last() {
            Some(Message::ToolResult(m)) => m.content.clone(),
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_text_fills_output_slot() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::text("BUG_REPORT")]));
        let state = State::with_input("app crashes");
        let run = echo_stage()
            .run(&SessionId::new(), &state, &ctx(provider.clone()))
            .await;

        let (delta, truncated) = output(&run.outcome);
        assert!(!truncated);
        assert_eq!(delta.get(Slot::ClassificationResult), Some(&SlotValue::from("BUG_REPORT")));

        let types: Vec<_> = run.events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["stage_started", "stage_iteration", "stage_completed"]);

        let req = &provider.requests()[0];
        assert_eq!(req.system, "Classify the ticket.");
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.messages, vec![Message::user_text("## input\napp crashes")]);
    }

    #[tokio::test]
    async fn tool_result_is_fed_back() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("echo", json!({"text": "hello"})),
            MockResponse::text("done"),
        ]));
        let run = echo_stage()
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider.clone()))
            .await;
        output(&run.outcome);

        assert_eq!(last_tool_result(&provider.requests()[1]), "hello");
        let types: Vec<_> = run.events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "stage_started",
                "stage_iteration",
                "tool_dispatched",
                "tool_completed",
                "stage_iteration",
                "stage_completed"
            ]
        );
    }

    #[tokio::test]
    async fn tool_error_goes_back_to_model() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("fail", json!({})),
            MockResponse::text("recovered"),
        ]));
        let stage = Stage::builder("s", Slot::RootCauseAnalysis)
            .tool(Arc::new(FailingTool))
            .build()
            .unwrap();
        let run = stage
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider.clone()))
            .await;

        let (delta, _) = output(&run.outcome);
        assert_eq!(delta.get(Slot::RootCauseAnalysis), Some(&SlotValue::from("recovered")));
        let fed_back = last_tool_result(&provider.requests()[1]);
        assert!(fed_back.starts_with("[error] "), "{fed_back}");
        assert!(fed_back.contains("backend unavailable"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("missing", json!({})),
            MockResponse::text("ok"),
        ]));
        let run = echo_stage()
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider.clone()))
            .await;
        output(&run.outcome);
        assert_eq!(
            last_tool_result(&provider.requests()[1]),
            "[error] unknown tool: missing"
        );
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("panic", json!({})),
            MockResponse::text("ok"),
        ]));
        let stage = Stage::builder("s", Slot::ImpactAssessment)
            .tool(Arc::new(PanicTool))
            .build()
            .unwrap();
        let run = stage
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider.clone()))
            .await;
        output(&run.outcome);
        assert_eq!(
            last_tool_result(&provider.requests()[1]),
            "[error] internal error: tool crashed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("slow", json!({})),
            MockResponse::text("ok"),
        ]));
        let stage = Stage::builder("s", Slot::SolutionProposal)
            .tool(Arc::new(SlowTool(Duration::from_secs(600))))
            .build()
            .unwrap();
        let ctx = ctx(provider.clone()).with_tool_timeout(Duration::from_secs(5));
        let run = stage.run(&SessionId::new(), &State::with_input("x"), &ctx).await;
        output(&run.outcome);
        assert_eq!(
            last_tool_result(&provider.requests()[1]),
            "[error] tool timed out after 5s"
        );
    }

    #[tokio::test]
    async fn governor_truncates_runaway_loop() {
        let thinking = || {
            MockResponse::Reply(Completion::ToolCalls {
                text: "still thinking".into(),
                calls: vec![ToolCallBlock {
                    id: triage_core::ids::ToolCallId::new(),
                    name: "count".into(),
                    arguments: json!({}),
                }],
            })
        };
        let provider = Arc::new(MockProvider::new(vec![thinking(), thinking(), thinking()]));
        let counter = Arc::new(CountingTool::default());
        let stage = Stage::builder("s", Slot::RootCauseAnalysis)
            .tool(counter.clone())
            .tool_call_ceiling(2)
            .build()
            .unwrap();
        let run = stage
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider.clone()))
            .await;

        let (delta, truncated) = output(&run.outcome);
        assert!(truncated);
        assert_eq!(counter.calls(), 2);
        assert_eq!(
            delta.get(Slot::RootCauseAnalysis),
            Some(&SlotValue::from("still thinking"))
        );
        assert!(run
            .events
            .iter()
            .any(|e| matches!(e, PipelineEvent::GovernorDenied { ceiling: 2, .. })));
    }

    #[tokio::test]
    async fn model_failure_fails_stage() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(
            GatewayError::ProviderOverloaded,
        )]));
        let run = echo_stage()
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider))
            .await;
        match run.outcome {
            StageOutcome::Failed { error } => assert!(error.contains("overloaded"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(run.events.last().unwrap().event_type(), "stage_failed");
    }

    #[tokio::test]
    async fn captured_details_land_in_their_slot() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("echo", json!({"text": "t"})),
            MockResponse::text("classified"),
        ]));
        let stage = Stage::builder("s", Slot::ClassificationResult)
            .tool(Arc::new(EchoTool))
            .capture("echo", Slot::SimilarTickets)
            .build()
            .unwrap();
        let run = stage
            .run(&SessionId::new(), &State::with_input("x"), &ctx(provider))
            .await;
        let (delta, _) = output(&run.outcome);
        assert_eq!(
            delta.get(Slot::SimilarTickets).and_then(|v| v.as_json()),
            Some(&json!({"echoed": "t"}))
        );
    }

    fn gated_stage(counter: Arc<CountingTool>) -> Stage {
        Stage::builder("s", Slot::ClassificationResult)
            .tool(counter)
            .approval_gate("count", "confirm the lookup")
            .build()
            .unwrap()
    }

    async fn suspend(stage: &Stage, sid: &SessionId, ctx: &RunContext) -> (StageCursor, ToolInvocationRecord) {
        let run = stage.run(sid, &State::with_input("x"), ctx).await;
        match run.outcome {
            StageOutcome::Suspended { cursor, invocation } => (cursor, invocation),
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gate_suspends_before_execution() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::tool_call_with_id(
            "call_1",
            "count",
            json!({"n": 1}),
        )]));
        let counter = Arc::new(CountingTool::default());
        let stage = gated_stage(counter.clone());
        let (cursor, invocation) = suspend(&stage, &SessionId::new(), &ctx(provider)).await;

        assert_eq!(counter.calls(), 0);
        assert_eq!(invocation.invocation_id.as_str(), "call_1");
        assert_eq!(invocation.description, "confirm the lookup");
        assert_eq!(cursor.pending.arguments, json!({"n": 1}));
        assert_eq!(cursor.dispatched, 0);
    }

    #[tokio::test]
    async fn approved_resume_executes_with_replacement_arguments() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call_with_id("call_1", "count", json!({"n": 1})),
            MockResponse::text("final"),
        ]));
        let counter = Arc::new(CountingTool::default());
        let stage = gated_stage(counter.clone());
        let sid = SessionId::new();
        let ctx = ctx(provider.clone());
        let (cursor, invocation) = suspend(&stage, &sid, &ctx).await;

        let feedback = ResumeFeedback::approve(invocation.invocation_id).with_arguments(json!({"n": 7}));
        let run = stage.resume(&sid, cursor, &feedback, &ctx).await;
        let (delta, _) = output(&run.outcome);
        assert_eq!(delta.get(Slot::ClassificationResult), Some(&SlotValue::from("final")));
        assert_eq!(counter.calls(), 1);
        assert_eq!(counter.last_args(), Some(json!({"n": 7})));
        assert_eq!(last_tool_result(&provider.requests()[1]), "counted 1");
    }

    #[tokio::test]
    async fn approved_resume_with_result_skips_execution() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("count", json!({})),
            MockResponse::text("final"),
        ]));
        let counter = Arc::new(CountingTool::default());
        let stage = gated_stage(counter.clone());
        let sid = SessionId::new();
        let ctx = ctx(provider.clone());
        let (cursor, invocation) = suspend(&stage, &sid, &ctx).await;

        let feedback = ResumeFeedback::approve(invocation.invocation_id).with_result("reviewer says 3");
        let run = stage.resume(&sid, cursor, &feedback, &ctx).await;
        output(&run.outcome);
        assert_eq!(counter.calls(), 0);
        assert_eq!(last_tool_result(&provider.requests()[1]), "reviewer says 3");
    }

    #[tokio::test]
    async fn rejected_resume_tells_the_model() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("count", json!({})),
            MockResponse::text("went without"),
        ]));
        let counter = Arc::new(CountingTool::default());
        let stage = gated_stage(counter.clone());
        let sid = SessionId::new();
        let ctx = ctx(provider.clone());
        let (cursor, invocation) = suspend(&stage, &sid, &ctx).await;

        let feedback = ResumeFeedback::reject(invocation.invocation_id, Some("too costly".into()));
        let run = stage.resume(&sid, cursor, &feedback, &ctx).await;
        let (delta, _) = output(&run.outcome);
        assert_eq!(delta.get(Slot::ClassificationResult), Some(&SlotValue::from("went without")));
        assert_eq!(counter.calls(), 0);
        let fed_back = last_tool_result(&provider.requests()[1]);
        assert!(fed_back.starts_with("[rejected]"));
        assert!(fed_back.contains("too costly"));
        assert!(run.events.iter().any(|e| e.event_type() == "tool_rejected"));
    }

    #[tokio::test]
    async fn approved_run_matches_ungated_run() {
        let script = || {
            vec![
                MockResponse::tool_call_with_id("call_1", "count", json!({})),
                MockResponse::text("same answer"),
            ]
        };

        let plain_provider = Arc::new(MockProvider::new(script()));
        let plain = Stage::builder("s", Slot::ClassificationResult)
            .tool(Arc::new(CountingTool::default()))
            .build()
            .unwrap();
        let plain_run = plain
            .run(&SessionId::new(), &State::with_input("x"), &ctx(plain_provider.clone()))
            .await;

        let gated_provider = Arc::new(MockProvider::new(script()));
        let gated = gated_stage(Arc::new(CountingTool::default()));
        let sid = SessionId::new();
        let gctx = ctx(gated_provider.clone());
        let (cursor, invocation) = suspend(&gated, &sid, &gctx).await;
        let gated_run = gated
            .resume(&sid, cursor, &ResumeFeedback::approve(invocation.invocation_id), &gctx)
            .await;

        assert_eq!(output(&plain_run.outcome).0, output(&gated_run.outcome).0);
        assert_eq!(
            plain_provider.requests()[1].messages,
            gated_provider.requests()[1].messages
        );
    }

    #[tokio::test]
    async fn rejected_call_uses_no_governor_slot() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("count", json!({})),
            MockResponse::text("went without"),
        ]));
        let stage = gated_stage(Arc::new(CountingTool::default()));
        let sid = SessionId::new();
        let ctx = ctx(provider);
        let (cursor, invocation) = suspend(&stage, &sid, &ctx).await;
        let key = GovernorKey::new(&sid, "s");
        assert_eq!(ctx.governor.count(&key), 0);

        let run = stage
            .resume(&sid, cursor, &ResumeFeedback::reject(invocation.invocation_id, None), &ctx)
            .await;
        output(&run.outcome);
        assert_eq!(ctx.governor.count(&key), 0);
    }

    #[tokio::test]
    async fn approved_call_is_admitted_on_resume() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("echo", json!({"text": "first"})),
            MockResponse::tool_call_with_id("call_2", "count", json!({})),
            MockResponse::text("unreachable"),
        ]));
        let counter = Arc::new(CountingTool::default());
        let stage = Stage::builder("s", Slot::ClassificationResult)
            .tool(Arc::new(EchoTool))
            .tool(counter.clone())
            .approval_gate("count", "confirm the lookup")
            .tool_call_ceiling(1)
            .build()
            .unwrap();
        let sid = SessionId::new();
        let ctx = ctx(provider.clone());
        let (cursor, invocation) = suspend(&stage, &sid, &ctx).await;
        assert_eq!(cursor.dispatched, 1);

        let run = stage
            .resume(&sid, cursor, &ResumeFeedback::approve(invocation.invocation_id), &ctx)
            .await;
        let (_, truncated) = output(&run.outcome);
        assert!(truncated);
        assert_eq!(counter.calls(), 0);
        assert_eq!(provider.call_count(), 2);
        assert!(run.events.iter().any(|e| e.event_type() == "governor_denied"));
    }

    #[tokio::test]
    async fn cursor_survives_serialization() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::tool_calls(vec![
            ("count", json!({"n": 1})),
            ("count", json!({"n": 2})),
        ])]));
        let stage = gated_stage(Arc::new(CountingTool::default()));
        let (cursor, _) = suspend(&stage, &SessionId::new(), &ctx(provider)).await;
        assert_eq!(cursor.queued.len(), 1);
        let json = serde_json::to_string(&cursor).unwrap();
        let back: StageCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cursor);
    }

    #[test]
    fn builder_rejects_bad_definitions() {
        assert!(Stage::builder("s", Slot::Input).build().is_err());
        assert!(Stage::builder("", Slot::FinalReport).build().is_err());
        assert!(Stage::builder("s", Slot::FinalReport)
            .approval_gate("ghost", "x")
            .build()
            .is_err());
    }

    #[test]
    fn render_input_uses_read_slots_in_order() {
        let stage = Stage::builder("s", Slot::FinalReport)
            .reads([Slot::ClassificationResult, Slot::Input, Slot::RootCauseAnalysis])
            .build()
            .unwrap();
        let mut state = State::with_input("ticket");
        state
            .insert(Slot::ClassificationResult, SlotValue::from("BUG_REPORT"))
            .unwrap();
        assert_eq!(
            stage.render_input(&state),
            "## classification_result\nBUG_REPORT\n\n## input\nticket"
        );
    }
}
