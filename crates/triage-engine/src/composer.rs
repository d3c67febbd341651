//! Step ordering: a sequence of stages, some of which fan out in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use triage_core::events::PipelineEvent;
use triage_core::ids::SessionId;
use triage_core::state::{Slot, State, StateDelta};

use crate::approval::{ResumeFeedback, ToolInvocationRecord};
use crate::error::EngineError;
use crate::session::{Session, SessionStatus, SessionStore, Suspension};
use crate::stage::{RunContext, Stage, StageCursor, StageOutcome};

/// Owner reported for slots that already existed before the fan-out.
pub const BASE_STATE_OWNER: &str = "(base state)";

/// The slots one branch produced, or why it produced none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchDelta {
    pub branch: String,
    pub delta: StateDelta,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BranchDelta {
    pub fn completed(branch: impl Into<String>, delta: StateDelta, truncated: bool) -> Self {
        Self {
            branch: branch.into(),
            delta,
            truncated,
            error: None,
        }
    }

    pub fn failed(branch: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            delta: StateDelta::new(),
            truncated: false,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub slot: Slot,
    pub kept_branch: String,
    pub discarded_branch: String,
}

impl MergeConflict {
    pub fn describe(&self) -> String {
        format!(
            "merge conflict on {}: kept {}, discarded {}",
            self.slot, self.kept_branch, self.discarded_branch
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
    pub state: State,
    pub conflicts: Vec<MergeConflict>,
}

/// Combines branch deltas into the post-fan-out state.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, base: &State, deltas: &[BranchDelta]) -> MergeOutcome;
}

/// Union in declaration order. The first writer of a slot wins; failed branches contribute nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMergeStrategy;

impl MergeStrategy for DefaultMergeStrategy {
    fn merge(&self, base: &State, deltas: &[BranchDelta]) -> MergeOutcome {
        let mut state = base.clone();
        let mut owners: HashMap<Slot, &str> = HashMap::new();
        let mut conflicts = Vec::new();

        for branch in deltas.iter().filter(|d| !d.is_failed()) {
            for (slot, value) in branch.delta.iter() {
                match state.insert(*slot, value.clone()) {
                    Ok(()) => {
                        owners.insert(*slot, branch.branch.as_str());
                    }
                    Err(_) => conflicts.push(MergeConflict {
                        slot: *slot,
                        kept_branch: owners
                            .get(slot)
                            .copied()
                            .unwrap_or(BASE_STATE_OWNER)
                            .to_string(),
                        discarded_branch: branch.branch.clone(),
                    }),
                }
            }
        }
        MergeOutcome { state, conflicts }
    }
}

/// Where one parallel branch stands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchState {
    Done(BranchDelta),
    Suspended {
        cursor: StageCursor,
        invocation: ToolInvocationRecord,
    },
}

impl BranchState {
    fn from_outcome(branch: &str, outcome: StageOutcome) -> Self {
        match outcome {
            StageOutcome::Completed { delta, truncated } => {
                BranchState::Done(BranchDelta::completed(branch, delta, truncated))
            }
            StageOutcome::Suspended { cursor, invocation } => {
                BranchState::Suspended { cursor, invocation }
            }
            StageOutcome::Failed { error } => BranchState::Done(BranchDelta::failed(branch, error)),
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, BranchState::Suspended { .. })
    }
}

/// A fan-out paused on one or more approvals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallelCheckpoint {
    /// The state every branch was given.
    pub snapshot: State,
    /// One entry per branch, in declaration order.
    pub branches: Vec<BranchState>,
}

impl ParallelCheckpoint {
    pub fn pending(&self) -> Vec<&ToolInvocationRecord> {
        self.branches
            .iter()
            .filter_map(|b| match b {
                BranchState::Suspended { invocation, .. } => Some(invocation),
                BranchState::Done(_) => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub enum ParallelOutcome {
    Completed {
        state: State,
        conflicts: Vec<MergeConflict>,
        /// (branch, error) for every failed branch.
        failures: Vec<(String, String)>,
        truncated: Vec<String>,
    },
    Suspended(ParallelCheckpoint),
}

pub struct ParallelComposer {
    name: String,
    branches: Vec<Arc<Stage>>,
    merge: Arc<dyn MergeStrategy>,
}

impl ParallelComposer {
    pub fn new(name: impl Into<String>, branches: Vec<Arc<Stage>>) -> Result<Self, EngineError> {
        let name = name.into();
        if branches.is_empty() {
            return Err(EngineError::InvalidPipeline(format!(
                "parallel step {name} has no branches"
            )));
        }
        Ok(Self {
            name,
            branches,
            merge: Arc::new(DefaultMergeStrategy),
        })
    }

    pub fn with_merge_strategy(mut self, merge: Arc<dyn MergeStrategy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn branches(&self) -> &[Arc<Stage>] {
        &self.branches
    }

    /// Run every branch on the same snapshot and wait for all of them.
    pub async fn run(&self, session_id: &SessionId, state: &State, ctx: &RunContext) -> ParallelOutcome {
        info!(step = %self.name, branches = self.branches.len(), "fan-out started");
        let snapshot = Arc::new(state.clone());
        let handles: Vec<_> = self
            .branches
            .iter()
            .map(|stage| {
                let stage = Arc::clone(stage);
                let snapshot = Arc::clone(&snapshot);
                let session_id = session_id.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { stage.run(&session_id, &snapshot, &ctx).await.outcome })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let branches = self
            .branches
            .iter()
            .zip(results)
            .map(|(stage, result)| match result {
                Ok(outcome) => BranchState::from_outcome(stage.name(), outcome),
                Err(e) => {
                    error!(step = %self.name, branch = %stage.name(), error = %e, "branch task failed");
                    BranchState::Done(BranchDelta::failed(stage.name(), format!("branch task failed: {e}")))
                }
            })
            .collect();

        self.settle(
            session_id,
            ParallelCheckpoint {
                snapshot: state.clone(),
                branches,
            },
            ctx,
        )
    }

    /// Continue the branch owning `feedback.invocation_id`. Other suspended branches stay put.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        mut checkpoint: ParallelCheckpoint,
        feedback: &ResumeFeedback,
        ctx: &RunContext,
    ) -> Result<ParallelOutcome, EngineError> {
        if checkpoint.branches.len() != self.branches.len() {
            return Err(EngineError::InvalidPipeline(format!(
                "checkpoint has {} branches, step {} has {}",
                checkpoint.branches.len(),
                self.name,
                self.branches.len()
            )));
        }
        let idx = checkpoint
            .branches
            .iter()
            .position(|b| {
                matches!(b, BranchState::Suspended { invocation, .. }
                    if invocation.invocation_id == feedback.invocation_id)
            })
            .ok_or_else(|| EngineError::UnknownInvocation {
                session_id: session_id.clone(),
                invocation_id: feedback.invocation_id.clone(),
            })?;

        let stage = &self.branches[idx];
        let BranchState::Suspended { cursor, .. } = checkpoint.branches.remove(idx) else {
            return Err(EngineError::Internal("branch lost its cursor".into()));
        };
        let outcome = stage.resume(session_id, cursor, feedback, ctx).await.outcome;
        checkpoint
            .branches
            .insert(idx, BranchState::from_outcome(stage.name(), outcome));
        Ok(self.settle(session_id, checkpoint, ctx))
    }

    fn settle(&self, session_id: &SessionId, checkpoint: ParallelCheckpoint, ctx: &RunContext) -> ParallelOutcome {
        if checkpoint.branches.iter().any(BranchState::is_suspended) {
            return ParallelOutcome::Suspended(checkpoint);
        }

        let deltas: Vec<BranchDelta> = checkpoint
            .branches
            .into_iter()
            .filter_map(|b| match b {
                BranchState::Done(delta) => Some(delta),
                BranchState::Suspended { .. } => None,
            })
            .collect();
        let merged = self.merge.merge(&checkpoint.snapshot, &deltas);

        for conflict in &merged.conflicts {
            warn!(
                step = %self.name,
                slot = %conflict.slot,
                kept = %conflict.kept_branch,
                discarded = %conflict.discarded_branch,
                "merge conflict"
            );
            ctx.emitter.emit(PipelineEvent::MergeConflict {
                session_id: session_id.clone(),
                slot: conflict.slot,
                kept_branch: conflict.kept_branch.clone(),
                discarded_branch: conflict.discarded_branch.clone(),
            });
        }

        ParallelOutcome::Completed {
            state: merged.state,
            conflicts: merged.conflicts,
            failures: deltas
                .iter()
                .filter_map(|d| d.error.clone().map(|e| (d.branch.clone(), e)))
                .collect(),
            truncated: deltas
                .iter()
                .filter(|d| d.truncated)
                .map(|d| d.branch.clone())
                .collect(),
        }
    }
}

pub enum Step {
    Stage(Arc<Stage>),
    Parallel(ParallelComposer),
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Stage(stage) => stage.name(),
            Step::Parallel(parallel) => parallel.name(),
        }
    }

    pub fn stages(&self) -> Vec<&Arc<Stage>> {
        match self {
            Step::Stage(stage) => vec![stage],
            Step::Parallel(parallel) => parallel.branches().iter().collect(),
        }
    }
}

/// Runs steps in declared order, threading the session state through them.
pub struct SequentialComposer {
    name: String,
    steps: Vec<Step>,
}

impl SequentialComposer {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, EngineError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(EngineError::InvalidPipeline(format!("pipeline {name} has no steps")));
        }
        let mut seen = HashSet::new();
        for stage in steps.iter().flat_map(Step::stages) {
            if !seen.insert(stage.name().to_string()) {
                return Err(EngineError::InvalidPipeline(format!(
                    "duplicate stage name {} in pipeline {name}",
                    stage.name()
                )));
            }
        }
        Ok(Self { name, steps })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run from `session.position` until the pipeline ends, fails, or suspends.
    /// The session is saved after every step.
    pub async fn run(
        &self,
        session: &mut Session,
        ctx: &RunContext,
        store: &dyn SessionStore,
    ) -> Result<(), EngineError> {
        while session.status == SessionStatus::Running {
            let Some(step) = self.steps.get(session.position) else {
                session.status = SessionStatus::Completed;
                session.touch();
                store.save(session)?;
                break;
            };
            match step {
                Step::Stage(stage) => {
                    let run = stage.run(&session.id, &session.state, ctx).await;
                    apply_stage(session, stage, run.outcome);
                }
                Step::Parallel(parallel) => {
                    let outcome = parallel.run(&session.id, &session.state, ctx).await;
                    apply_parallel(session, parallel, outcome);
                }
            }
            session.touch();
            store.save(session)?;
        }
        Ok(())
    }

    /// Feed a decision into the suspended step, then keep running.
    pub async fn resume(
        &self,
        session: &mut Session,
        feedback: &ResumeFeedback,
        ctx: &RunContext,
        store: &dyn SessionStore,
    ) -> Result<(), EngineError> {
        let step = self.steps.get(session.position).ok_or_else(|| {
            EngineError::InvalidPipeline(format!(
                "session {} points past the end of pipeline {}",
                session.id, self.name
            ))
        })?;
        let mut suspension = session.suspension.take().ok_or_else(|| EngineError::NotSuspended {
            session_id: session.id.clone(),
            status: session.status.to_string(),
        })?;
        let resolved = suspension
            .pending_mut(&feedback.invocation_id)
            .map(|record| record.resolve(feedback.disposition).map(|()| record.clone()));
        match resolved {
            Some(Ok(record)) => session.approvals.push(record),
            Some(Err(e)) => {
                session.suspension = Some(suspension);
                return Err(e);
            }
            None => {
                session.suspension = Some(suspension);
                return Err(EngineError::UnknownInvocation {
                    session_id: session.id.clone(),
                    invocation_id: feedback.invocation_id.clone(),
                });
            }
        }

        session.status = SessionStatus::Running;
        session.suspended_at = None;
        match (step, suspension) {
            (Step::Stage(stage), Suspension::Stage { cursor, .. }) => {
                let run = stage.resume(&session.id, cursor, feedback, ctx).await;
                apply_stage(session, stage, run.outcome);
            }
            (Step::Parallel(parallel), Suspension::Parallel { checkpoint }) => {
                let outcome = parallel.resume(&session.id, checkpoint, feedback, ctx).await?;
                apply_parallel(session, parallel, outcome);
            }
            _ => {
                return Err(EngineError::InvalidPipeline(format!(
                    "continuation of session {} does not match step {}",
                    session.id,
                    step.name()
                )))
            }
        }
        session.touch();
        store.save(session)?;
        self.run(session, ctx, store).await
    }
}

fn apply_stage(session: &mut Session, stage: &Stage, outcome: StageOutcome) {
    match outcome {
        StageOutcome::Completed { delta, truncated } => {
            if truncated {
                session.truncated_stages.push(stage.name().to_string());
            }
            for slot in session.state.apply(delta) {
                warn!(stage = %stage.name(), slot = %slot, "slot already written; keeping first value");
                session
                    .warnings
                    .push(format!("stage {} tried to overwrite {slot}", stage.name()));
            }
            session.position += 1;
        }
        StageOutcome::Suspended { cursor, invocation } => {
            session.suspend(Suspension::Stage { cursor, invocation });
        }
        StageOutcome::Failed { error } => {
            session.fail(format!("stage {} failed: {error}", stage.name()));
        }
    }
}

fn apply_parallel(session: &mut Session, parallel: &ParallelComposer, outcome: ParallelOutcome) {
    match outcome {
        ParallelOutcome::Completed {
            state,
            conflicts,
            failures,
            truncated,
        } => {
            session.state = state;
            session
                .warnings
                .extend(conflicts.iter().map(MergeConflict::describe));
            session.truncated_stages.extend(truncated);
            if failures.is_empty() {
                session.position += 1;
            } else {
                let detail: Vec<String> = failures
                    .iter()
                    .map(|(branch, error)| format!("{branch}: {error}"))
                    .collect();
                session.fail(format!(
                    "parallel step {} failed: {}",
                    parallel.name(),
                    detail.join("; ")
                ));
            }
        }
        ParallelOutcome::Suspended(checkpoint) => {
            session.suspend(Suspension::Parallel { checkpoint });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::Disposition;
    use crate::governor::ToolCallGovernor;
    use crate::session::InMemorySessionStore;
    use crate::testing::CountingTool;
    use serde_json::json;
    use std::time::Duration;
    use triage_core::errors::GatewayError;
    use triage_core::state::SlotValue;
    use triage_llm::{MockProvider, MockResponse};

    fn stage(name: &str, instruction: &str, output: Slot) -> Arc<Stage> {
        Arc::new(
            Stage::builder(name, output)
                .instruction(instruction)
                .build()
                .unwrap(),
        )
    }

    fn ctx(provider: MockProvider) -> RunContext {
        RunContext::new(Arc::new(provider), Arc::new(ToolCallGovernor::default()))
    }

    fn text(state: &State, slot: Slot) -> Option<&str> {
        state.text(slot)
    }

    #[test]
    fn merge_first_declared_wins() {
        let mut base = State::with_input("in");
        base.insert(Slot::StructuredTicket, SlotValue::from("base")).unwrap();

        let mut a = StateDelta::new();
        a.set(Slot::RootCauseAnalysis, "from a");
        let mut b = StateDelta::new();
        b.set(Slot::RootCauseAnalysis, "from b");
        b.set(Slot::ImpactAssessment, "impact");
        b.set(Slot::StructuredTicket, "clobber");

        let outcome = DefaultMergeStrategy.merge(
            &base,
            &[
                BranchDelta::completed("a", a, false),
                BranchDelta::completed("b", b, false),
            ],
        );
        assert_eq!(text(&outcome.state, Slot::RootCauseAnalysis), Some("from a"));
        assert_eq!(text(&outcome.state, Slot::ImpactAssessment), Some("impact"));
        assert_eq!(text(&outcome.state, Slot::StructuredTicket), Some("base"));
        assert_eq!(
            outcome.conflicts,
            vec![
                MergeConflict {
                    slot: Slot::StructuredTicket,
                    kept_branch: BASE_STATE_OWNER.into(),
                    discarded_branch: "b".into(),
                },
                MergeConflict {
                    slot: Slot::RootCauseAnalysis,
                    kept_branch: "a".into(),
                    discarded_branch: "b".into(),
                },
            ]
        );
    }

    #[test]
    fn merge_skips_failed_branches() {
        let mut ok = StateDelta::new();
        ok.set(Slot::SolutionProposal, "fix");
        let outcome = DefaultMergeStrategy.merge(
            &State::new(),
            &[
                BranchDelta::failed("broken", "boom"),
                BranchDelta::completed("ok", ok, false),
            ],
        );
        assert_eq!(text(&outcome.state, Slot::SolutionProposal), Some("fix"));
        assert!(outcome.conflicts.is_empty());
    }

    #[tokio::test]
    async fn sequential_threads_state_between_steps() {
        let provider = MockProvider::routed(vec![
            ("first stage", vec![MockResponse::text("structured")]),
            ("second stage", vec![MockResponse::text("classified")]),
        ]);
        let first = stage("first", "first stage", Slot::StructuredTicket);
        let second = Arc::new(
            Stage::builder("second", Slot::ClassificationResult)
                .instruction("second stage")
                .reads([Slot::StructuredTicket])
                .build()
                .unwrap(),
        );
        let pipeline =
            SequentialComposer::new("p", vec![Step::Stage(first), Step::Stage(second)]).unwrap();
        let ctx = ctx(provider);
        let store = InMemorySessionStore::new();
        let mut session = Session::new(SessionId::new(), "p", "raw");

        pipeline.run(&mut session, &ctx, &store).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.position, 2);
        assert_eq!(text(&session.state, Slot::ClassificationResult), Some("classified"));
        assert_eq!(store.load(&session.id).unwrap().unwrap(), session);
    }

    #[tokio::test]
    async fn stage_failure_halts_and_keeps_state() {
        let provider = MockProvider::routed(vec![
            ("first stage", vec![MockResponse::text("structured")]),
            ("second stage", vec![MockResponse::Error(GatewayError::ProviderOverloaded)]),
            ("third stage", vec![MockResponse::text("never")]),
        ]);
        let pipeline = SequentialComposer::new(
            "p",
            vec![
                Step::Stage(stage("first", "first stage", Slot::StructuredTicket)),
                Step::Stage(stage("second", "second stage", Slot::ClassificationResult)),
                Step::Stage(stage("third", "third stage", Slot::FinalReport)),
            ],
        )
        .unwrap();
        let store = InMemorySessionStore::new();
        let mut session = Session::new(SessionId::new(), "p", "raw");
        pipeline.run(&mut session, &ctx(provider), &store).await.unwrap();

        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.position, 1);
        assert!(session.error.as_deref().unwrap().contains("second"));
        assert_eq!(text(&session.state, Slot::StructuredTicket), Some("structured"));
        assert!(!session.state.contains(Slot::FinalReport));
    }

    #[tokio::test]
    async fn parallel_branches_see_same_snapshot() {
        let provider = Arc::new(MockProvider::routed(vec![
            ("root cause", vec![MockResponse::delayed(Duration::from_millis(20), MockResponse::text("rc"))]),
            ("impact", vec![MockResponse::text("im")]),
            ("solution", vec![MockResponse::text("so")]),
        ]));
        let parallel = ParallelComposer::new(
            "deep",
            vec![
                stage("rc", "root cause", Slot::RootCauseAnalysis),
                stage("im", "impact", Slot::ImpactAssessment),
                stage("so", "solution", Slot::SolutionProposal),
            ],
        )
        .unwrap();
        let ctx = RunContext::new(provider.clone(), Arc::new(ToolCallGovernor::default()));
        let outcome = parallel
            .run(&SessionId::new(), &State::with_input("ticket"), &ctx)
            .await;

        match outcome {
            ParallelOutcome::Completed { state, conflicts, failures, .. } => {
                assert!(conflicts.is_empty());
                assert!(failures.is_empty());
                assert_eq!(text(&state, Slot::RootCauseAnalysis), Some("rc"));
                assert_eq!(text(&state, Slot::ImpactAssessment), Some("im"));
                assert_eq!(text(&state, Slot::SolutionProposal), Some("so"));
            }
            other => panic!("unexpected {other:?}"),
        }
        for request in provider.requests() {
            assert_eq!(request.messages[0], triage_core::messages::Message::user_text("## input\nticket"));
        }
    }

    #[tokio::test]
    async fn failed_branch_fails_session_after_merging_siblings() {
        let provider = MockProvider::routed(vec![
            ("root cause", vec![MockResponse::Error(GatewayError::NetworkError("reset".into()))]),
            ("impact", vec![MockResponse::text("im")]),
        ]);
        let parallel = ParallelComposer::new(
            "deep",
            vec![
                stage("rc", "root cause", Slot::RootCauseAnalysis),
                stage("im", "impact", Slot::ImpactAssessment),
            ],
        )
        .unwrap();
        let pipeline = SequentialComposer::new("p", vec![Step::Parallel(parallel)]).unwrap();
        let store = InMemorySessionStore::new();
        let mut session = Session::new(SessionId::new(), "p", "raw");
        pipeline.run(&mut session, &ctx(provider), &store).await.unwrap();

        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.as_deref().unwrap().contains("rc: "));
        assert_eq!(text(&session.state, Slot::ImpactAssessment), Some("im"));
    }

    #[tokio::test]
    async fn panicking_branch_becomes_failed_delta() {
        // Model-call panics escape the stage and surface at the task boundary.
        struct Exploding;
        #[async_trait::async_trait]
        impl triage_core::provider::ModelProvider for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn model(&self) -> &str {
                "x"
            }
            async fn complete(
                &self,
                request: &triage_core::provider::CompletionRequest,
            ) -> Result<triage_core::provider::Completion, GatewayError> {
                if request.system == "explode" {
                    panic!("provider exploded");
                }
                Ok(triage_core::provider::Completion::Final { text: "fine".into() })
            }
        }

        let parallel = ParallelComposer::new(
            "deep",
            vec![
                stage("boom", "explode", Slot::RootCauseAnalysis),
                stage("calm", "stay calm", Slot::ImpactAssessment),
            ],
        )
        .unwrap();
        let ctx = RunContext::new(Arc::new(Exploding), Arc::new(ToolCallGovernor::default()));
        match parallel.run(&SessionId::new(), &State::new(), &ctx).await {
            ParallelOutcome::Completed { state, failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "boom");
                assert_eq!(text(&state, Slot::ImpactAssessment), Some("fine"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflicts_become_warnings_and_events() {
        let provider = MockProvider::routed(vec![
            ("writer one", vec![MockResponse::text("one")]),
            ("writer two", vec![MockResponse::text("two")]),
        ]);
        let parallel = ParallelComposer::new(
            "dup",
            vec![
                stage("one", "writer one", Slot::RootCauseAnalysis),
                stage("two", "writer two", Slot::RootCauseAnalysis),
            ],
        )
        .unwrap();
        let pipeline = SequentialComposer::new("p", vec![Step::Parallel(parallel)]).unwrap();
        let (emitter, stream) = crate::emitter::Emitter::channel();
        let ctx = ctx(provider).with_emitter(emitter);
        let store = InMemorySessionStore::new();
        let mut session = Session::new(SessionId::new(), "p", "raw");
        pipeline.run(&mut session, &ctx, &store).await.unwrap();
        drop(ctx);

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(text(&session.state, Slot::RootCauseAnalysis), Some("one"));
        assert_eq!(session.warnings.len(), 1);

        use futures::StreamExt;
        let events: Vec<_> = stream.collect().await;
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::MergeConflict { kept_branch, discarded_branch, .. }
                if kept_branch == "one" && discarded_branch == "two"
        )));
    }

    #[tokio::test]
    async fn suspended_branch_resumes_and_merges() {
        let provider = MockProvider::routed(vec![
            (
                "gated branch",
                vec![
                    MockResponse::tool_call_with_id("call_g", "count", json!({})),
                    MockResponse::text("after approval"),
                ],
            ),
            ("free branch", vec![MockResponse::text("free")]),
        ]);
        let gated = Arc::new(
            Stage::builder("gated", Slot::RootCauseAnalysis)
                .instruction("gated branch")
                .tool(Arc::new(CountingTool::default()))
                .approval_gate("count", "confirm")
                .build()
                .unwrap(),
        );
        let parallel = ParallelComposer::new(
            "deep",
            vec![gated, stage("free", "free branch", Slot::ImpactAssessment)],
        )
        .unwrap();
        let pipeline = SequentialComposer::new("p", vec![Step::Parallel(parallel)]).unwrap();
        let ctx = ctx(provider);
        let store = InMemorySessionStore::new();
        let mut session = Session::new(SessionId::new(), "p", "raw");

        pipeline.run(&mut session, &ctx, &store).await.unwrap();
        assert_eq!(session.status, SessionStatus::AwaitingApproval);
        assert_eq!(session.position, 0);
        assert!(!session.state.contains(Slot::ImpactAssessment));
        let pending = session.pending_invocations();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].invocation_id.as_str(), "call_g");

        let feedback = ResumeFeedback::approve(pending[0].invocation_id.clone());
        pipeline.resume(&mut session, &feedback, &ctx, &store).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(text(&session.state, Slot::RootCauseAnalysis), Some("after approval"));
        assert_eq!(text(&session.state, Slot::ImpactAssessment), Some("free"));
        assert_eq!(session.approvals.len(), 1);
        assert_eq!(session.approvals[0].disposition, Disposition::Approved);
    }

    #[test]
    fn pipeline_validation() {
        assert!(SequentialComposer::new("p", vec![]).is_err());
        assert!(ParallelComposer::new("x", vec![]).is_err());
        let dup = SequentialComposer::new(
            "p",
            vec![
                Step::Stage(stage("a", "", Slot::FinalReport)),
                Step::Stage(stage("a", "", Slot::RootCauseAnalysis)),
            ],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn checkpoint_serde() {
        let checkpoint = ParallelCheckpoint {
            snapshot: State::with_input("x"),
            branches: vec![
                BranchState::Done(BranchDelta::failed("a", "boom")),
                BranchState::Done(BranchDelta::completed("b", StateDelta::new(), true)),
            ],
        };
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["branches"][0]["state"], "done");
        let back: ParallelCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
