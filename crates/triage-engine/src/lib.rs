//! Orchestration engine: stages with bounded tool loops, sequential and
//! parallel composition, suspend/resume around human approval, and the
//! ticket analysis pipeline built from them.

pub mod approval;
pub mod composer;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod governor;
pub mod hooks;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod stage;
pub mod tools;
pub mod truncate;

#[cfg(test)]
mod testing;

pub use approval::{Disposition, ResumeFeedback, ToolInvocationRecord};
pub use composer::{
    DefaultMergeStrategy, MergeConflict, MergeStrategy, ParallelComposer, SequentialComposer, Step,
};
pub use emitter::{Emitter, EventStream};
pub use engine::{Engine, EngineConfig, EvictionReport, Invocation};
pub use error::EngineError;
pub use governor::{Admission, GovernorKey, ToolCallGovernor};
pub use hooks::{Interceptor, SummarizationPolicy};
pub use pipeline::{ticket_analysis, PipelineOptions};
pub use session::{InMemorySessionStore, Session, SessionStatus, SessionStore, SqliteSessionStore};
pub use stage::{RunContext, Stage, StageOutcome};
