//! Tools shared by the engine's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use triage_core::tools::{Tool, ToolContext, ToolError, ToolResult};

fn object_schema() -> serde_json::Value {
    json!({"type": "object", "properties": {}})
}

/// Returns `args.text` and reports it as details.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input back"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("text is required".into()))?;
        Ok(ToolResult::text(text).with_details(json!({"echoed": text})))
    }
}

pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "fail"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        object_schema()
    }
    async fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        Err(ToolError::ExecutionFailed("backend unavailable".into()))
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }
    fn description(&self) -> &str {
        "Panics"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        object_schema()
    }
    async fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        panic!("tool exploded")
    }
}

pub struct SlowTool(pub Duration);

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Sleeps before answering"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        object_schema()
    }
    async fn execute(
        &self,
        _args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        tokio::time::sleep(self.0).await;
        Ok(ToolResult::text("finally"))
    }
}

/// Counts executions and remembers the last arguments.
#[derive(Default)]
pub struct CountingTool {
    calls: AtomicUsize,
    last_args: parking_lot::Mutex<Option<serde_json::Value>>,
}

impl CountingTool {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<serde_json::Value> {
        self.last_args.lock().clone()
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }
    fn description(&self) -> &str {
        "Counts its calls"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        object_schema()
    }
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_args.lock() = Some(args);
        Ok(ToolResult::text(format!("counted {n}")))
    }
}
