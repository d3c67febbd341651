//! `analyze_screenshot`: asks the model to describe the problem a feedback screenshot shows.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use triage_core::messages::Message;
use triage_core::provider::{CompletionRequest, ModelProvider};
use triage_core::tools::{Tool, ToolContext, ToolError, ToolResult};

use super::optional_string;

pub const TOOL_NAME: &str = "analyze_screenshot";

const PROMPT: &str = "Analyze the screenshot attached to the user's feedback. \
                      If an image is provided, describe the problem it shows.";

pub struct AnalyzeScreenshotTool {
    provider: Arc<dyn ModelProvider>,
}

impl AnalyzeScreenshotTool {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for AnalyzeScreenshotTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Analyze a screenshot from the user's feedback and extract the problem it shows."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "imageBase64": {
                    "type": "string",
                    "description": "Base64-encoded screenshot, or a reference to it"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let mut prompt = PROMPT.to_string();
        if let Some(image) = optional_string(&args, "imageBase64") {
            prompt.push_str(&format!("\n\nImage: {image}"));
        }
        let request = CompletionRequest {
            system: String::new(),
            messages: vec![Message::user_text(prompt)],
            tools: Vec::new(),
        };

        // A failed analysis is reported to the calling stage, not raised.
        match self.provider.complete(&request).await {
            Ok(completion) => Ok(ToolResult::text(completion.text())),
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "screenshot analysis failed");
                Ok(ToolResult::error(format!("Screenshot analysis failed: {e}")))
            }
        }
    }
}
