//! Tools the ticket pipeline hands to its stages.

pub mod analyze_screenshot;
pub mod search_similar_tickets;

pub use analyze_screenshot::AnalyzeScreenshotTool;
pub use search_similar_tickets::SearchSimilarTicketsTool;

use serde_json::Value;
use triage_core::tools::ToolError;

/// Extract a required, non-empty string argument.
pub(crate) fn required_string(args: &Value, param: &str) -> Result<String, ToolError> {
    match args.get(param) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_) | Value::Null) | None => Err(ToolError::InvalidArguments(format!(
            "missing required parameter: {param}"
        ))),
        Some(_) => Err(ToolError::InvalidArguments(format!(
            "invalid type for parameter: {param} (expected string)"
        ))),
    }
}

pub(crate) fn optional_string(args: &Value, param: &str) -> Option<String> {
    args.get(param)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub(crate) fn optional_u64(args: &Value, param: &str) -> Option<u64> {
    args.get(param).and_then(Value::as_u64)
}
