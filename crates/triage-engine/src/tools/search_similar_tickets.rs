//! `search_similar_tickets`: nearest historical tickets from the similarity index.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use triage_core::ticket::SimilarTicket;
use triage_core::tools::{Tool, ToolContext, ToolError, ToolResult};
use triage_index::{ScoredRecord, SimilarityIndex};

use super::{optional_u64, required_string};
use crate::truncate::excerpt;

pub const TOOL_NAME: &str = "search_similar_tickets";
pub const DEFAULT_SEARCH_TOP_K: usize = 5;
const MAX_TOP_K: usize = 20;
const EXCERPT_CHARS: usize = 200;
const SEPARATOR: &str = "\n---\n";

pub struct SearchSimilarTicketsTool {
    index: Arc<SimilarityIndex>,
    top_k: usize,
}

impl SearchSimilarTicketsTool {
    pub fn new(index: Arc<SimilarityIndex>) -> Self {
        Self {
            index,
            top_k: DEFAULT_SEARCH_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.clamp(1, MAX_TOP_K);
        self
    }
}

fn meta<'a>(hit: &'a ScoredRecord, key: &str) -> Option<&'a str> {
    hit.record.meta_str(key).filter(|s| !s.trim().is_empty())
}

fn format_hit(hit: &ScoredRecord) -> String {
    let mut out = format!("Ticket ID: {}", meta(hit, "ticketId").unwrap_or("N/A"));
    if let Some(request) = meta(hit, "userRequest") {
        out.push_str(&format!("\nUser request: {request}"));
    }
    let problem = meta(hit, "problemDescription").unwrap_or(&hit.record.text);
    if !problem.trim().is_empty() {
        out.push_str(&format!("\nProblem description: {problem}"));
    }
    out.push_str(&format!("\nSimilarity: {:.2}%", hit.score * 100.0));
    if let Some(time) = meta(hit, "feedbackTime") {
        out.push_str(&format!("\nFeedback time: {time}"));
    }
    if let Some(model) = meta(hit, "phoneModel") {
        out.push_str(&format!("\nPhone model: {model}"));
    }
    out
}

fn to_similar_ticket(hit: &ScoredRecord) -> SimilarTicket {
    SimilarTicket {
        ticket_id: meta(hit, "ticketId")
            .map(String::from)
            .unwrap_or_else(|| hit.record.id.to_string()),
        excerpt: excerpt(&hit.record.text, EXCERPT_CHARS),
        problem_description: meta(hit, "problemDescription").map(String::from),
        similarity: hit.score,
    }
}

#[async_trait]
impl Tool for SearchSimilarTicketsTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the history of support tickets for ones similar to the given problem. \
         Returns ticket ids, requests, descriptions, and similarity scores."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Problem description to match against past tickets"
                },
                "topK": {
                    "type": "integer",
                    "description": "Maximum number of tickets to return",
                    "minimum": 1,
                    "maximum": MAX_TOP_K
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let query = required_string(&args, "query")?;
        let top_k = optional_u64(&args, "topK")
            .map_or(self.top_k, |k| usize::try_from(k).unwrap_or(MAX_TOP_K))
            .clamp(1, MAX_TOP_K);

        let hits = self
            .index
            .query(&query, top_k)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("similarity search failed: {e}")))?;
        debug!(session_id = %ctx.session_id, hits = hits.len(), top_k, "similar tickets searched");

        let tickets: Vec<SimilarTicket> = hits.iter().map(to_similar_ticket).collect();
        let content = if hits.is_empty() {
            "No similar tickets found.".to_string()
        } else {
            hits.iter().map(format_hit).collect::<Vec<_>>().join(SEPARATOR)
        };
        let details = serde_json::to_value(&tickets)
            .map_err(|e| ToolError::ExecutionFailed(format!("encode results: {e}")))?;
        Ok(ToolResult::text(content).with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_core::ids::SessionId;
    use triage_core::ticket::FeedbackTicket;
    use triage_llm::MockEmbedder;

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: SessionId::from_raw("sess_1"),
            stage: "ticket_classifier".into(),
        }
    }

    fn ticket(id: &str, request: &str, problem: &str) -> FeedbackTicket {
        FeedbackTicket {
            ticket_id: Some(id.into()),
            user_request: request.into(),
            problem_description: problem.into(),
            phone_model: Some("Pixel 8".into()),
            ..Default::default()
        }
    }

    async fn seeded_index() -> Arc<SimilarityIndex> {
        let index = Arc::new(SimilarityIndex::new(Arc::new(MockEmbedder::new(128))));
        for t in [
            ticket("T-1", "cannot log in", "login screen crashes after update"),
            ticket("T-2", "dark mode", "please add a dark theme"),
        ] {
            index.ingest(&t.document_text(), t.index_metadata()).await.unwrap();
        }
        index
    }

    #[tokio::test]
    async fn formats_hits_and_reports_details() {
        let index = seeded_index().await;
        let query = ticket("T-1", "cannot log in", "login screen crashes after update").document_text();
        let tool = SearchSimilarTicketsTool::new(index);

        let result = tool.execute(json!({"query": query, "topK": 1}), &ctx()).await.unwrap();
        assert!(!result.is_error);
        assert!(result.content.starts_with("Ticket ID: T-1"));
        assert!(result.content.contains("User request: cannot log in"));
        assert!(result.content.contains("Problem description: login screen crashes after update"));
        assert!(result.content.contains("Similarity: 100.00%"));
        assert!(result.content.contains("Phone model: Pixel 8"));
        assert!(!result.content.contains(SEPARATOR));

        let tickets: Vec<SimilarTicket> = serde_json::from_value(result.details.unwrap()).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].ticket_id, "T-1");
        assert!((tickets[0].similarity - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn multiple_hits_are_separated() {
        let tool = SearchSimilarTicketsTool::new(seeded_index().await);
        let result = tool.execute(json!({"query": "login dark"}), &ctx()).await.unwrap();
        assert_eq!(result.content.matches(SEPARATOR).count(), 1);
    }

    #[tokio::test]
    async fn empty_index_reports_no_matches() {
        let index = Arc::new(SimilarityIndex::new(Arc::new(MockEmbedder::new(16))));
        let tool = SearchSimilarTicketsTool::new(index);
        let result = tool.execute(json!({"query": "anything"}), &ctx()).await.unwrap();
        assert_eq!(result.content, "No similar tickets found.");
        assert_eq!(result.details, Some(json!([])));
    }

    #[tokio::test]
    async fn query_is_required() {
        let tool = SearchSimilarTicketsTool::new(seeded_index().await);
        let err = tool.execute(json!({}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn top_k_is_clamped() {
        let index = Arc::new(SimilarityIndex::new(Arc::new(MockEmbedder::new(16))));
        assert_eq!(SearchSimilarTicketsTool::new(index.clone()).with_top_k(0).top_k, 1);
        assert_eq!(SearchSimilarTicketsTool::new(index).with_top_k(99).top_k, MAX_TOP_K);
    }
}
