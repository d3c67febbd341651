//! Fixtures shared by the server's unit tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use triage_core::provider::ModelProvider;
use triage_engine::pipeline::{ticket_analysis, PipelineOptions};
use triage_engine::{Engine, EngineConfig, SqliteSessionStore};
use triage_index::SimilarityIndex;
use triage_llm::{MockEmbedder, MockProvider, MockResponse};
use triage_store::{Database, TicketRepo};

use crate::service::TicketService;

/// Scripts one ticket through the pipeline, with the classifier asking for a
/// similarity search under the id `call_1`.
pub fn gated_provider() -> Arc<MockProvider> {
    Arc::new(MockProvider::routed(vec![
        ("ticket intake", vec![MockResponse::text("structured ticket")]),
        (
            "classification expert",
            vec![
                MockResponse::tool_call_with_id(
                    "call_1",
                    "search_similar_tickets",
                    json!({"query": "login crash"}),
                ),
                MockResponse::text("BUG_REPORT"),
            ],
        ),
        ("root cause analyst", vec![MockResponse::text("root cause")]),
        ("impact assessor", vec![MockResponse::text("impact")]),
        ("solution provider", vec![MockResponse::text("solution")]),
        ("report writer", vec![MockResponse::text("final report")]),
    ]))
}

pub fn service(provider: Arc<dyn ModelProvider>, gated: bool, config: EngineConfig) -> TicketService {
    let db = Database::in_memory().unwrap();
    let index = Arc::new(SimilarityIndex::new(Arc::new(MockEmbedder::new(64))));
    let options = PipelineOptions {
        approve_similarity_search: gated,
        ..Default::default()
    };
    let pipeline = ticket_analysis(Arc::clone(&provider), Arc::clone(&index), &options).unwrap();
    let engine = Engine::new(
        pipeline,
        provider,
        Arc::new(SqliteSessionStore::new(db.clone())),
        config,
    );
    TicketService::new(
        Arc::new(engine),
        TicketRepo::new(db),
        index,
        Duration::from_secs(60),
    )
}
