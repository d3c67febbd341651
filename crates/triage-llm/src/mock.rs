use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use triage_core::errors::GatewayError;
use triage_core::ids::ToolCallId;
use triage_core::messages::{Message, ToolCallBlock};
use triage_core::provider::{Completion, CompletionRequest, ModelProvider};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return a completion.
    Reply(Completion),
    /// Return an error from the complete() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: a final text answer.
    pub fn text(text: &str) -> Self {
        Self::Reply(Completion::Final {
            text: text.to_string(),
        })
    }

    /// Convenience: a single tool call with a fresh call id.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![(name, arguments)])
    }

    /// Convenience: several tool calls in one turn.
    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        Self::Reply(Completion::ToolCalls {
            text: String::new(),
            calls: calls
                .into_iter()
                .map(|(name, arguments)| ToolCallBlock {
                    id: ToolCallId::new(),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
        })
    }

    /// Convenience: a tool call with a caller-chosen id.
    pub fn tool_call_with_id(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::Reply(Completion::ToolCalls {
            text: String::new(),
            calls: vec![ToolCallBlock {
                id: ToolCallId::from_raw(id),
                name: name.to_string(),
                arguments,
            }],
        })
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

struct Script {
    /// Substring of the system instruction this script answers; `None` answers everything.
    matcher: Option<String>,
    responses: Vec<MockResponse>,
    cursor: AtomicUsize,
}

/// Mock provider that returns pre-programmed responses in sequence.
///
/// Scripts can be keyed by a fragment of the system instruction so that
/// concurrently running stages each draw from their own sequence.
pub struct MockProvider {
    scripts: Vec<Script>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            scripts: vec![Script {
                matcher: None,
                responses,
                cursor: AtomicUsize::new(0),
            }],
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// One script per instruction fragment. The first matching script answers.
    pub fn routed(routes: Vec<(&str, Vec<MockResponse>)>) -> Self {
        Self {
            scripts: routes
                .into_iter()
                .map(|(matcher, responses)| Script {
                    matcher: Some(matcher.to_string()),
                    responses,
                    cursor: AtomicUsize::new(0),
                })
                .collect(),
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let script = self
            .scripts
            .iter()
            .find(|s| match &s.matcher {
                Some(m) => request.system.contains(m.as_str()),
                None => true,
            })
            .ok_or_else(|| {
                GatewayError::InvalidRequest("MockProvider: no script matches request".into())
            })?;

        let idx = script.cursor.fetch_add(1, Ordering::Relaxed);
        let response = script.responses.get(idx).cloned().ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            ))
        })?;

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, sleeping through any delays.
async fn resolve_response(response: MockResponse) -> Result<Completion, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Reply(c) => return Ok(c),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Offline provider that answers every request with a short digest of its input.
/// Used when no model endpoint is configured.
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let heading = request.system.lines().next().unwrap_or_default();
        let last_user = request
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User(u) => Some(u.text.as_str()),
                _ => None,
            })
            .unwrap_or_default();
        let excerpt: String = last_user.chars().take(240).collect();
        Ok(Completion::Final {
            text: format!("{heading}\n\n{excerpt}"),
        })
    }
}
