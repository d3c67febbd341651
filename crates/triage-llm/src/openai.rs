//! OpenAI-compatible chat-completions and embeddings clients.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use triage_core::embedding::EmbeddingProvider;
use triage_core::errors::GatewayError;
use triage_core::ids::ToolCallId;
use triage_core::messages::{Message, ToolCallBlock};
use triage_core::provider::{Completion, CompletionRequest, ModelProvider};
use triage_core::tools::ToolDefinition;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
        }
    }
}

fn build_client() -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

async fn post_json(
    client: &Client,
    url: &str,
    api_key: Option<&SecretString>,
    body: &Value,
) -> Result<Value, GatewayError> {
    let mut req = client.post(url).json(body);
    if let Some(key) = api_key {
        req = req.bearer_auth(key.expose_secret());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.unwrap_or_default();
        return Err(match GatewayError::from_status(status, body) {
            GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
            other => other,
        });
    }

    resp.json::<Value>()
        .await
        .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
}

/// Chat-completions client with function calling.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: build_client(),
            config,
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let body = build_chat_body(&self.config.model, request);
        let url = endpoint(&self.config.base_url, "chat/completions");
        let resp = post_json(&self.client, &url, self.config.api_key.as_ref(), &body).await?;
        let completion = parse_chat_response(&resp)?;
        let kind = match &completion {
            Completion::Final { .. } => "final",
            Completion::ToolCalls { .. } => "tool_calls",
        };
        debug!(kind, "chat completion received");
        Ok(completion)
    }
}

/// Embeddings client.
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: build_client(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.config.embedding_dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
        });
        let url = endpoint(&self.config.base_url, "embeddings");
        let resp = post_json(&self.client, &url, self.config.api_key.as_ref(), &body).await?;
        parse_embedding_response(&resp, self.config.embedding_dimensions)
    }
}

// --- Wire conversion ---

fn convert_message(message: &Message) -> Value {
    match message {
        Message::User(m) => json!({"role": "user", "content": m.text}),
        Message::Assistant(m) => {
            let mut out = json!({
                "role": "assistant",
                "content": if m.text.is_empty() { Value::Null } else { Value::String(m.text.clone()) },
            });
            if !m.tool_calls.is_empty() {
                out["tool_calls"] = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id.as_str(),
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            out
        }
        Message::ToolResult(m) => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.as_str(),
            "content": m.content,
        }),
    }
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        }
    })
}

pub(crate) fn build_chat_body(model: &str, request: &CompletionRequest) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        messages.push(json!({"role": "system", "content": request.system}));
    }
    messages.extend(request.messages.iter().map(convert_message));

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(convert_tool).collect();
    }
    body
}

pub(crate) fn parse_chat_response(resp: &Value) -> Result<Completion, GatewayError> {
    let message = resp
        .pointer("/choices/0/message")
        .ok_or_else(|| GatewayError::MalformedResponse("missing choices[0].message".into()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let calls: Vec<ToolCallBlock> = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let name = c.pointer("/function/name")?.as_str()?.to_string();
                    let raw = c
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let arguments = serde_json::from_str(raw)
                        .unwrap_or_else(|_| Value::String(raw.to_string()));
                    let id = c
                        .get("id")
                        .and_then(Value::as_str)
                        .map(ToolCallId::from_raw)
                        .unwrap_or_default();
                    Some(ToolCallBlock { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    if calls.is_empty() {
        Ok(Completion::Final { text })
    } else {
        Ok(Completion::ToolCalls { text, calls })
    }
}

pub(crate) fn parse_embedding_response(
    resp: &Value,
    dimensions: usize,
) -> Result<Vec<f32>, GatewayError> {
    let raw = resp
        .pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::MalformedResponse("missing data[0].embedding".into()))?;

    let vector: Vec<f32> = raw
        .iter()
        .filter_map(Value::as_f64)
        .map(|x| x as f32)
        .collect();

    if vector.len() != dimensions {
        return Err(GatewayError::MalformedResponse(format!(
            "expected {dimensions} dimensions, got {}",
            vector.len()
        )));
    }
    Ok(vector)
}
