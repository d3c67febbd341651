//! Layered settings: compiled defaults, then `~/.triage/settings.json`
//! deep-merged over them, then `TRIAGE_*` environment overrides. CLI flags
//! are applied last by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use triage_engine::{EngineConfig, PipelineOptions, SummarizationPolicy};
use triage_llm::{OpenAiConfig, ReliableConfig};
use triage_server::ServerConfig;
use triage_telemetry::TelemetryConfig;

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// `~/.triage/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".triage").join("settings.json")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub engine: EngineSettings,
    pub model: ModelSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub logging: TelemetryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub tool_call_ceiling: u32,
    pub tool_timeout_secs: u64,
    pub approval_ttl_secs: u64,
    pub retention_secs: u64,
    pub summary_max_tokens: usize,
    pub summary_messages_to_keep: usize,
    pub approve_similarity_search: bool,
    pub search_top_k: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let pipeline = PipelineOptions::default();
        Self {
            tool_call_ceiling: engine.tool_call_ceiling,
            tool_timeout_secs: engine.tool_timeout.as_secs(),
            approval_ttl_secs: engine.approval_ttl.as_secs(),
            retention_secs: engine.retention.as_secs(),
            summary_max_tokens: pipeline.summarization.max_tokens,
            summary_messages_to_keep: pipeline.summarization.messages_to_keep,
            approve_similarity_search: pipeline.approve_similarity_search,
            search_top_k: pipeline.search_top_k,
        }
    }
}

impl EngineSettings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tool_call_ceiling: self.tool_call_ceiling,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            approval_ttl: Duration::from_secs(self.approval_ttl_secs),
            retention: Duration::from_secs(self.retention_secs),
        }
    }

    /// Reset values the engine cannot run with to their defaults.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.tool_call_ceiling == 0 {
            tracing::warn!(default = defaults.tool_call_ceiling, "engine.tool_call_ceiling must be positive, using default");
            self.tool_call_ceiling = defaults.tool_call_ceiling;
        }
        if self.summary_messages_to_keep == 0 {
            tracing::warn!(
                default = defaults.summary_messages_to_keep,
                "engine.summary_messages_to_keep must be positive, using default"
            );
            self.summary_messages_to_keep = defaults.summary_messages_to_keep;
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            approve_similarity_search: self.approve_similarity_search,
            search_top_k: self.search_top_k,
            tool_call_ceiling: None,
            summarization: SummarizationPolicy {
                max_tokens: self.summary_max_tokens,
                messages_to_keep: self.summary_messages_to_keep,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Mock,
    #[default]
    Openai,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    /// Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<SecretString>,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        let openai = OpenAiConfig::default();
        let reliable = ReliableConfig::default();
        Self {
            provider: ProviderKind::default(),
            base_url: openai.base_url,
            model: openai.model,
            embedding_model: openai.embedding_model,
            embedding_dimensions: openai.embedding_dimensions,
            api_key: None,
            max_retries: reliable.max_retries,
            request_timeout_secs: reliable.request_timeout.map_or(0, |d| d.as_secs()),
        }
    }
}

impl ModelSettings {
    pub fn openai_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            embedding_model: self.embedding_model.clone(),
            embedding_dimensions: self.embedding_dimensions,
        }
    }

    /// A zero request timeout disables the per-attempt deadline.
    pub fn reliable_config(&self) -> ReliableConfig {
        ReliableConfig {
            max_retries: self.max_retries,
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub classification_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            classification_ttl_secs: triage_server::cache::DEFAULT_CLASSIFICATION_TTL.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.classification_ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: home_dir().join(".triage").join("triage.db"),
        }
    }
}

impl Settings {
    /// Load from `path`. A missing file yields defaults; an unreadable or
    /// invalid one yields defaults plus the error so the caller can log it.
    pub fn load(path: &Path) -> (Self, Option<anyhow::Error>) {
        let env = |key: &str| std::env::var(key).ok();
        match read_file(path).and_then(|file| Self::from_layers(file, env)) {
            Ok(settings) => (settings, None),
            Err(e) => {
                let fallback = Self::from_layers(None, env).unwrap_or_default();
                (fallback, Some(e))
            }
        }
    }

    /// Merge `file` over the defaults, then apply environment overrides.
    pub fn from_layers(
        file: Option<Value>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = serde_json::to_value(Settings::default()).context("failed to encode defaults")?;
        let merged = match file {
            Some(file) => deep_merge(defaults, file),
            None => defaults,
        };
        let mut settings: Settings = serde_json::from_value(merged).context("invalid settings")?;
        apply_env_overrides(&mut settings, env);
        settings.engine.sanitize();
        Ok(settings)
    }
}

fn read_file(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Objects merge per key, everything else is replaced, nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| env(key).filter(|v| !v.is_empty());

    if let Some(v) = read("TRIAGE_HOST") {
        settings.server.bind_address = v;
    }
    if let Some(v) = parsed(&read, "TRIAGE_PORT", |s| s.parse::<u16>().ok()) {
        settings.server.port = v;
    }
    if let Some(v) = read("TRIAGE_DB") {
        settings.storage.database_path = PathBuf::from(v);
    }
    if let Some(v) = parsed(&read, "TRIAGE_PROVIDER", parse_provider) {
        settings.model.provider = v;
    }
    if let Some(v) = read("TRIAGE_BASE_URL") {
        settings.model.base_url = v;
    }
    if let Some(v) = read("TRIAGE_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read("TRIAGE_API_KEY").or_else(|| read("OPENAI_API_KEY")) {
        settings.model.api_key = Some(SecretString::from(v));
    }
    if let Some(v) = parsed(&read, "TRIAGE_TOOL_CALL_CEILING", |s| s.parse::<u32>().ok().filter(|n| *n > 0)) {
        settings.engine.tool_call_ceiling = v;
    }
    if let Some(v) = parsed(&read, "TRIAGE_APPROVAL_TTL_SECS", |s| s.parse::<u64>().ok()) {
        settings.engine.approval_ttl_secs = v;
    }
    if let Some(v) = parsed(&read, "TRIAGE_APPROVE_SEARCH", parse_bool) {
        settings.engine.approve_similarity_search = v;
    }
    if let Some(v) = read("TRIAGE_LOG_LEVEL") {
        settings.logging.log_level = v;
    }
    if let Some(v) = parsed(&read, "TRIAGE_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = read(key)?;
    let value = parse(&raw);
    if value.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    value
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_provider(val: &str) -> Option<ProviderKind> {
    serde_json::from_value(Value::String(val.to_lowercase())).ok()
}
