mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use triage_core::embedding::EmbeddingProvider;
use triage_core::provider::ModelProvider;
use triage_engine::{ticket_analysis, Engine, SqliteSessionStore};
use triage_index::SimilarityIndex;
use triage_llm::{EchoProvider, MockEmbedder, OpenAiEmbedder, OpenAiProvider, ReliableProvider};
use triage_server::{AppState, TicketService};
use triage_store::{Database, TicketRepo};

use crate::settings::{ModelSettings, ProviderKind, Settings};

/// Stored tickets loaded into the similarity index at startup.
const WARM_INDEX_LIMIT: u32 = 10_000;
const MOCK_EMBEDDING_DIMENSIONS: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "triage", about = "Feedback ticket analysis server")]
struct Cli {
    /// Settings file (default: ~/.triage/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,
    /// Use the offline echo model and hash embeddings
    #[arg(long)]
    mock: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.storage.database_path = db.clone();
        }
        if self.mock {
            settings.model.provider = ProviderKind::Mock;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(settings::settings_path);
    let (mut settings, load_error) = Settings::load(&path);
    cli.apply(&mut settings);

    let telemetry = triage_telemetry::init_telemetry(&settings.logging);
    if let Some(e) = load_error {
        let error = format!("{e:#}");
        tracing::warn!(path = %path.display(), error = %error, "invalid settings file, using defaults");
    }
    tracing::info!(filter = telemetry.filter(), "starting triage server");

    let db_path = &settings.storage.database_path;
    let db = Database::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;

    let (provider, embedder) = build_providers(&settings.model);
    let index = Arc::new(SimilarityIndex::new(embedder));
    let pipeline = ticket_analysis(
        Arc::clone(&provider),
        Arc::clone(&index),
        &settings.engine.pipeline_options(),
    )
    .context("failed to build pipeline")?;
    let engine = Engine::new(
        pipeline,
        provider,
        Arc::new(SqliteSessionStore::new(db.clone())),
        settings.engine.engine_config(),
    );
    let service = Arc::new(TicketService::new(
        Arc::new(engine),
        TicketRepo::new(db),
        index,
        settings.cache.ttl(),
    ));
    if let Err(e) = service.warm_index(WARM_INDEX_LIMIT).await {
        tracing::warn!(error = %e, "failed to load stored tickets into the index");
    }

    let handle = triage_server::start(settings.server.clone(), AppState { service })
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "triage server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    Ok(())
}

fn build_providers(model: &ModelSettings) -> (Arc<dyn ModelProvider>, Arc<dyn EmbeddingProvider>) {
    match model.provider {
        ProviderKind::Mock => {
            tracing::info!("using mock model provider");
            (
                Arc::new(EchoProvider),
                Arc::new(MockEmbedder::new(MOCK_EMBEDDING_DIMENSIONS)),
            )
        }
        ProviderKind::Openai => {
            if model.api_key.is_none() {
                tracing::warn!("no API key configured; model requests will likely be rejected");
            }
            tracing::info!(model = %model.model, base_url = %model.base_url, "using openai-compatible provider");
            let config = model.openai_config();
            (
                Arc::new(ReliableProvider::new(
                    OpenAiProvider::new(config.clone()),
                    model.reliable_config(),
                )),
                Arc::new(OpenAiEmbedder::new(config)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from(["triage", "--port", "8181", "--db", "/tmp/t.db", "--mock"]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8181);
        assert_eq!(settings.storage.database_path, PathBuf::from("/tmp/t.db"));
        assert_eq!(settings.model.provider, ProviderKind::Mock);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let cli = Cli::parse_from(["triage"]);
        let mut settings = Settings::default();
        settings.server.port = 1234;
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 1234);
        assert_eq!(settings.model.provider, ProviderKind::Openai);
    }

    #[test]
    fn mock_providers_are_offline() {
        let model = ModelSettings {
            provider: ProviderKind::Mock,
            ..Default::default()
        };
        let (provider, embedder) = build_providers(&model);
        assert_eq!(provider.name(), "echo");
        assert_eq!(embedder.dimensions(), MOCK_EMBEDDING_DIMENSIONS);
    }
}
