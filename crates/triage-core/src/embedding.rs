use async_trait::async_trait;

use crate::errors::GatewayError;

/// Produces fixed-dimension vectors for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;
}
