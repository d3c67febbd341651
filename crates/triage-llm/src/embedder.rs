use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};

use triage_core::embedding::EmbeddingProvider;
use triage_core::errors::GatewayError;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("static token pattern"));

pub const DEFAULT_MOCK_DIMENSIONS: usize = 256;

/// Deterministic bag-of-words embedder.
///
/// Each lowercase token is hashed into a signed bucket; the vector is
/// L2-normalized. Texts sharing vocabulary land close together, identical
/// texts produce identical vectors, and text without tokens yields a zero
/// vector.
pub struct MockEmbedder {
    dimensions: usize,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in TOKEN.find_iter(&text.to_lowercase()) {
            let digest = Sha256::digest(token.as_str().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_MOCK_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.vectorize(text))
    }
}
