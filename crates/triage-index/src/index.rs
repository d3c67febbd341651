use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, instrument};

use triage_core::embedding::EmbeddingProvider;
use triage_core::ids::RecordId;

use crate::errors::{IndexError, Result};
use crate::similarity::cosine_similarity;

pub const DEFAULT_TOP_K: usize = 4;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A stored document. Immutable once ingested.
#[derive(Clone, Debug, Serialize)]
pub struct SimilarityRecord {
    pub id: RecordId,
    pub text: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    /// Insertion order, used to break score ties.
    pub seq: u64,
}

impl SimilarityRecord {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ScoredRecord {
    pub record: Arc<SimilarityRecord>,
    pub score: f32,
}

type Snapshot = Arc<Vec<Arc<SimilarityRecord>>>;

/// In-memory nearest-neighbor store over embedded text.
///
/// Records live in an immutable snapshot. Writers build a new snapshot and
/// swap it in under the write lock; readers clone the current `Arc` and score
/// without holding any lock, so a query sees the index either before or after
/// a concurrent ingest, never in between.
pub struct SimilarityIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    snapshot: RwLock<Snapshot>,
    next_seq: Mutex<u64>,
}

impl SimilarityIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            next_seq: Mutex::new(0),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embed `text` and store it. Returns the new record id.
    #[instrument(skip(self, text, metadata), fields(chars = text.len()))]
    pub async fn ingest(&self, text: &str, metadata: Metadata) -> Result<RecordId> {
        if let Some((key, _)) = metadata
            .iter()
            .find(|(_, v)| !(v.is_string() || v.is_number()))
        {
            return Err(IndexError::InvalidMetadata { key: key.clone() });
        }

        let vector = self.embedder.embed(text).await?;
        let expected = self.dimensions();
        if vector.is_empty() || vector.len() != expected {
            return Err(IndexError::Dimension {
                expected,
                actual: vector.len(),
            });
        }

        let id = RecordId::new();
        let mut guard = self.snapshot.write();
        let seq = {
            let mut next = self.next_seq.lock();
            let seq = *next;
            *next += 1;
            seq
        };
        let record = Arc::new(SimilarityRecord {
            id: id.clone(),
            text: text.to_string(),
            vector,
            metadata,
            seq,
        });
        let mut records = Vec::with_capacity(guard.len() + 1);
        records.extend(guard.iter().cloned());
        records.push(record);
        *guard = Arc::new(records);
        drop(guard);

        debug!(record_id = %id, seq, "record ingested");
        Ok(id)
    }

    /// The `top_k` most similar records, best first. Ties go to the earlier insertion.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ScoredRecord>> {
        let snapshot = self.snapshot.read().clone();
        if top_k == 0 || snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(text).await?;
        Ok(rank(&query, &snapshot, top_k))
    }

    /// Remove a record. Returns false if it was not present.
    pub fn delete(&self, id: &RecordId) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.iter().any(|r| &r.id == id) {
            return false;
        }
        let records: Vec<_> = guard.iter().filter(|r| &r.id != id).cloned().collect();
        *guard = Arc::new(records);
        true
    }

    pub fn get(&self, id: &RecordId) -> Option<Arc<SimilarityRecord>> {
        self.snapshot.read().iter().find(|r| &r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }
}

fn rank(query: &[f32], records: &[Arc<SimilarityRecord>], top_k: usize) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = records
        .iter()
        .map(|r| ScoredRecord {
            score: cosine_similarity(query, &r.vector),
            record: Arc::clone(r),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.record.seq.cmp(&b.record.seq))
    });
    scored.truncate(top_k);
    scored
}
