use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use triage_core::ticket::TicketCategory;

pub const DEFAULT_CLASSIFICATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    category: TicketCategory,
    expires_at: Instant,
}

/// Category of recently analyzed ticket contents, keyed by a content hash.
pub struct ClassificationCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl ClassificationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn get(&self, content: &str) -> Option<TicketCategory> {
        let key = Self::key(content);
        let entry = self.entries.get(&key)?;
        if entry.expires_at > Instant::now() {
            return Some(entry.category);
        }
        drop(entry);
        self.entries.remove_if(&key, |_, e| e.expires_at <= Instant::now());
        None
    }

    pub fn put(&self, content: &str, category: TicketCategory) {
        self.entries.insert(
            Self::key(content),
            Entry {
                category,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ClassificationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CLASSIFICATION_TTL)
    }
}
