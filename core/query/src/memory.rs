//! Persistent query memory.
//!
//! Short-circuits questions the service has answered before. A query hits
//! when its normalized text matches an entry exactly, or when its
//! embedding is close enough to an entry's embedding. Hits bump the access
//! accounting; misses are recorded after a successful synthesis.

use std::sync::Arc;

use graphrag_schemas::MemoryEntry;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{NewMemory, Store};
use crate::error::QueryError;

/// Normalize a question for exact-match lookup: trim, collapse internal
/// whitespace, case-fold.
pub fn normalize_question(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct MemoryCache {
    store: Arc<Mutex<Store>>,
    similarity_threshold: f64,
}

impl MemoryCache {
    pub fn new(store: Arc<Mutex<Store>>, similarity_threshold: f64) -> Self {
        Self {
            store,
            similarity_threshold,
        }
    }

    /// Exact lookup by normalized text. Touches the entry on hit.
    pub async fn lookup_exact(&self, question: &str) -> Result<Option<MemoryEntry>, QueryError> {
        let normalized = normalize_question(question);
        let store = self.store.lock().await;

        let Some(entry) = store.memory_lookup_exact(&normalized)? else {
            return Ok(None);
        };
        store.memory_touch(entry.id)?;
        debug!("memory exact hit: entry {}", entry.id);
        Ok(Some(entry))
    }

    /// Semantic lookup by query embedding. Touches the entry on hit.
    pub async fn lookup_semantic(
        &self,
        qvec: &[f32],
    ) -> Result<Option<MemoryEntry>, QueryError> {
        let store = self.store.lock().await;

        let Some(entry) = store.memory_lookup_semantic(qvec, self.similarity_threshold)? else {
            return Ok(None);
        };
        store.memory_touch(entry.id)?;
        debug!("memory semantic hit: entry {}", entry.id);
        Ok(Some(entry))
    }

    /// Record an answered question. Insert failures are logged, not
    /// propagated: the caller already has an answer to return.
    pub async fn record(&self, new: NewMemory) -> Option<i64> {
        let store = self.store.lock().await;
        match store.memory_insert_or_touch(&new, self.similarity_threshold) {
            Ok((id, _inserted)) => Some(id),
            Err(e) => {
                warn!("failed to record memory entry: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrag_schemas::SourceMeta;

    #[test]
    fn test_normalize_question() {
        assert_eq!(
            normalize_question("  What   IS\tRaft\nConsensus?  "),
            "what is raft consensus?"
        );
        assert_eq!(normalize_question(""), "");
    }

    fn new_memory(question: &str, vec: Vec<f32>) -> NewMemory {
        NewMemory {
            question: question.to_string(),
            normalized_question: normalize_question(question),
            embedding: vec,
            answer: "An answer [1].".to_string(),
            references: vec!["doc.pdf".to_string()],
            chunk_ids: vec![],
            entities: vec![],
            communities: vec![],
        }
    }

    async fn cache() -> (tempfile::TempDir, MemoryCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        store
            .insert_chunk("seed", &SourceMeta::named("doc.pdf"), &[1.0, 0.0])
            .unwrap();
        let cache = MemoryCache::new(Arc::new(Mutex::new(store)), 0.95);
        (dir, cache)
    }

    #[tokio::test]
    async fn test_exact_hit_ignores_case_and_spacing() {
        let (_dir, cache) = cache().await;
        let id = cache
            .record(new_memory("What is raft consensus", vec![1.0, 0.0]))
            .await
            .unwrap();

        let hit = cache
            .lookup_exact("  what IS   raft consensus ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, id);

        let miss = cache.lookup_exact("what is paxos").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_semantic_hit_at_threshold() {
        let (_dir, cache) = cache().await;
        let id = cache
            .record(new_memory("What is raft consensus", vec![1.0, 0.0]))
            .await
            .unwrap();

        let hit = cache.lookup_semantic(&[0.99, 0.01]).await.unwrap();
        assert_eq!(hit.unwrap().id, id);

        let miss = cache.lookup_semantic(&[0.5, 0.5]).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_hits_accumulate_access_count() {
        let (_dir, cache) = cache().await;
        let id = cache
            .record(new_memory("q one", vec![1.0, 0.0]))
            .await
            .unwrap();

        cache.lookup_exact("q one").await.unwrap();
        cache.lookup_exact("Q ONE").await.unwrap();

        let store = cache.store.lock().await;
        let entry = store.memory_get(id).unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
    }
}
