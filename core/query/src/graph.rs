//! Graph enrichment for retrieved chunks.
//!
//! Looks up entities incident to the retrieved chunks in the latest graph
//! view and the community summaries that contain them. Enrichment is
//! advisory: any failure degrades to empty lists and the pipeline carries
//! on.

use std::sync::Arc;

use graphrag_schemas::{CommunityHit, EntityHit};
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::Store;

/// Entities kept per query after truncation.
const MAX_ENTITIES: usize = 10;

pub struct GraphEnricher {
    store: Arc<Mutex<Store>>,
}

impl GraphEnricher {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    /// Entities and communities associated with the given chunks, both
    /// sorted by relevance descending. Never fails.
    pub async fn enrich(&self, chunk_ids: &[i64]) -> (Vec<EntityHit>, Vec<CommunityHit>) {
        if chunk_ids.is_empty() {
            return (vec![], vec![]);
        }

        let store = self.store.lock().await;

        let scored = match store.entities_for_chunks(chunk_ids) {
            Ok(scored) => scored,
            Err(e) => {
                warn!("graph enrichment failed, continuing without entities: {e}");
                return (vec![], vec![]);
            }
        };

        let entities: Vec<EntityHit> = scored
            .into_iter()
            .take(MAX_ENTITIES)
            .map(|(entity, entity_type, relevance)| EntityHit {
                entity,
                entity_type,
                relevance,
            })
            .collect();

        if entities.is_empty() {
            return (vec![], vec![]);
        }

        let names: Vec<String> = entities.iter().map(|e| e.entity.clone()).collect();
        let communities = match store.communities_for_entities(&names) {
            Ok(communities) => communities,
            Err(e) => {
                warn!("community lookup failed, continuing without communities: {e}");
                return (entities, vec![]);
            }
        };

        // Community relevance is the fraction of the returned entities
        // that appear in the community.
        let mut hits: Vec<CommunityHit> = communities
            .into_iter()
            .map(|community| {
                let overlap = names
                    .iter()
                    .filter(|name| community.entities.contains(name))
                    .count();
                CommunityHit {
                    community_id: community.community_id,
                    summary: community.summary,
                    entities: community.entities,
                    relevance: overlap as f64 / names.len() as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.community_id.cmp(&b.community_id))
        });

        (entities, hits)
    }
}
