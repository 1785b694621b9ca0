//! End-to-end query pipeline.
//!
//! Composes the memory cache, retrieval, classification, amplification,
//! synthesis, verification, and graph enrichment into the `/query` path.
//! Advisory stages (enrichment, planning, verification, memory writes)
//! recover locally; load-bearing stages (embedding, retrieval, final
//! synthesis) abort the request. The whole run observes one deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use graphrag_schemas::{
    ChunkHit, CommunityHit, EntityHit, MemoryEntry, QueryRequest, QueryResponse, SubQuestion,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{NewMemory, Store};
use crate::embeddings::EmbeddingProvider;
use crate::error::QueryError;
use crate::graph::GraphEnricher;
use crate::llm::ChatProvider;
use crate::memory::{normalize_question, MemoryCache};
use crate::qa;

/// Communities kept in the response envelope.
const MAX_COMMUNITIES: usize = 5;

pub struct QaPipeline {
    store: Arc<Mutex<Store>>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    memory: MemoryCache,
    enricher: GraphEnricher,
    config: Config,
}

impl QaPipeline {
    pub fn new(
        store: Arc<Mutex<Store>>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        config: Config,
    ) -> Self {
        let memory = MemoryCache::new(store.clone(), config.memory_similarity_threshold);
        let enricher = GraphEnricher::new(store.clone());
        Self {
            store,
            embedder,
            chat,
            memory,
            enricher,
            config,
        }
    }

    /// Answer a question through the full pipeline.
    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let question = validate_query(&request.query)?;
        let k = validate_max_results(request.max_results)?;
        let deadline = started + Duration::from_secs(self.config.pipeline_deadline_secs);
        let use_memory = request.use_memory && self.config.enable_memory;

        // Exact memory lookup happens before the embedding call so a
        // repeated question costs no upstream traffic at all.
        if use_memory {
            if let Some(entry) = self.memory.lookup_exact(question).await? {
                return self.memory_response(question, entry, started).await;
            }
        }

        let qvec = self.embed_within(question, deadline).await?;

        if use_memory {
            if let Some(entry) = self.memory.lookup_semantic(&qvec).await? {
                return self.memory_response(question, entry, started).await;
            }
        }

        let retrieved = {
            let store = self.store.lock().await;
            store.vector_search(&qvec, k, None)?
        };
        if retrieved.is_empty() {
            info!("no chunks in corpus, returning refusal");
            return Ok(refusal_response(question, started));
        }

        // Classification keeps the retrieval ordering (similarity
        // descending, id ascending), which later fixes citation numbers.
        let selected = if request.use_smart_selection && self.config.enable_chunk_classification {
            let flags = match remaining(deadline) {
                Ok(budget) => timeout(
                    budget,
                    qa::classify_chunks(
                        self.chat.clone(),
                        question,
                        &retrieved,
                        self.config.classify_concurrency,
                    ),
                )
                .await
                .unwrap_or_else(|_| {
                    warn!("classification hit the deadline, falling back to similarity order");
                    vec![false; retrieved.len()]
                }),
                Err(_) => vec![false; retrieved.len()],
            };
            qa::select_chunks(retrieved, &flags, qa::MIN_KEEP)
        } else {
            retrieved
        };

        let chunk_ids: Vec<i64> = selected.iter().map(|(chunk, _)| chunk.id).collect();
        let (entities, communities) = self.enrich_within(&chunk_ids, deadline).await;
        let communities: Vec<CommunityHit> =
            communities.into_iter().take(MAX_COMMUNITIES).collect();

        let subquestions = self
            .amplify_within(request, question, &selected, deadline)
            .await;

        let answer = self
            .synthesize_within(question, &selected, &subquestions, &entities, &communities, deadline)
            .await?;
        let references = qa::derive_references(&answer, &selected);

        let verification_score = self
            .verify_within(question, &answer, &selected, deadline)
            .await;

        let memory_id = if use_memory {
            self.memory
                .record(NewMemory {
                    question: question.to_string(),
                    normalized_question: normalize_question(question),
                    embedding: qvec,
                    answer: answer.clone(),
                    references: references.clone(),
                    chunk_ids,
                    entities: entities.clone(),
                    communities: communities.clone(),
                })
                .await
        } else {
            None
        };

        Ok(QueryResponse {
            query: question.to_string(),
            answer,
            chunks: to_chunk_hits(&selected),
            entities,
            communities,
            references,
            subquestions: if subquestions.is_empty() {
                None
            } else {
                Some(subquestions)
            },
            verification_score,
            from_memory: false,
            memory_id,
            processing_time: elapsed_ms(started),
        })
    }

    /// Answer without classification, amplification, verification, or
    /// memory. Used by `/query/simple`.
    pub async fn answer_simple(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let question = validate_query(&request.query)?;
        let k = validate_max_results(request.max_results)?;
        let deadline = started + Duration::from_secs(self.config.pipeline_deadline_secs);

        let qvec = self.embed_within(question, deadline).await?;
        let selected = {
            let store = self.store.lock().await;
            store.vector_search(&qvec, k, None)?
        };
        if selected.is_empty() {
            return Ok(refusal_response(question, started));
        }

        let chunk_ids: Vec<i64> = selected.iter().map(|(chunk, _)| chunk.id).collect();
        let (entities, communities) = self.enrich_within(&chunk_ids, deadline).await;
        let communities: Vec<CommunityHit> =
            communities.into_iter().take(MAX_COMMUNITIES).collect();

        let answer = self
            .synthesize_within(question, &selected, &[], &entities, &communities, deadline)
            .await?;
        let references = qa::derive_references(&answer, &selected);

        Ok(QueryResponse {
            query: question.to_string(),
            answer,
            chunks: to_chunk_hits(&selected),
            entities,
            communities,
            references,
            subquestions: None,
            verification_score: None,
            from_memory: false,
            memory_id: None,
            processing_time: elapsed_ms(started),
        })
    }

    /// Classify specific chunks against a query. Unknown chunk ids fail
    /// with `NotFound`.
    pub async fn classify_chunk_ids(
        &self,
        query: &str,
        chunk_ids: &[i64],
    ) -> Result<Vec<(i64, bool)>, QueryError> {
        let question = validate_query(query)?;
        if chunk_ids.is_empty() {
            return Err(QueryError::BadInput("chunk_ids must not be empty".into()));
        }

        let chunks = {
            let store = self.store.lock().await;
            let mut chunks = Vec::with_capacity(chunk_ids.len());
            for id in chunk_ids {
                chunks.push((store.fetch_chunk(*id)?, 0.0));
            }
            chunks
        };

        let flags = qa::classify_chunks(
            self.chat.clone(),
            question,
            &chunks,
            self.config.classify_concurrency,
        )
        .await;

        Ok(chunk_ids.iter().copied().zip(flags).collect())
    }

    /// Decompose a query into subquestions, retrieving a small context
    /// when the caller supplies none.
    pub async fn generate_subquestions(
        &self,
        query: &str,
        context: Option<String>,
    ) -> Result<Vec<String>, QueryError> {
        let question = validate_query(query)?;

        let digest = match context {
            Some(context) if !context.trim().is_empty() => context,
            _ => {
                let qvec = self.embedder.embed(question).await?;
                let store = self.store.lock().await;
                let chunks = store.vector_search(&qvec, 3, None)?;
                qa::context_digest(&chunks)
            }
        };

        qa::plan_subquestions(
            self.chat.as_ref(),
            question,
            &digest,
            self.config.max_subquestions,
        )
        .await
    }

    /// Score an answer against a context, retrieving one when the caller
    /// supplies none.
    pub async fn verify(
        &self,
        query: &str,
        answer: &str,
        context: Option<String>,
    ) -> Result<f64, QueryError> {
        let question = validate_query(query)?;
        if answer.trim().is_empty() {
            return Err(QueryError::BadInput("answer must not be empty".into()));
        }

        let context = match context {
            Some(context) if !context.trim().is_empty() => context,
            _ => {
                let qvec = self.embedder.embed(question).await?;
                let store = self.store.lock().await;
                let chunks = store.vector_search(&qvec, 5, None)?;
                qa::build_context(&chunks)
            }
        };

        qa::verify_answer(self.chat.as_ref(), question, answer, &context).await
    }

    // ========== STAGE WRAPPERS ==========

    async fn embed_within(
        &self,
        question: &str,
        deadline: Instant,
    ) -> Result<Vec<f32>, QueryError> {
        timeout(remaining(deadline)?, self.embedder.embed(question))
            .await
            .map_err(|_| QueryError::Timeout("embedding exceeded the pipeline deadline".into()))?
    }

    async fn enrich_within(
        &self,
        chunk_ids: &[i64],
        deadline: Instant,
    ) -> (Vec<EntityHit>, Vec<CommunityHit>) {
        match remaining(deadline) {
            Ok(budget) => timeout(budget, self.enricher.enrich(chunk_ids))
                .await
                .unwrap_or_else(|_| {
                    warn!("graph enrichment hit the deadline, continuing without it");
                    (vec![], vec![])
                }),
            Err(_) => (vec![], vec![]),
        }
    }

    async fn amplify_within(
        &self,
        request: &QueryRequest,
        question: &str,
        selected: &[(graphrag_schemas::Chunk, f64)],
        deadline: Instant,
    ) -> Vec<SubQuestion> {
        let enabled = request.use_amplification && self.config.enable_subquestion_amplification;
        if !enabled || qa::context_length(selected) <= self.config.amplification_min_context_length
        {
            return vec![];
        }

        let Ok(budget) = remaining(deadline) else {
            return vec![];
        };
        let digest = qa::context_digest(selected);
        let planned = match timeout(
            budget,
            qa::plan_subquestions(
                self.chat.as_ref(),
                question,
                &digest,
                self.config.max_subquestions,
            ),
        )
        .await
        {
            Ok(Ok(planned)) => planned,
            Ok(Err(e)) => {
                warn!("subquestion planning failed, skipping amplification: {e}");
                return vec![];
            }
            Err(_) => {
                warn!("subquestion planning hit the deadline, skipping amplification");
                return vec![];
            }
        };

        let Ok(budget) = remaining(deadline) else {
            return vec![];
        };
        match timeout(
            budget,
            qa::answer_subquestions(
                self.chat.clone(),
                planned,
                selected,
                self.config.subq_concurrency,
            ),
        )
        .await
        {
            Ok(answered) => answered,
            Err(_) => {
                warn!("sub-answering hit the deadline, skipping amplification");
                vec![]
            }
        }
    }

    async fn synthesize_within(
        &self,
        question: &str,
        selected: &[(graphrag_schemas::Chunk, f64)],
        subquestions: &[SubQuestion],
        entities: &[EntityHit],
        communities: &[CommunityHit],
        deadline: Instant,
    ) -> Result<String, QueryError> {
        timeout(
            remaining(deadline)?,
            qa::synthesize(
                self.chat.as_ref(),
                question,
                selected,
                subquestions,
                entities,
                communities,
            ),
        )
        .await
        .map_err(|_| QueryError::Timeout("synthesis exceeded the pipeline deadline".into()))?
    }

    async fn verify_within(
        &self,
        question: &str,
        answer: &str,
        selected: &[(graphrag_schemas::Chunk, f64)],
        deadline: Instant,
    ) -> Option<f64> {
        if !self.config.enable_answer_verification {
            return None;
        }
        let budget = remaining(deadline).ok()?;
        let context = qa::build_context(selected);
        match timeout(
            budget,
            qa::verify_answer(self.chat.as_ref(), question, answer, &context),
        )
        .await
        {
            Ok(Ok(score)) => Some(score),
            Ok(Err(e)) => {
                warn!("verification failed, continuing without a score: {e}");
                None
            }
            Err(_) => {
                warn!("verification hit the deadline, continuing without a score");
                None
            }
        }
    }

    /// Build the envelope for a memory hit: the cached answer with chunk
    /// text re-fetched so it stays fresh.
    async fn memory_response(
        &self,
        question: &str,
        entry: MemoryEntry,
        started: Instant,
    ) -> Result<QueryResponse, QueryError> {
        let chunks = {
            let store = self.store.lock().await;
            store.fetch_chunks(&entry.chunk_ids)?
        };

        let hits = chunks
            .into_iter()
            .map(|chunk| ChunkHit {
                id: chunk.id,
                text: chunk.text,
                source: chunk.source.source,
                // Remembered results carry no fresh retrieval score.
                similarity: 1.0,
            })
            .collect();

        info!("answering from memory entry {}", entry.id);
        Ok(QueryResponse {
            query: question.to_string(),
            answer: entry.answer,
            chunks: hits,
            entities: entry.entities,
            communities: entry.communities,
            references: entry.references,
            subquestions: None,
            verification_score: None,
            from_memory: true,
            memory_id: Some(entry.id),
            processing_time: elapsed_ms(started),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_query(query: &str) -> Result<&str, QueryError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(QueryError::BadInput("query must not be empty".into()));
    }
    Ok(trimmed)
}

fn validate_max_results(max_results: usize) -> Result<usize, QueryError> {
    if max_results == 0 {
        return Err(QueryError::BadInput("max_results must be at least 1".into()));
    }
    Ok(max_results.min(50))
}

fn remaining(deadline: Instant) -> Result<Duration, QueryError> {
    let now = Instant::now();
    if now >= deadline {
        Err(QueryError::Timeout("pipeline deadline exceeded".into()))
    } else {
        Ok(deadline - now)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn to_chunk_hits(selected: &[(graphrag_schemas::Chunk, f64)]) -> Vec<ChunkHit> {
    selected
        .iter()
        .map(|(chunk, similarity)| ChunkHit {
            id: chunk.id,
            text: chunk.text.clone(),
            source: chunk.source.source.clone(),
            similarity: *similarity,
        })
        .collect()
}

fn refusal_response(question: &str, started: Instant) -> QueryResponse {
    QueryResponse {
        query: question.to_string(),
        answer: qa::REFUSAL.to_string(),
        chunks: vec![],
        entities: vec![],
        communities: vec![],
        references: vec![],
        subquestions: None,
        verification_score: None,
        from_memory: false,
        memory_id: None,
        processing_time: elapsed_ms(started),
    }
}
