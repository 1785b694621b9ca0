use serde::{Deserialize, Serialize};

// ============================================================================
// Corpus types
// ============================================================================

/// Source descriptor and provenance for an ingested chunk.
///
/// Written by the ingestion service; the query side only reads it. All
/// fields except `source` are optional because older imports predate the
/// provenance columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    #[serde(default = "unknown_source")]
    pub source: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub ingested_at: Option<String>, // RFC3339
    #[serde(default)]
    pub ocr: bool,
    #[serde(default)]
    pub hash: Option<String>,
}

fn unknown_source() -> String {
    "Unknown source".to_string()
}

impl Default for SourceMeta {
    fn default() -> Self {
        Self {
            source: unknown_source(),
            path: None,
            page: None,
            ingested_at: None,
            ocr: false,
            hash: None,
        }
    }
}

impl SourceMeta {
    pub fn named(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

/// Immutable unit of source text produced by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub text: String,
    pub source: SourceMeta,
    pub created_at: String, // RFC3339
}

/// A retrieved chunk as it appears in a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub id: i64,
    pub text: String,
    pub source: String,
    pub similarity: f64,
}

// ============================================================================
// Graph types
// ============================================================================

/// An entity associated with the retrieved chunks, with an aggregate
/// relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityHit {
    pub entity: String,
    pub entity_type: String,
    pub relevance: f64,
}

/// A community summary scored against the entities found for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityHit {
    pub community_id: i64,
    pub summary: String,
    pub entities: Vec<String>,
    pub relevance: f64,
}

/// A community summary row as the graph builder persisted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub community_id: i64,
    pub summary: String,
    pub entities: Vec<String>,
    pub key_relations: Vec<String>,
    pub num_entities: i64,
    pub num_chunks: i64,
}

// ============================================================================
// Memory types
// ============================================================================

/// A persisted question/answer pair with its evidence and access
/// accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub question: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub answer: String,
    pub references: Vec<String>,
    pub chunk_ids: Vec<i64>,
    pub entities: Vec<EntityHit>,
    pub communities: Vec<CommunityHit>,
    pub access_count: i64,
    pub created_at: String,    // RFC3339
    pub last_accessed: String, // RFC3339
}

/// One line of the memory statistics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatLine {
    pub query: String,
    pub access_count: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_accessed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_entries: i64,
    pub total_accesses: i64,
    pub average_accesses: f64,
    pub max_accesses: i64,
    pub oldest_entry: Option<String>,
    pub newest_entry: Option<String>,
    pub most_accessed: Vec<MemoryStatLine>,
    pub recent_queries: Vec<MemoryStatLine>,
}

// ============================================================================
// Feedback and thread types
// ============================================================================

/// User feedback bound to a memory entry. At most one row per entry;
/// a thread is a feedback row with `has_thread = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub memory_id: i64,
    pub feedback_text: Option<String>,
    pub rating: Option<i64>,
    pub is_favorite: bool,
    pub has_thread: bool,
    pub thread_title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub feedback_id: i64,
    pub message: String,
    pub is_user: bool,
    pub references: Vec<String>,
    pub chunk_ids: Vec<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: i64,
    pub title: String,
    pub memory_id: i64,
    pub original_query: String,
    pub message_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDetail {
    pub id: i64,
    pub title: String,
    pub memory_id: i64,
    pub original_query: String,
    pub original_answer: String,
    pub messages: Vec<ThreadMessage>,
    pub created_at: String,
}

// ============================================================================
// Query envelopes
// ============================================================================

/// A subquestion produced by decomposition, with its focused answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestion {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_true")]
    pub use_memory: bool,
    #[serde(default = "default_true")]
    pub use_amplification: bool,
    #[serde(default = "default_true")]
    pub use_smart_selection: bool,
}

pub fn default_max_results() -> usize {
    5
}

pub fn default_true() -> bool {
    true
}

/// The full response envelope for the query endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    pub chunks: Vec<ChunkHit>,
    pub entities: Vec<EntityHit>,
    pub communities: Vec<CommunityHit>,
    pub references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subquestions: Option<Vec<SubQuestion>>,
    pub verification_score: Option<f64>,
    pub from_memory: bool,
    pub memory_id: Option<i64>,
    /// Wall-clock time spent producing this response, in milliseconds.
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub memory_id: i64,
    #[serde(default)]
    pub feedback_text: Option<String>,
    #[serde(default)]
    pub rating: Option<i64>,
    #[serde(default)]
    pub is_favorite: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadCreateRequest {
    pub memory_id: i64,
    pub thread_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessageRequest {
    pub feedback_id: i64,
    pub message: String,
    #[serde(default = "default_true")]
    pub enhance_with_retrieval: bool,
    #[serde(default = "default_thread_max_results")]
    pub max_results: usize,
}

pub fn default_thread_max_results() -> usize {
    3
}
