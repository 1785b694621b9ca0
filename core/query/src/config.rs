use anyhow::{bail, Result};

/// Service configuration, read from the environment once at startup and
/// passed explicitly to the pipeline and clients.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub generation_model: String,

    pub enable_memory: bool,
    pub memory_similarity_threshold: f64,

    pub enable_chunk_classification: bool,
    pub enable_subquestion_amplification: bool,
    pub enable_answer_verification: bool,
    pub enable_dialog_retrieval: bool,

    /// Reserved for scored classifier variants; the binary Yes/No
    /// classifier does not consult it.
    pub chunk_relevance_threshold: f64,
    pub verification_threshold: f64,
    pub max_subquestions: usize,
    pub amplification_min_context_length: usize,

    pub classify_concurrency: usize,
    pub subq_concurrency: usize,
    pub llm_max_inflight: usize,

    pub llm_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub pipeline_deadline_secs: u64,
}

impl Config {
    /// Load configuration from the environment. Fails when the upstream
    /// credential is missing; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let openai_api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY is not set"),
        };

        Ok(Self {
            openai_api_key,
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            generation_model: env_or("GENERATION_MODEL", "gpt-4o"),

            enable_memory: env_flag("ENABLE_MEMORY", true),
            memory_similarity_threshold: env_parsed("MEMORY_SIMILARITY_THRESHOLD", 0.95),

            enable_chunk_classification: env_flag("ENABLE_CHUNK_CLASSIFICATION", true),
            enable_subquestion_amplification: env_flag("ENABLE_SUBQUESTION_AMPLIFICATION", true),
            enable_answer_verification: env_flag("ENABLE_ANSWER_VERIFICATION", true),
            enable_dialog_retrieval: env_flag("ENABLE_DIALOG_RETRIEVAL", true),

            chunk_relevance_threshold: env_parsed("CHUNK_RELEVANCE_THRESHOLD", 0.5),
            verification_threshold: env_parsed("VERIFICATION_THRESHOLD", 0.7),
            max_subquestions: env_parsed("MAX_SUBQUESTIONS", 4),
            amplification_min_context_length: env_parsed("AMPLIFICATION_MIN_CONTEXT_LENGTH", 500),

            classify_concurrency: env_parsed("CLASSIFY_CONCURRENCY", 8),
            subq_concurrency: env_parsed("SUBQ_CONCURRENCY", 4),
            llm_max_inflight: env_parsed("LLM_MAX_INFLIGHT", 16),

            llm_timeout_secs: env_parsed("LLM_TIMEOUT_SECS", 30),
            embed_timeout_secs: env_parsed("EMBED_TIMEOUT_SECS", 10),
            pipeline_deadline_secs: env_parsed("PIPELINE_DEADLINE_SECS", 60),
        })
    }

    /// Defaults with a placeholder credential, for tests.
    pub fn for_tests() -> Self {
        Self {
            openai_api_key: "test-key".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            generation_model: "gpt-4o".to_string(),
            enable_memory: true,
            memory_similarity_threshold: 0.95,
            enable_chunk_classification: true,
            enable_subquestion_amplification: true,
            enable_answer_verification: true,
            enable_dialog_retrieval: true,
            chunk_relevance_threshold: 0.5,
            verification_threshold: 0.7,
            max_subquestions: 4,
            amplification_min_context_length: 500,
            classify_concurrency: 8,
            subq_concurrency: 4,
            llm_max_inflight: 16,
            llm_timeout_secs: 30,
            embed_timeout_secs: 10,
            pipeline_deadline_secs: 60,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value.to_lowercase() == "true",
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
