//! Follow-up dialog threads rooted in a memory entry.
//!
//! A thread is the feedback row of a memory entry with `has_thread` set;
//! its first two messages are seeded from the entry's original question
//! and answer. Appends are serialized per thread so message order is
//! stable; different threads append in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use graphrag_schemas::{
    ChunkHit, ThreadDetail, ThreadMessage, ThreadMessageRequest, ThreadSummary,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::db::Store;
use crate::embeddings::EmbeddingProvider;
use crate::error::QueryError;
use crate::llm::{ChatOptions, ChatProvider};
use crate::qa;

/// Assistant turns from the history carried into a retrieval-enhanced
/// reply.
const HISTORY_ASSISTANT_TURNS: usize = 2;

pub struct ThreadManager {
    store: Arc<Mutex<Store>>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatProvider>,
    config: Config,
    /// Per-thread append locks; appends within one thread are serialized.
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

/// The two messages produced by an append.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub user_message: ThreadMessage,
    pub assistant_message: ThreadMessage,
    pub chunks: Vec<ChunkHit>,
}

impl ThreadManager {
    pub fn new(
        store: Arc<Mutex<Store>>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatProvider>,
        config: Config,
    ) -> Self {
        Self {
            store,
            embedder,
            chat,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, thread_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(thread_id).or_default().clone()
    }

    /// Create a thread for a memory entry, seeding the original question
    /// and answer as the first two messages.
    pub async fn create(&self, memory_id: i64, title: &str) -> Result<ThreadDetail, QueryError> {
        if title.trim().is_empty() {
            return Err(QueryError::BadInput("thread_title must not be empty".into()));
        }

        let store = self.store.lock().await;
        let entry = store
            .memory_get(memory_id)?
            .ok_or_else(|| QueryError::NotFound(format!("memory entry {memory_id}")))?;

        let thread_id = store.thread_create(memory_id, title.trim())?;

        store.append_thread_message(thread_id, &entry.question, true, &[], &[])?;
        store.append_thread_message(
            thread_id,
            &entry.answer,
            false,
            &entry.references,
            &entry.chunk_ids,
        )?;

        info!("created thread {thread_id} for memory entry {memory_id}");

        let (id, title, memory_id, original_query, original_answer, created_at) = store
            .thread_get(thread_id)?
            .ok_or_else(|| QueryError::Internal(format!("thread {thread_id} vanished")))?;
        let messages = store.thread_messages(id)?;

        Ok(ThreadDetail {
            id,
            title,
            memory_id,
            original_query,
            original_answer,
            messages,
            created_at,
        })
    }

    pub async fn list(&self) -> Result<Vec<ThreadSummary>, QueryError> {
        let store = self.store.lock().await;
        store.threads_list()
    }

    pub async fn get(&self, thread_id: i64) -> Result<ThreadDetail, QueryError> {
        let store = self.store.lock().await;
        let (id, title, memory_id, original_query, original_answer, created_at) = store
            .thread_get(thread_id)?
            .ok_or_else(|| QueryError::NotFound(format!("thread {thread_id}")))?;
        let messages = store.thread_messages(id)?;

        Ok(ThreadDetail {
            id,
            title,
            memory_id,
            original_query,
            original_answer,
            messages,
            created_at,
        })
    }

    /// Append a user turn and produce the assistant reply. With retrieval
    /// enhancement, the reply is grounded in freshly retrieved chunks and
    /// carries their references; otherwise it is conditioned on the
    /// visible thread history alone.
    pub async fn append(&self, request: &ThreadMessageRequest) -> Result<AppendResult, QueryError> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(QueryError::BadInput("message must not be empty".into()));
        }
        let k = request.max_results.clamp(1, 50);

        let lock = self.lock_for(request.feedback_id).await;
        let _guard = lock.lock().await;

        let history = {
            let store = self.store.lock().await;
            if !store.thread_exists(request.feedback_id)? {
                return Err(QueryError::NotFound(format!(
                    "thread {}",
                    request.feedback_id
                )));
            }
            store.thread_messages(request.feedback_id)?
        };

        let user_message = {
            let store = self.store.lock().await;
            store.append_thread_message(request.feedback_id, message, true, &[], &[])?
        };

        let enhance = request.enhance_with_retrieval && self.config.enable_dialog_retrieval;
        let (reply, references, chunk_ids, chunks) = if enhance {
            self.retrieval_reply(message, &history, k).await?
        } else {
            let reply = self.history_reply(message, &history).await?;
            (reply, vec![], vec![], vec![])
        };

        let assistant_message = {
            let store = self.store.lock().await;
            store.append_thread_message(
                request.feedback_id,
                &reply,
                false,
                &references,
                &chunk_ids,
            )?
        };

        Ok(AppendResult {
            user_message,
            assistant_message,
            chunks,
        })
    }

    /// Retrieval-enhanced reply: embed the new message, retrieve fresh
    /// chunks, and synthesize against them plus the recent assistant
    /// turns.
    async fn retrieval_reply(
        &self,
        message: &str,
        history: &[ThreadMessage],
        k: usize,
    ) -> Result<(String, Vec<String>, Vec<i64>, Vec<ChunkHit>), QueryError> {
        let qvec = self.embedder.embed(message).await?;
        let retrieved = {
            let store = self.store.lock().await;
            store.vector_search(&qvec, k, None)?
        };

        let recent_assistant: Vec<&ThreadMessage> = history
            .iter()
            .rev()
            .filter(|m| !m.is_user)
            .take(HISTORY_ASSISTANT_TURNS)
            .collect();

        let mut context = qa::build_context(&retrieved);
        if !recent_assistant.is_empty() {
            context.push_str("\n\nEarlier in this conversation you said:\n");
            for turn in recent_assistant.iter().rev() {
                context.push_str(&format!("- {}\n", turn.message));
            }
        }

        let prompt = format!(
            r#"Background documents:
{context}

Continue the conversation by answering the follow-up question below, using only the background documents and the earlier conversation. Cite the numbered documents with markers in the [1], [2] format when referencing them.

Follow-up question: "{message}"
Answer:"#
        );

        let options = ChatOptions {
            max_tokens: 500,
            temperature: 0.7,
            ..Default::default()
        };
        let reply = self
            .chat
            .complete(
                "You are a knowledgeable assistant continuing a conversation about documents. \
                 Provide helpful, accurate responses based on the conversation context.",
                &prompt,
                &options,
            )
            .await?;

        let references = qa::derive_references(&reply, &retrieved);
        let chunk_ids: Vec<i64> = retrieved.iter().map(|(chunk, _)| chunk.id).collect();
        let chunks = retrieved
            .into_iter()
            .map(|(chunk, similarity)| ChunkHit {
                id: chunk.id,
                text: chunk.text,
                source: chunk.source.source,
                similarity,
            })
            .collect();

        Ok((reply, references, chunk_ids, chunks))
    }

    /// Reply conditioned only on the visible thread history.
    async fn history_reply(
        &self,
        message: &str,
        history: &[ThreadMessage],
    ) -> Result<String, QueryError> {
        let rendered = history
            .iter()
            .map(|m| {
                let role = if m.is_user { "User" } else { "Assistant" };
                format!("{role}: {}", m.message)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"Conversation so far:
{rendered}

User: {message}
Assistant:"#
        );

        let options = ChatOptions {
            max_tokens: 500,
            temperature: 0.7,
            ..Default::default()
        };
        self.chat
            .complete(
                "You are a knowledgeable assistant continuing a conversation about documents. \
                 Provide helpful, accurate responses based on the conversation context.",
                &prompt,
                &options,
            )
            .await
    }
}
