//! Chat-completion client for the answering stages.
//!
//! All model calls go through the `ChatProvider` trait so the pipeline can
//! be driven by a stub in tests. The OpenAI implementation bounds the
//! number of in-flight completions across every request with a semaphore.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::QueryError;

/// Per-call completion options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Override the configured generation model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Idempotent calls (classification, verification) get one retry with
    /// backoff; synthesis never does.
    pub idempotent: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 600,
            temperature: 0.6,
            idempotent: false,
        }
    }
}

/// The structured shapes the pipeline asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// A bare Yes/No judgment.
    YesNo,
    /// A numeric grounding score in [0, 1].
    Score,
    /// An enumerated list of questions.
    Questions,
}

/// A parsed structured reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    Decision(bool),
    Score(f64),
    Questions(Vec<String>),
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Free-form completion with system and user messages.
    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &ChatOptions,
    ) -> Result<String, QueryError>;

    /// Completion whose reply must parse into one of the known shapes.
    async fn complete_structured(
        &self,
        system: &str,
        user: &str,
        shape: ReplyShape,
        options: &ChatOptions,
    ) -> Result<ParsedReply, QueryError> {
        let reply = self.complete(system, user, options).await?;
        parse_reply(&reply, shape)
    }
}

/// Leniently parse a model reply into the requested shape.
pub fn parse_reply(reply: &str, shape: ReplyShape) -> Result<ParsedReply, QueryError> {
    match shape {
        ReplyShape::YesNo => parse_yes_no(reply).map(ParsedReply::Decision),
        ReplyShape::Score => parse_score(reply).map(ParsedReply::Score),
        ReplyShape::Questions => parse_questions(reply).map(ParsedReply::Questions),
    }
}

/// Extract the first yes/no token from a reply.
pub fn parse_yes_no(reply: &str) -> Result<bool, QueryError> {
    for token in reply.split(|c: char| !c.is_alphanumeric()) {
        match token.to_lowercase().as_str() {
            "yes" => return Ok(true),
            "no" => return Ok(false),
            _ => {}
        }
    }
    Err(QueryError::LlmParse(format!(
        "no yes/no token in reply: {}",
        truncate(reply, 120)
    )))
}

/// Extract the first numeric score from a reply, clamped to [0, 1].
///
/// Accepts a bare yes/no as a coarse score, matching how older prompt
/// variants phrased the verification question.
pub fn parse_score(reply: &str) -> Result<f64, QueryError> {
    let mut current = String::new();
    for c in reply.chars() {
        if c.is_ascii_digit() || c == '.' {
            current.push(c);
        } else if !current.is_empty() {
            break;
        }
    }
    let current = current.trim_end_matches('.');
    if !current.is_empty() {
        if let Ok(value) = current.parse::<f64>() {
            return Ok(value.clamp(0.0, 1.0));
        }
    }
    match parse_yes_no(reply) {
        Ok(true) => Ok(0.9),
        Ok(false) => Ok(0.1),
        Err(_) => Err(QueryError::LlmParse(format!(
            "no score in reply: {}",
            truncate(reply, 120)
        ))),
    }
}

/// Parse an enumerated or bulleted list of questions, one per line.
pub fn parse_questions(reply: &str) -> Result<Vec<String>, QueryError> {
    let questions: Vec<String> = reply
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*' | ' ')
                })
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && !line.to_lowercase().starts_with("subquestion"))
        .collect();

    if questions.is_empty() {
        return Err(QueryError::LlmParse(format!(
            "no questions in reply: {}",
            truncate(reply, 120)
        )));
    }
    Ok(questions)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

// ============================================================================
// OpenAI implementation
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    inflight: Arc<Semaphore>,
}

impl OpenAiChat {
    pub fn new(
        api_key: String,
        model: String,
        endpoint: String,
        max_inflight: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint,
            api_key,
            model,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    async fn call_once(
        &self,
        system: &str,
        user: &str,
        options: &ChatOptions,
    ) -> Result<String, QueryError> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;

        let request = ChatRequest {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Upstream(format!(
                "chat completion failed with {status}: {}",
                truncate(&body, 200)
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| QueryError::Upstream(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| QueryError::Upstream("empty completion".to_string()))
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: &ChatOptions,
    ) -> Result<String, QueryError> {
        match self.call_once(system, user, options).await {
            Ok(reply) => Ok(reply),
            Err(e) if options.idempotent => {
                warn!("completion failed, retrying once: {e}");
                tokio::time::sleep(retry_backoff()).await;
                self.call_once(system, user, options).await
            }
            Err(e) => Err(e),
        }
    }
}

/// Backoff before the single retry: 500ms plus jitter.
pub(crate) fn retry_backoff() -> Duration {
    let jitter: u64 = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(500 + jitter)
}
