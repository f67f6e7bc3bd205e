//! LLM-backed scorer using an OpenAI-compatible chat completion API

use super::traits::RelevanceScorer;
use crate::config::LlmScorerConfig;
use crate::error::ScoringError;
use crate::types::CandidateLink;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You rate how relevant a downloadable document is to a research topic. \
     Reply with a JSON object of the form {\"relevance\": <number between 0 and 1>} and nothing else.";

const DEFAULT_TOPIC: &str = "public records and official reports";

/// Scorer that asks a language model for a relevance estimate
pub struct LlmScorer {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    topic: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmScorer {
    /// Create a scorer from configuration
    pub fn new(config: &LlmScorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to build scorer HTTP client: {e}")))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            topic: config
                .topic
                .clone()
                .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            timeout: config.timeout,
            client,
        })
    }

    fn user_prompt(&self, candidate: &CandidateLink) -> String {
        let mut prompt = format!(
            "Topic: {}\nSite: {}\nURL: {}\nFile type: {}\n",
            self.topic, candidate.site_name, candidate.url, candidate.file_type
        );
        if let Some(title) = candidate.title.as_deref() {
            prompt.push_str(&format!("Title: {title}\n"));
        }
        if let Some(published) = candidate.published_at {
            prompt.push_str(&format!("Published: {}\n", published.format("%Y-%m-%d")));
        }
        prompt
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ScoringError {
        if e.is_timeout() {
            ScoringError::Timeout(self.timeout)
        } else {
            ScoringError::Unavailable(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct RelevanceReply {
    relevance: f64,
}

/// Pull `{"relevance": x}` out of the model's reply, tolerating code fences
fn parse_relevance(content: &str) -> std::result::Result<f64, ScoringError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &content[s..=e],
        _ => {
            return Err(ScoringError::Unavailable(format!(
                "reply contains no JSON object: {content}"
            )));
        }
    };

    let reply: RelevanceReply = serde_json::from_str(json)
        .map_err(|e| ScoringError::Unavailable(format!("malformed relevance reply: {e}")))?;

    if !reply.relevance.is_finite() {
        return Err(ScoringError::Unavailable("relevance is not a number".into()));
    }
    Ok(reply.relevance.clamp(0.0, 1.0))
}

#[async_trait]
impl RelevanceScorer for LlmScorer {
    async fn score(&self, candidate: &CandidateLink) -> std::result::Result<f64, ScoringError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: self.user_prompt(candidate),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScoringError::Unavailable(format!(
                "scorer endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ScoringError::Unavailable("empty completion".into()))?;

        let score = parse_relevance(&content)?;
        tracing::debug!(url = %candidate.url, score, "LLM relevance score");
        Ok(score)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}
