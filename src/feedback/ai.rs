//! OpenAI-compatible chat client for AI-assisted feedback and essay grading.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::FeedbackError;

/// A message in a chat completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Anything that can answer a `(system, user)` prompt with text.
///
/// The AI feedback producer and the essay template both speak through this
/// seam, so tests can substitute a canned provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, FeedbackError>;
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiChatClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: Client,
    request_timeout: Duration,
}

impl OpenAiChatClient {
    /// Creates a client against an explicit endpoint.
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, FeedbackError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FeedbackError::RequestFailed(e.to_string()))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
            request_timeout: Duration::from_secs(45),
        })
    }

    /// Creates a client from environment variables.
    ///
    /// - `GRADEFORGE_AI_API_BASE` (required)
    /// - `GRADEFORGE_AI_API_KEY` (required)
    /// - `GRADEFORGE_AI_MODEL` (default `gpt-4o-mini`)
    pub fn from_env() -> Result<Self, FeedbackError> {
        let api_base = env::var("GRADEFORGE_AI_API_BASE").map_err(|_| FeedbackError::MissingApiBase)?;
        let api_key = env::var("GRADEFORGE_AI_API_KEY").map_err(|_| FeedbackError::MissingApiKey)?;
        let model =
            env::var("GRADEFORGE_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Self::new(api_base, Some(api_key), model)
    }

    /// Overrides the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, FeedbackError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: Some(0.2),
            max_tokens: Some(1024),
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let send = async {
            let response = builder
                .send()
                .await
                .map_err(|e| FeedbackError::RequestFailed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FeedbackError::RequestFailed(format!(
                    "API returned {status}: {body}"
                )));
            }

            let body: ChatResponse = response
                .json()
                .await
                .map_err(|e| FeedbackError::ParseError(e.to_string()))?;

            body.choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| FeedbackError::ParseError("empty choices".to_string()))
        };

        match tokio::time::timeout(self.request_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(FeedbackError::Timeout {
                seconds: self.request_timeout.as_secs(),
            }),
        }
    }
}
