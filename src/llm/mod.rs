//! LLM integration.
//!
//! The relay asks an OpenAI-compatible chat completion server (llama.cpp,
//! vLLM, ...) for short texts: a better subject for a forwarded message, or
//! a one-sentence summary for an alert description.
//!
//! [`CompletionBackend`] is the seam; [`ChatClient`] speaks HTTP and
//! [`LlmAssistant`] adds prompts, readiness caching and the output guard.

mod assistant;
mod client;

pub use assistant::LlmAssistant;
pub use client::ChatClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub const SYSTEM_ROLE: &str = "system";
pub const USER_ROLE: &str = "user";

/// One message of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: SYSTEM_ROLE.to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: USER_ROLE.to_string(),
            content: content.into(),
        }
    }
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

/// A chat completion server.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// `Ok(true)` when the server reports itself ready.
    async fn health(&self) -> Result<bool, LlmError>;

    /// Completion text, or `None` when the model did not finish normally.
    async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, LlmError>;
}
