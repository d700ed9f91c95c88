//! HTTP client for llama.cpp style servers.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{ChatRequest, CompletionBackend};
use crate::config::LlmConfig;
use crate::error::LlmError;

/// `GET /health` response.
#[derive(Debug, Deserialize)]
struct HealthStatus {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// [`CompletionBackend`] over `reqwest`.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    disable_health_check: bool,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|source| LlmError::Request {
                url: config.base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            disable_health_check: config.disable_health_check,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

/// Text of the first choice, only if the model stopped on its own.
fn completion_text(response: ChatResponse) -> Option<String> {
    let choice = response.choices.into_iter().next()?;
    if choice.finish_reason.as_deref() != Some("stop") {
        return None;
    }
    choice.message?.content
}

#[async_trait]
impl CompletionBackend for ChatClient {
    async fn health(&self) -> Result<bool, LlmError> {
        if self.disable_health_check {
            return Ok(true);
        }

        let url = self.url("health");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| LlmError::Request {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(LlmError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let status: HealthStatus = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(status
            .status
            .is_some_and(|s| s.eq_ignore_ascii_case("ok")))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, LlmError> {
        let url = self.url("v1/chat/completions");
        debug!(model = %request.model, "Requesting completion, this can take a while");

        let mut builder = self.http.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        let response = builder.send().await.map_err(|source| LlmError::Request {
            url: url.clone(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(LlmError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(completion_text(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    fn response(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn stop_finish_reason_yields_text() {
        let body = response(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Backup done"},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(completion_text(body).as_deref(), Some("Backup done"));
    }

    #[test]
    fn truncated_completion_is_refused() {
        let body = response(
            r#"{"choices":[{"message":{"role":"assistant","content":"Backup d"},"finish_reason":"length"}]}"#,
        );
        assert_eq!(completion_text(body), None);
    }

    #[test]
    fn empty_choices_yield_nothing() {
        assert_eq!(completion_text(response(r#"{"choices":[]}"#)), None);
        assert_eq!(completion_text(response(r#"{}"#)), None);
    }

    #[test]
    fn request_omits_unset_sampling_parameters() {
        let request = ChatRequest {
            model: "local".into(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            temperature: None,
            top_p: Some(0.9),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["top_p"], 0.9);
        assert_eq!(json["messages"][0]["role"], "system");
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let config: LlmConfig =
            serde_json::from_str(r#"{ "base_url": "http://llm:8080/" }"#).unwrap();
        let client = ChatClient::new(&config).unwrap();
        assert_eq!(client.url("health"), "http://llm:8080/health");
    }

    #[tokio::test]
    async fn disabled_health_check_reports_ready() {
        let config: LlmConfig = serde_json::from_str(
            r#"{ "base_url": "http://127.0.0.1:9", "disable_health_check": true }"#,
        )
        .unwrap();
        let client = ChatClient::new(&config).unwrap();
        assert!(client.health().await.unwrap());
    }
}
