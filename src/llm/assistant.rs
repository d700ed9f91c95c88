//! Prompted helpers on top of a [`CompletionBackend`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use super::{ChatMessage, ChatRequest, CompletionBackend};
use crate::config::ChatSettings;

const DEFAULT_MODEL: &str = "local-model";

/// Placeholder replaced by the message content in prompt templates.
pub const BODY_PLACEHOLDER: &str = "{body}";

const SUBJECT_SYSTEM_PROMPT: &str = "Answer the user's instruction directly with one short sentence of fewer than 45 characters. \
No introduction, no formatting, no closing remark.";

const SUBJECT_USER_TEMPLATE: &str = "### Instruction:

Write a fitting email subject for the email body below, in the same language as the body. Reply with the subject text only.

{body}

### Response:
";

const SUMMARY_SYSTEM_PROMPT: &str = "Answer the user's instruction directly with one short sentence of fewer than 250 characters. \
No introduction, no formatting, no closing remark.";

const SUMMARY_USER_TEMPLATE: &str = "### Instruction:

Find the one or two most important sentences in the content below and condense them into a single sentence.

{body}

### Response:
";

/// One prompted use of the LLM with its own readiness cache.
///
/// Readiness is checked once and remembered until a completion request
/// fails. Every failure is logged and turns into `None`; callers fall back
/// to the original text.
pub struct LlmAssistant {
    backend: Arc<dyn CompletionBackend>,
    purpose: &'static str,
    model: String,
    system_prompt: String,
    user_template: &'static str,
    temperature: Option<f64>,
    top_p: Option<f64>,
    ready: AtomicBool,
}

impl LlmAssistant {
    /// Rewrites subjects of forwarded messages.
    pub fn subject_helper(backend: Arc<dyn CompletionBackend>, settings: &ChatSettings) -> Self {
        Self::new(backend, "subject", settings, SUBJECT_SYSTEM_PROMPT, SUBJECT_USER_TEMPLATE)
    }

    /// Summarizes message bodies into alert descriptions.
    pub fn alert_summarizer(backend: Arc<dyn CompletionBackend>, settings: &ChatSettings) -> Self {
        Self::new(backend, "alert-summary", settings, SUMMARY_SYSTEM_PROMPT, SUMMARY_USER_TEMPLATE)
    }

    fn new(
        backend: Arc<dyn CompletionBackend>,
        purpose: &'static str,
        settings: &ChatSettings,
        system_prompt: &str,
        user_template: &'static str,
    ) -> Self {
        Self {
            backend,
            purpose,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: settings
                .system_prompt
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| system_prompt.to_string()),
            user_template,
            temperature: settings.temperature,
            top_p: settings.top_p,
            ready: AtomicBool::new(false),
        }
    }

    /// Build the request for `content`, using `template` when given.
    pub fn request(&self, template: Option<&str>, content: &str) -> ChatRequest {
        let prompt = template
            .unwrap_or(self.user_template)
            .replace(BODY_PLACEHOLDER, content);
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(self.system_prompt.clone()),
                ChatMessage::user(prompt),
            ],
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }

    /// Ask for a short replacement of `content`.
    ///
    /// The answer is flattened to one line and accepted only when shorter
    /// than `content`; anything longer means the prompt went wrong.
    pub async fn condense(&self, template: Option<&str>, content: &str) -> Option<String> {
        let request = self.request(template, content);
        let completion = self.complete(&request).await?;

        let text = completion
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            return None;
        }
        if text.chars().count() >= content.chars().count() {
            warn!(
                purpose = self.purpose,
                "Discarding LLM answer longer than its input, check the prompt"
            );
            return None;
        }
        Some(text)
    }

    async fn ensure_ready(&self) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return true;
        }
        match self.backend.health().await {
            Ok(true) => {
                info!(purpose = self.purpose, "LLM is ready");
                self.ready.store(true, Ordering::Release);
                true
            }
            Ok(false) => {
                warn!(purpose = self.purpose, "LLM is not ready");
                false
            }
            Err(e) => {
                error!(purpose = self.purpose, error = %e, "LLM health check failed");
                false
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Option<String> {
        if !self.ensure_ready().await {
            return None;
        }
        match self.backend.complete(request).await {
            Ok(Some(text)) => Some(text),
            Ok(None) => {
                info!(purpose = self.purpose, "LLM did not finish its answer");
                None
            }
            Err(e) => {
                self.ready.store(false, Ordering::Release);
                error!(purpose = self.purpose, error = %e, "LLM request failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::error::LlmError;

    struct StubBackend {
        healthy: bool,
        answers: Mutex<Vec<Result<Option<String>, LlmError>>>,
        health_calls: AtomicUsize,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl StubBackend {
        fn new(healthy: bool, answers: Vec<Result<Option<String>, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                healthy,
                answers: Mutex::new(answers),
                health_calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for StubBackend {
        async fn health(&self) -> Result<bool, LlmError> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.healthy)
        }

        async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Ok(None)
            } else {
                answers.remove(0)
            }
        }
    }

    const BODY: &str = "The nightly backup of db1 finished successfully after 42 minutes.";

    #[tokio::test]
    async fn short_answer_is_accepted_and_flattened() {
        let backend = StubBackend::new(true, vec![Ok(Some("  Backup\n done  ".into()))]);
        let helper = LlmAssistant::subject_helper(backend.clone(), &ChatSettings::default());

        assert_eq!(helper.condense(None, BODY).await.as_deref(), Some("Backup done"));

        let request = &backend.requests.lock().unwrap()[0];
        assert_eq!(request.model, DEFAULT_MODEL);
        assert_eq!(request.messages[0].content, SUBJECT_SYSTEM_PROMPT);
        assert!(request.messages[1].content.contains(BODY));
    }

    #[tokio::test]
    async fn answer_longer_than_input_is_discarded() {
        let backend = StubBackend::new(true, vec![Ok(Some(format!("{BODY} and more")))]);
        let helper = LlmAssistant::subject_helper(backend, &ChatSettings::default());
        assert_eq!(helper.condense(None, BODY).await, None);
    }

    #[tokio::test]
    async fn unhealthy_backend_is_not_queried() {
        let backend = StubBackend::new(false, vec![Ok(Some("x".into()))]);
        let helper = LlmAssistant::alert_summarizer(backend.clone(), &ChatSettings::default());

        assert_eq!(helper.condense(None, BODY).await, None);
        assert!(backend.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn readiness_is_cached_until_a_request_fails() {
        let backend = StubBackend::new(
            true,
            vec![
                Ok(Some("one".into())),
                Err(LlmError::InvalidResponse {
                    url: "http://llm".into(),
                    reason: "boom".into(),
                }),
                Ok(Some("three".into())),
            ],
        );
        let helper = LlmAssistant::alert_summarizer(backend.clone(), &ChatSettings::default());

        assert!(helper.condense(None, BODY).await.is_some());
        assert!(helper.condense(None, BODY).await.is_none());
        assert!(helper.condense(None, BODY).await.is_some());
        assert_eq!(backend.health_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn custom_template_and_settings_are_used() {
        let backend = StubBackend::new(true, vec![]);
        let settings = ChatSettings {
            model: Some("qwen".into()),
            temperature: Some(0.1),
            top_p: None,
            system_prompt: Some("Be terse.".into()),
        };
        let helper = LlmAssistant::subject_helper(backend, &settings);

        let request = helper.request(Some("Subject for: {body}"), "disk full");
        assert_eq!(request.model, "qwen");
        assert_eq!(request.temperature, Some(0.1));
        assert_eq!(request.messages[0].content, "Be terse.");
        assert_eq!(request.messages[1].content, "Subject for: disk full");
    }
}
