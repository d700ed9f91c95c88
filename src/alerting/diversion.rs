//! Pipeline stage that posts matching messages as alerts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use super::{AlertBackend, AlertRules, FORWARDED_BY_LABEL, FORWARDED_BY_VALUE};
use crate::config::AlertmanagerConfig;
use crate::error::ConfigError;
use crate::llm::LlmAssistant;
use crate::pipeline::message::MailMessage;

/// Subject prefix of Alertmanager's own email notifications.
const FIRING_PREFIX: &str = "[FIRING:";

/// Turns messages into alerts when a rule matches.
///
/// Readiness of the backend is checked lazily and remembered until a post
/// fails.
pub struct AlertDiversion {
    backend: Arc<dyn AlertBackend>,
    rules: AlertRules,
    disable: bool,
    summarizer: Option<LlmAssistant>,
    ready: AtomicBool,
}

impl AlertDiversion {
    pub fn new(
        config: &AlertmanagerConfig,
        backend: Arc<dyn AlertBackend>,
        summarizer: Option<LlmAssistant>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            backend,
            rules: AlertRules::from_config(config)?,
            disable: config.disable,
            summarizer,
            ready: AtomicBool::new(false),
        })
    }

    /// Post `message` as an alert. `true` only when the alert was accepted;
    /// on `false` the message continues down the pipeline.
    pub async fn try_divert(&self, message: &MailMessage) -> bool {
        if self.disable || is_relay_loop(message) {
            return false;
        }
        let Some(draft) = self.rules.evaluate(message) else {
            return false;
        };
        if !self.ensure_ready().await {
            return false;
        }

        let summary = match (&self.summarizer, message.text_body()) {
            (Some(summarizer), Some(body)) if draft.wants_summary() => {
                summarizer.condense(draft.prompt.as_deref(), body).await
            }
            _ => None,
        };
        let alert = draft.finish(message, summary);

        match self.backend.post_alert(&alert).await {
            Ok(()) => {
                info!(
                    alertname = alert.name().unwrap_or_default(),
                    subject = %message.subject(),
                    "Message forwarded to Alertmanager"
                );
                true
            }
            Err(e) => {
                self.ready.store(false, Ordering::Release);
                error!(subject = %message.subject(), error = %e, "Failed to send alert to Alertmanager");
                false
            }
        }
    }

    async fn ensure_ready(&self) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return true;
        }
        match self.backend.is_ready().await {
            Ok(true) => {
                info!("Alertmanager is ready");
                self.ready.store(true, Ordering::Release);
                true
            }
            Ok(false) => {
                warn!("Alertmanager is not ready");
                false
            }
            Err(e) => {
                error!(error = %e, "Alertmanager is not ready");
                false
            }
        }
    }
}

/// Messages that came out of Alertmanager must not go back into it.
fn is_relay_loop(message: &MailMessage) -> bool {
    if let Some(body) = message.text_body()
        && let Some(at) = body.find(FORWARDED_BY_LABEL)
        && body[at..].contains(FORWARDED_BY_VALUE)
    {
        debug!(subject = %message.subject(), "Message carries the relay's own alert label");
        return true;
    }
    message.subject().starts_with(FIRING_PREFIX)
}
