//! Per-message decision pipeline.
//!
//! Flow, stopping at the first stage that settles the message:
//! 1. Normalize: HTML-only messages get a text part
//! 2. Void filter: discard
//! 3. Alert diversion: post to Alertmanager
//! 4. Recipient default: fill an empty `To`
//! 5. Subject rewrite: LLM subject from the body
//! 6. Send through the upstream connection

use std::io;

use tracing::{debug, error, info, warn};

use crate::alerting::AlertDiversion;
use crate::config::ForwarderConfig;
use crate::error::{ConfigError, TransportError};
use crate::forwarder::ConnectionManager;
use crate::llm::LlmAssistant;
use crate::pipeline::html::html_to_text;
use crate::pipeline::message::MailMessage;
use crate::pipeline::rules::{SubjectRules, VoidFilter};
use crate::store::MessageHandle;

pub const LLM_SUBJECT_HEADER: &str = "LLM-Subject";
pub const LLM_ORIGINAL_SUBJECT_HEADER: &str = "LLM-Original-Subject";

/// What happened to a message.
#[derive(Debug)]
pub enum Decision {
    /// Matched a void rule.
    Voided,
    /// Accepted by Alertmanager.
    Diverted,
    /// Accepted by the upstream relay.
    Sent,
    /// No `To` recipient and no default configured.
    NoRecipient,
    /// Forwarding is switched off.
    Disabled,
    /// The stored file is gone.
    Missing,
    /// The stored file could not be read.
    Unreadable(io::Error),
    /// The upstream relay refused the message for good.
    Rejected(TransportError),
    /// The upstream relay could not take the message.
    Failed(TransportError),
}

impl Decision {
    /// The message reached a definitive outcome and its file can go.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Voided | Self::Diverted | Self::Sent | Self::Rejected(_)
        )
    }

    /// Worth another attempt on the next idle tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(e) if e.is_network())
    }
}

/// Filters, diverts and enriches messages before they are sent.
pub struct DecisionPipeline {
    void: VoidFilter,
    alerts: Option<AlertDiversion>,
    subject_rules: SubjectRules,
    subject_helper: Option<LlmAssistant>,
    default_recipient: Option<String>,
    forwarding_disabled: bool,
}

impl DecisionPipeline {
    pub fn new(
        config: &ForwarderConfig,
        alerts: Option<AlertDiversion>,
        subject_helper: Option<LlmAssistant>,
    ) -> Result<Self, ConfigError> {
        let subject_rules = SubjectRules::from_config(&config.llm_enrichment)?;
        if !subject_rules.is_empty() && subject_helper.is_none() {
            warn!("Subject rules are configured but no LLM is, subjects are left unchanged");
        }
        Ok(Self {
            void: VoidFilter::from_config(&config.void)?,
            alerts,
            subject_rules,
            subject_helper,
            default_recipient: config.default_recipient.clone().filter(|r| !r.is_empty()),
            forwarding_disabled: config.disable,
        })
    }

    /// Run a stored message through every stage.
    pub async fn process(
        &self,
        handle: &MessageHandle,
        connection: &mut ConnectionManager,
    ) -> Decision {
        let raw = match tokio::fs::read(&handle.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Decision::Missing,
            Err(e) => {
                error!(id = %handle.id, path = %handle.path.display(), error = %e, "Failed to read stored message");
                return Decision::Unreadable(e);
            }
        };

        let mut message = MailMessage::parse(raw);
        if let Some(decision) = self.prepare(&mut message).await {
            return decision;
        }
        self.send(handle, &message, connection).await
    }

    /// Stages before the send. `Some` when a stage settled the message.
    pub async fn prepare(&self, message: &mut MailMessage) -> Option<Decision> {
        normalize_body(message);

        if self.void.matches(message) {
            info!(subject = %message.subject(), "Message sent to void");
            return Some(Decision::Voided);
        }

        if let Some(alerts) = &self.alerts
            && alerts.try_divert(message).await
        {
            return Some(Decision::Diverted);
        }

        if message.to().is_empty() {
            let Some(recipient) = &self.default_recipient else {
                warn!(subject = %message.subject(), "No recipient and no default recipient, message kept");
                return Some(Decision::NoRecipient);
            };
            debug!(to = %recipient, subject = %message.subject(), "Using default recipient");
            message.set_default_recipient(recipient.clone());
        }

        self.rewrite_subject(message).await;
        None
    }

    async fn rewrite_subject(&self, message: &mut MailMessage) {
        let Some(helper) = &self.subject_helper else {
            return;
        };
        let Some(rule) = self.subject_rules.first_match(message) else {
            return;
        };
        let Some(body) = message.text_body().map(str::to_string) else {
            return;
        };

        let Some(subject) = helper
            .condense(self.subject_rules.prompt_for(rule), &body)
            .await
        else {
            return;
        };
        let subject = format!("{}{subject}", rule.prefix.as_deref().unwrap_or_default());
        let original = message.subject().to_string();
        debug!(original = %original, subject = %subject, "Subject rewritten");

        message.add_header(LLM_SUBJECT_HEADER, "1".to_string());
        message.add_header(LLM_ORIGINAL_SUBJECT_HEADER, original);
        message.set_subject(subject);
    }

    async fn send(
        &self,
        handle: &MessageHandle,
        message: &MailMessage,
        connection: &mut ConnectionManager,
    ) -> Decision {
        if self.forwarding_disabled {
            warn!(
                id = %handle.id,
                to = ?message.to(),
                subject = %message.subject(),
                "Message not sent because forwarding is disabled"
            );
            return Decision::Disabled;
        }

        let envelope = message.envelope();
        match connection.send(&envelope, &message.to_bytes()).await {
            Ok(()) => {
                info!(id = %handle.id, to = ?envelope.to, subject = %message.subject(), "Message forwarded");
                Decision::Sent
            }
            Err(e) if e.is_rejection() && !connection.is_permanently_failed() => {
                error!(
                    id = %handle.id,
                    to = ?envelope.to,
                    subject = %message.subject(),
                    error = %e,
                    "Message rejected by upstream relay, discarding"
                );
                Decision::Rejected(e)
            }
            Err(e) => {
                error!(id = %handle.id, path = %handle.path.display(), error = %e, "Failed to forward message");
                Decision::Failed(e)
            }
        }
    }
}

/// Give HTML-only messages a plain text part.
fn normalize_body(message: &mut MailMessage) {
    if message.text_body().is_some() {
        return;
    }
    let Some(html) = message.html_body() else {
        return;
    };
    let text = html_to_text(html);
    if text.trim().is_empty() {
        info!(subject = %message.subject(), "Unable to convert HTML body into text");
        return;
    }
    message.attach_text_part(text);
    debug!(subject = %message.subject(), "Included a text part converted from HTML body");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder_config(json: &str) -> ForwarderConfig {
        serde_json::from_str(json).unwrap()
    }

    fn message(headers: &str, body: &str) -> MailMessage {
        MailMessage::parse(format!("{headers}\r\n\r\n{body}\r\n").into_bytes())
    }

    #[tokio::test]
    async fn html_only_message_gets_text_body() {
        let pipeline =
            DecisionPipeline::new(&forwarder_config(r#"{ "hostname": "smtp" }"#), None, None)
                .unwrap();
        let mut msg = message(
            "From: a@example.com\r\nTo: b@example.com\r\nSubject: Hi\r\nContent-Type: text/html",
            "<p>Disk <b>full</b></p>",
        );

        assert!(pipeline.prepare(&mut msg).await.is_none());
        assert_eq!(msg.text_body().map(str::trim), Some("Disk full"));
    }

    #[tokio::test]
    async fn void_match_stops_pipeline() {
        let pipeline = DecisionPipeline::new(
            &forwarder_config(
                r#"{ "hostname": "smtp", "void": { "matchers": [{ "regex": "^heartbeat", "regex_on_field": ["subject"] }] } }"#,
            ),
            None,
            None,
        )
        .unwrap();
        let mut msg = message("From: a@example.com\r\nSubject: heartbeat 12:00", "ok");
        assert!(matches!(
            pipeline.prepare(&mut msg).await,
            Some(Decision::Voided)
        ));
    }

    #[tokio::test]
    async fn empty_to_uses_default_recipient() {
        let pipeline = DecisionPipeline::new(
            &forwarder_config(r#"{ "hostname": "smtp", "default_recipient": "ops@example.com" }"#),
            None,
            None,
        )
        .unwrap();
        let mut msg = message("From: cron@host\r\nSubject: Cron output", "done");

        assert!(pipeline.prepare(&mut msg).await.is_none());
        assert_eq!(msg.to(), vec!["ops@example.com"]);
        assert_eq!(msg.envelope().to, vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn empty_to_without_default_is_kept() {
        let pipeline =
            DecisionPipeline::new(&forwarder_config(r#"{ "hostname": "smtp" }"#), None, None)
                .unwrap();
        let mut msg = message("From: cron@host\r\nSubject: Cron output", "done");
        let decision = pipeline.prepare(&mut msg).await.unwrap();
        assert!(matches!(decision, Decision::NoRecipient));
        assert!(!decision.is_final());
    }

    #[test]
    fn only_network_failures_are_retried() {
        assert!(Decision::Failed(TransportError::network("reset")).is_retryable());
        assert!(!Decision::Failed(TransportError::protocol("451")).is_retryable());
        assert!(!Decision::Failed(TransportError::protocol("451")).is_final());
        assert!(!Decision::Sent.is_retryable());
        assert!(Decision::Diverted.is_final());
        assert!(!Decision::Missing.is_final());
    }

    #[test]
    fn permanent_rejection_is_final() {
        let decision = Decision::Rejected(TransportError::rejected("550 5.1.1 mailbox unknown"));
        assert!(decision.is_final());
        assert!(!decision.is_retryable());
    }
}
