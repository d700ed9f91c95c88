//! Notification message stored when the relay starts.
//!
//! Gives operators a cheap end-to-end check: if the notification arrives,
//! the store, the forwarder and the upstream relay all work.

use chrono::Local;
use lettre::Message;
use lettre::message::Mailbox;
use tracing::info;

use crate::config::StartupNotificationConfig;
use crate::error::{ConfigError, Result};
use crate::store::{Envelope, MessageHandle, MessageStore};

/// Build the notification. The sender defaults to the recipient and the
/// body to the current time.
pub fn build_notification(config: &StartupNotificationConfig) -> Result<(Envelope, Vec<u8>)> {
    let from = config.from.as_deref().unwrap_or(&config.to);
    let from_mailbox: Mailbox = from
        .parse()
        .map_err(|e| ConfigError::invalid("startup_notification.from", e))?;
    let to_mailbox: Mailbox = config
        .to
        .parse()
        .map_err(|e| ConfigError::invalid("startup_notification.to", e))?;

    let body = match config.body.as_deref() {
        Some(body) if !body.is_empty() => body.to_string(),
        _ => format!("Current time: {}", Local::now().to_rfc2822()),
    };

    let sender = from_mailbox.email.to_string();
    let recipient = to_mailbox.email.to_string();
    let envelope = Envelope::new(Some(&sender), &[&recipient]);
    let message = Message::builder()
        .from(from_mailbox)
        .to(to_mailbox)
        .subject(config.subject.clone())
        .body(body)
        .map_err(|e| ConfigError::invalid("startup_notification", e))?;

    Ok((envelope, message.formatted()))
}

/// Store the notification. A failure here aborts startup.
pub async fn send_notification(
    store: &MessageStore,
    config: &StartupNotificationConfig,
) -> Result<MessageHandle> {
    info!(to = %config.to, "Sending startup notification");
    let (envelope, bytes) = build_notification(config)?;
    Ok(store.save_internal(envelope, &bytes).await?)
}
