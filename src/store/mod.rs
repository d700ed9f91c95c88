//! Durable message store.
//!
//! Every accepted message is persisted here before the front end answers
//! with `250`. The store is the only source of truth for undelivered mail:
//! the forwarding queue holds handles, never content, and whatever is left
//! on disk at startup is fed back to the forwarder by [`MessageStore::catch_up`].

mod catch_up;
pub(crate) mod files;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mail_parser::{Address, MessageParser};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::breaker::Breaker;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::forwarder::ForwardingQueue;

/// SMTP envelope of an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// `None` is the null reverse path (`MAIL FROM:<>`).
    pub from: Option<String>,
    pub to: Vec<String>,
    pub size: u64,
}

impl Envelope {
    pub fn new(from: Option<&str>, to: &[&str]) -> Self {
        Self {
            from: from.map(str::to_string),
            to: to.iter().map(|s| s.to_string()).collect(),
            size: 0,
        }
    }

    /// Derive an envelope from the message headers: `From` for the sender,
    /// `To`, `Cc` and `Bcc` for the recipients.
    pub fn from_headers(bytes: &[u8]) -> Self {
        let size = bytes.len() as u64;
        let Some(parsed) = MessageParser::default().parse(bytes) else {
            return Self {
                size,
                ..Self::default()
            };
        };

        let from = address_list(parsed.from()).into_iter().next();
        let mut to = address_list(parsed.to());
        to.extend(address_list(parsed.cc()));
        to.extend(address_list(parsed.bcc()));
        Self { from, to, size }
    }
}

/// Flatten an address header into bare addresses, groups included.
pub(crate) fn address_list(header: Option<&Address<'_>>) -> Vec<String> {
    let Some(header) = header else {
        return Vec::new();
    };
    let addrs: Vec<&mail_parser::Addr<'_>> = match header {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|a| a.address.as_deref())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reference to a stored message. Does not own the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub id: Uuid,
    pub path: PathBuf,
    pub envelope: Envelope,
}

/// Reply given to the SMTP front end for a submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptCode {
    Accepted,
    ServiceUnavailable,
    MailboxUnavailable,
    SizeLimitExceeded,
    BadEmailAddress,
}

impl AcceptCode {
    /// SMTP reply code.
    pub fn code(self) -> u16 {
        match self {
            Self::Accepted => 250,
            Self::ServiceUnavailable => 421,
            Self::MailboxUnavailable => 550,
            Self::SizeLimitExceeded => 552,
            Self::BadEmailAddress => 501,
        }
    }
}

impl From<&StoreError> for AcceptCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::ServiceUnavailable | StoreError::Io(_) => Self::ServiceUnavailable,
            StoreError::SizeLimitExceeded { .. } => Self::SizeLimitExceeded,
            StoreError::MailboxUnavailable { .. } => Self::MailboxUnavailable,
            StoreError::BadEmailAddress => Self::BadEmailAddress,
        }
    }
}

/// File-backed message store.
pub struct MessageStore {
    config: StoreConfig,
    /// Lower-cased.
    whitelist: HashSet<String>,
    breaker: Breaker,
    queue: ForwardingQueue,
}

impl MessageStore {
    pub fn new(config: StoreConfig, breaker: Breaker, queue: ForwardingQueue) -> Self {
        let whitelist = config
            .destination_whitelist
            .iter()
            .map(|a| a.trim().to_lowercase())
            .collect();
        Self {
            config,
            whitelist,
            breaker,
            queue,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Persist a message and hand it to the forwarder.
    ///
    /// Returns once the bytes are on disk. A full forwarding queue does not
    /// fail the call; the file stays in the store until the next catch-up.
    pub async fn save(
        &self,
        envelope: Envelope,
        bytes: &[u8],
    ) -> Result<MessageHandle, StoreError> {
        self.check_breaker()?;
        self.check_policy(&envelope, bytes.len() as u64)?;
        self.persist_and_admit(envelope, bytes).await
    }

    /// Front-end entry point: [`save`](Self::save) mapped onto a reply code.
    pub async fn accept(&self, envelope: Envelope, bytes: &[u8]) -> AcceptCode {
        let from = envelope.from.clone().unwrap_or_default();
        match self.save(envelope, bytes).await {
            Ok(handle) => {
                info!(id = %handle.id, from = %from, size = bytes.len(), "Message accepted");
                AcceptCode::Accepted
            }
            Err(StoreError::Io(e)) => {
                error!(from = %from, error = %e, "Failed to store message");
                AcceptCode::ServiceUnavailable
            }
            Err(e) => {
                warn!(from = %from, reason = %e, "Message rejected");
                AcceptCode::from(&e)
            }
        }
    }

    /// Save a message generated by the relay itself. Skips the size and
    /// recipient policy but still honours the breaker.
    pub async fn save_internal(
        &self,
        envelope: Envelope,
        bytes: &[u8],
    ) -> Result<MessageHandle, StoreError> {
        self.check_breaker()?;
        self.persist_and_admit(envelope, bytes).await
    }

    /// Trip the breaker: every later save is refused until restart.
    pub fn fail(&self) {
        self.breaker.trip("store notified of forwarding failure");
    }

    fn check_breaker(&self) -> Result<(), StoreError> {
        if self.breaker.is_open() {
            return Err(StoreError::ServiceUnavailable);
        }
        Ok(())
    }

    fn check_policy(&self, envelope: &Envelope, size: u64) -> Result<(), StoreError> {
        if let Some(max) = self.config.max_message_size
            && size > max
        {
            return Err(StoreError::SizeLimitExceeded { size, max });
        }

        if !self.whitelist.is_empty()
            && let Some(address) = envelope
                .to
                .iter()
                .find(|a| !self.whitelist.contains(&a.trim().to_lowercase()))
        {
            return Err(StoreError::MailboxUnavailable {
                address: address.clone(),
            });
        }

        if self.config.reject_empty_recipient && envelope.to.is_empty() {
            return Err(StoreError::BadEmailAddress);
        }
        Ok(())
    }

    async fn persist_and_admit(
        &self,
        mut envelope: Envelope,
        bytes: &[u8],
    ) -> Result<MessageHandle, StoreError> {
        envelope.size = bytes.len() as u64;
        let id = Uuid::new_v4();
        let dir = self
            .config
            .directory
            .join(files::sender_directory(envelope.from.as_deref()));
        let path = files::write_atomic(&dir, id, bytes).await?;

        let handle = MessageHandle { id, path, envelope };
        if !self.queue.try_enqueue(handle.clone()) {
            warn!(
                id = %handle.id,
                pending = self.queue.pending(),
                "Forwarding queue full, message kept on disk until next startup"
            );
        }
        Ok(handle)
    }
}
