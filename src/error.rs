//! Error types for the relay.

use std::path::PathBuf;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Alert backend error: {0}")]
    Alert(#[from] AlertError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// Message store errors. The policy variants map one-to-one onto the
/// reply codes returned to the SMTP front end.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Service unavailable: forwarding has failed, restart required")]
    ServiceUnavailable,

    #[error("Message size {size} exceeds limit of {max} bytes")]
    SizeLimitExceeded { size: u64, max: u64 },

    #[error("Recipient {address} is not in the destination whitelist")]
    MailboxUnavailable { address: String },

    #[error("At least one recipient must be specified")]
    BadEmailAddress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Class of an outbound transport failure. Drives retry vs. fail-fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket-level failure (refused, reset, timeout). Retried later.
    Network,
    /// Name resolution or configuration problem.
    Config,
    /// Credentials rejected by the upstream relay.
    Auth,
    /// Upstream answered with a transient error reply or broke the protocol.
    Protocol,
    /// Upstream refused the message with a permanent (5xx) reply.
    Rejected,
}

/// Outbound SMTP transport error.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?} failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Config, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Auth, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    /// Network-class failures are transient and never trip the breaker.
    pub fn is_network(&self) -> bool {
        self.kind == TransportErrorKind::Network
    }

    /// The upstream relay will never take this message.
    pub fn is_rejection(&self) -> bool {
        self.kind == TransportErrorKind::Rejected
    }

    /// Re-tag as a transient failure, keeping the message.
    pub(crate) fn into_transient(self) -> Self {
        Self::network(format!("{:?}: {}", self.kind, self.message))
    }
}

/// Alert backend errors.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
}

/// LLM backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
