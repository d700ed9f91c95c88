//! Outbound SMTP transport.
//!
//! The forwarder talks to the upstream relay through the [`Transport`]
//! trait so the connection lifecycle can be exercised without a server.
//! [`LettreTransport`] is the production implementation.

mod smtp;

pub use smtp::LettreTransport;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::ForwarderConfig;
use crate::error::{ConfigError, TransportError};
use crate::store::Envelope;

/// Where and how to reach the upstream relay.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    /// TLS from the first byte. Otherwise STARTTLS is used when offered.
    pub implicit_tls: bool,
    pub hello_name: String,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            port: config.port(),
            implicit_tls: config.enable_ssl,
            hello_name: config.hello_name.clone(),
            timeout: config.timeout(),
        }
    }
}

/// Credentials presented to the upstream relay.
#[derive(Debug, Clone)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: SecretString,
}

impl SmtpCredentials {
    pub fn from_config(config: &ForwarderConfig) -> Result<Option<Self>, ConfigError> {
        let Some(auth) = &config.authentication else {
            return Ok(None);
        };
        Ok(Some(Self {
            username: auth.username.clone(),
            password: auth.resolve_password()?,
        }))
    }
}

/// A single outbound SMTP session.
///
/// Every method takes `&mut self`: whoever owns the transport is the only
/// one able to use it, so at most one command is ever in flight.
#[async_trait]
pub trait Transport: Send {
    /// Open a session: TCP, greeting, `EHLO` and TLS as configured.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    async fn authenticate(&mut self, credentials: &SmtpCredentials) -> Result<(), TransportError>;

    /// Send one message on the open session.
    async fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), TransportError>;

    /// Close the session gracefully with `QUIT`.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drop the session without talking to the server.
    fn abort(&mut self);

    fn is_connected(&self) -> bool;
}
