//! [`Transport`] over lettre's SMTP client connection.
//!
//! `SmtpConnection` is blocking, so every command runs on the blocking
//! pool with the connection moved in and handed back afterwards.

use std::error::Error as _;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::{Endpoint, SmtpCredentials, Transport};
use crate::error::{TransportError, TransportErrorKind};
use crate::store::Envelope;

type SmtpError = lettre::transport::smtp::Error;

/// Production transport backed by `lettre`.
#[derive(Default)]
pub struct LettreTransport {
    connection: Option<SmtpConnection>,
}

impl LettreTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a blocking command on the current connection. The connection is
    /// dropped after a network failure or once lettre has aborted it.
    async fn with_connection<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SmtpConnection) -> Result<T, SmtpError> + Send + 'static,
    {
        let mut connection = self
            .connection
            .take()
            .ok_or_else(|| TransportError::network("not connected"))?;

        let (connection, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut connection);
            (connection, result)
        })
        .await
        .map_err(|e| TransportError::network(format!("SMTP task failed: {e}")))?;

        match result {
            Ok(value) => {
                self.connection = Some(connection);
                Ok(value)
            }
            Err(e) => {
                let err = classify(&e);
                if !err.is_network() && !connection.has_broken() {
                    self.connection = Some(connection);
                }
                Err(err)
            }
        }
    }
}

/// Socket-level failures and timeouts are transient. A 5xx reply is a
/// rejection; everything else means the server said no for now or the
/// configuration is wrong.
fn classify(err: &SmtpError) -> TransportError {
    if err.is_timeout() || has_io_source(err) {
        return TransportError::network(err.to_string());
    }
    if err.is_tls() {
        return TransportError::config(err.to_string());
    }
    if err.is_permanent() {
        return TransportError::rejected(err.to_string());
    }
    TransportError::protocol(err.to_string())
}

fn has_io_source(err: &SmtpError) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if e.downcast_ref::<io::Error>().is_some() {
            return true;
        }
        source = e.source();
    }
    false
}

fn outbound_envelope(envelope: &Envelope) -> Result<lettre::address::Envelope, TransportError> {
    let from = envelope
        .from
        .as_deref()
        .map(str::parse::<lettre::Address>)
        .transpose()
        .map_err(|e| TransportError::protocol(format!("invalid sender: {e}")))?;
    let to = envelope
        .to
        .iter()
        .map(|a| a.parse::<lettre::Address>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::protocol(format!("invalid recipient: {e}")))?;

    lettre::address::Envelope::new(from, to)
        .map_err(|e| TransportError::protocol(format!("invalid envelope: {e}")))
}

#[async_trait]
impl Transport for LettreTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.abort();

        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((endpoint.hostname.as_str(), endpoint.port))
                .await
                .map_err(|e| {
                    TransportError::config(format!("cannot resolve {}: {e}", endpoint.hostname))
                })?
                .collect();
        if addrs.is_empty() {
            return Err(TransportError::config(format!(
                "no address for {}",
                endpoint.hostname
            )));
        }

        let tls = TlsParameters::new(endpoint.hostname.clone())
            .map_err(|e| TransportError::config(format!("TLS setup failed: {e}")))?;
        let hello = ClientId::Domain(endpoint.hello_name.clone());
        let implicit_tls = endpoint.implicit_tls;
        let timeout = endpoint.timeout;

        info!(host = %endpoint.hostname, port = endpoint.port, implicit_tls, "Connecting to upstream relay");
        let connection = tokio::task::spawn_blocking(move || {
            let tls_at_connect = implicit_tls.then_some(&tls);
            let mut connection = SmtpConnection::connect(
                addrs.as_slice(),
                Some(timeout),
                &hello,
                tls_at_connect,
                None,
            )?;
            if !implicit_tls && connection.can_starttls() {
                connection.starttls(&tls, &hello)?;
            }
            Ok::<_, SmtpError>(connection)
        })
        .await
        .map_err(|e| TransportError::network(format!("SMTP task failed: {e}")))?
        .map_err(|e| classify(&e))?;

        self.connection = Some(connection);
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &SmtpCredentials) -> Result<(), TransportError> {
        let creds = Credentials::new(
            credentials.username.clone(),
            credentials.password.expose_secret().to_string(),
        );
        self.with_connection(move |c| c.auth(&[Mechanism::Plain, Mechanism::Login], &creds))
            .await
            .map(|_| ())
            .map_err(|e| match e.kind {
                TransportErrorKind::Protocol | TransportErrorKind::Rejected => {
                    TransportError::auth(e.message)
                }
                _ => e,
            })
    }

    async fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), TransportError> {
        let envelope = outbound_envelope(envelope)?;
        let bytes = message.to_vec();
        let size = bytes.len();
        let response = self.with_connection(move |c| c.send(&envelope, &bytes)).await?;
        debug!(bytes = size, code = %response.code(), "Message data sent");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_none() {
            return Ok(());
        }
        let result = self.with_connection(|c| c.quit()).await;
        self.connection = None;
        result.map(|_| ())
    }

    fn abort(&mut self) {
        self.connection = None;
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}
