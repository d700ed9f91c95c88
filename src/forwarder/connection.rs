//! Lifecycle of the single upstream SMTP session.

use tracing::{error, info, warn};

use crate::breaker::Breaker;
use crate::error::TransportError;
use crate::store::Envelope;
use crate::transport::{Endpoint, SmtpCredentials, Transport};

/// State of the upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    /// Terminal. Reached when the relay cannot work without operator action.
    PermanentlyFailed,
}

impl ConnectionState {
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

/// Owns the transport and connects on demand.
///
/// Exclusivity comes from ownership: the forwarder worker is the only owner
/// and every operation takes `&mut self`.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    endpoint: Endpoint,
    credentials: Option<SmtpCredentials>,
    breaker: Breaker,
    state: ConnectionState,
    /// Set once a session has been fully established. Until then a
    /// non-network failure means the configuration is wrong; afterwards it
    /// is reported as transient.
    established_once: bool,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        endpoint: Endpoint,
        credentials: Option<SmtpCredentials>,
        breaker: Breaker,
    ) -> Self {
        Self {
            transport,
            endpoint,
            credentials,
            breaker,
            state: ConnectionState::Disconnected,
            established_once: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.state == ConnectionState::PermanentlyFailed
    }

    /// Open and authenticate a session unless one is already up.
    pub async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::PermanentlyFailed => {
                return Err(TransportError::config("upstream connection permanently failed"));
            }
            state if state.is_established() && self.transport.is_connected() => return Ok(()),
            _ => {}
        }

        self.state = ConnectionState::Connecting;
        if let Err(e) = self.transport.connect(&self.endpoint).await {
            error!(
                host = %self.endpoint.hostname,
                port = self.endpoint.port,
                error = %e,
                "Failed to connect to upstream relay"
            );
            self.state = ConnectionState::Disconnected;
            if e.is_network() {
                return Err(e);
            }
            if self.established_once {
                return Err(e.into_transient());
            }
            self.fail_permanently(&e);
            return Err(e);
        }
        self.state = ConnectionState::Connected;

        if let Some(credentials) = &self.credentials {
            if let Err(e) = self.transport.authenticate(credentials).await {
                error!(
                    host = %self.endpoint.hostname,
                    error = %e,
                    "Authentication to upstream relay failed, check settings"
                );
                if e.is_network() {
                    self.drop_session();
                } else if self.established_once {
                    self.disconnect().await;
                    return Err(e.into_transient());
                } else {
                    self.fail_permanently(&e);
                }
                return Err(e);
            }
            self.state = ConnectionState::Authenticated;
        }

        self.established_once = true;
        Ok(())
    }

    /// Send one message, connecting first if needed. A network failure
    /// drops the session so the next attempt reconnects.
    pub async fn send(&mut self, envelope: &Envelope, message: &[u8]) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        match self.transport.send(envelope, message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_network() {
                    self.drop_session();
                }
                Err(e)
            }
        }
    }

    /// Close the session with `QUIT`. Errors are logged.
    pub async fn disconnect(&mut self) {
        if !self.state.is_established() {
            return;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Error while disconnecting from upstream relay");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn drop_session(&mut self) {
        self.transport.abort();
        if self.state != ConnectionState::PermanentlyFailed {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn fail_permanently(&mut self, err: &TransportError) {
        self.transport.abort();
        self.state = ConnectionState::PermanentlyFailed;
        self.breaker.trip(&err.to_string());
        info!("Forwarder stopped, restart required after fixing the configuration");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportErrorKind;

    #[derive(Default)]
    struct Script {
        connects: VecDeque<Result<(), TransportError>>,
        auths: VecDeque<Result<(), TransportError>>,
        sends: VecDeque<Result<(), TransportError>>,
        connect_calls: usize,
        quit_calls: usize,
    }

    struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        connected: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self, _endpoint: &Endpoint) -> Result<(), TransportError> {
            let mut script = self.script.lock().unwrap();
            script.connect_calls += 1;
            let result = script.connects.pop_front().unwrap_or(Ok(()));
            self.connected = result.is_ok();
            result
        }

        async fn authenticate(&mut self, _c: &SmtpCredentials) -> Result<(), TransportError> {
            self.script.lock().unwrap().auths.pop_front().unwrap_or(Ok(()))
        }

        async fn send(&mut self, _e: &Envelope, _m: &[u8]) -> Result<(), TransportError> {
            self.script.lock().unwrap().sends.pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.script.lock().unwrap().quit_calls += 1;
            self.connected = false;
            Ok(())
        }

        fn abort(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn manager(script: Script, with_auth: bool) -> (ConnectionManager, Arc<Mutex<Script>>, Breaker) {
        let script = Arc::new(Mutex::new(script));
        let breaker = Breaker::new();
        let credentials = with_auth.then(|| SmtpCredentials {
            username: "relay".into(),
            password: "pw".into(),
        });
        let manager = ConnectionManager::new(
            Box::new(ScriptedTransport {
                script: Arc::clone(&script),
                connected: false,
            }),
            Endpoint {
                hostname: "smtp.example.com".into(),
                port: 25,
                implicit_tls: false,
                hello_name: "localhost".into(),
                timeout: Duration::from_secs(5),
            },
            credentials,
            breaker.clone(),
        );
        (manager, script, breaker)
    }

    fn envelope() -> Envelope {
        Envelope::new(Some("a@example.com"), &["b@example.com"])
    }

    #[tokio::test]
    async fn connects_once_and_reuses_session() {
        let (mut manager, script, _) = manager(Script::default(), true);

        manager.send(&envelope(), b"one").await.unwrap();
        manager.send(&envelope(), b"two").await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(script.lock().unwrap().connect_calls, 1);
    }

    #[tokio::test]
    async fn network_failure_on_first_connect_does_not_trip() {
        let script = Script {
            connects: VecDeque::from([Err(TransportError::network("refused"))]),
            ..Script::default()
        };
        let (mut manager, _, breaker) = manager(script, false);

        let err = manager.send(&envelope(), b"x").await.unwrap_err();
        assert!(err.is_network());
        assert!(!breaker.is_open());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.send(&envelope(), b"x").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn config_failure_on_first_connect_trips() {
        let script = Script {
            connects: VecDeque::from([Err(TransportError::config("unknown host"))]),
            ..Script::default()
        };
        let (mut manager, script, breaker) = manager(script, false);

        let err = manager.send(&envelope(), b"x").await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Config);
        assert!(breaker.is_open());
        assert!(manager.is_permanently_failed());

        assert!(manager.send(&envelope(), b"x").await.is_err());
        assert_eq!(script.lock().unwrap().connect_calls, 1);
    }

    #[tokio::test]
    async fn auth_failure_before_first_session_trips() {
        let script = Script {
            auths: VecDeque::from([Err(TransportError::auth("535 bad credentials"))]),
            ..Script::default()
        };
        let (mut manager, _, breaker) = manager(script, true);

        assert!(manager.send(&envelope(), b"x").await.is_err());
        assert!(breaker.is_open());
        assert_eq!(manager.state(), ConnectionState::PermanentlyFailed);
    }

    #[tokio::test]
    async fn later_config_failure_does_not_trip() {
        let script = Script {
            connects: VecDeque::from([Ok(()), Err(TransportError::config("unknown host"))]),
            sends: VecDeque::from([Ok(()), Err(TransportError::network("reset"))]),
            ..Script::default()
        };
        let (mut manager, _, breaker) = manager(script, false);

        manager.send(&envelope(), b"1").await.unwrap();
        assert!(manager.send(&envelope(), b"2").await.unwrap_err().is_network());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let err = manager.send(&envelope(), b"3").await.unwrap_err();
        assert!(err.is_network(), "{err}");
        assert!(!breaker.is_open());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn later_auth_failure_is_transient() {
        let script = Script {
            auths: VecDeque::from([Ok(()), Err(TransportError::auth("535 bad credentials"))]),
            ..Script::default()
        };
        let (mut manager, script, breaker) = manager(script, true);

        manager.send(&envelope(), b"1").await.unwrap();
        manager.disconnect().await;

        let err = manager.send(&envelope(), b"2").await.unwrap_err();
        assert!(err.is_network(), "{err}");
        assert!(!breaker.is_open());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.send(&envelope(), b"3").await.unwrap();
        assert_eq!(script.lock().unwrap().connect_calls, 3);
    }

    #[tokio::test]
    async fn transient_reply_on_send_keeps_session() {
        let script = Script {
            sends: VecDeque::from([Err(TransportError::protocol("451 try again later"))]),
            ..Script::default()
        };
        let (mut manager, script, _) = manager(script, false);

        assert!(manager.send(&envelope(), b"x").await.is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.send(&envelope(), b"y").await.unwrap();
        assert_eq!(script.lock().unwrap().connect_calls, 1);
    }

    #[tokio::test]
    async fn disconnect_sends_quit_only_when_connected() {
        let (mut manager, script, _) = manager(Script::default(), false);

        manager.disconnect().await;
        assert_eq!(script.lock().unwrap().quit_calls, 0);

        manager.ensure_connected().await.unwrap();
        manager.disconnect().await;
        assert_eq!(script.lock().unwrap().quit_calls, 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
