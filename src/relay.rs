//! Wiring of the relay components and their startup order.
//!
//! Startup: forwarder worker, then catch-up of the stored backlog, then the
//! optional startup notification. Only after that is the store handed to
//! the SMTP front end.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alerting::{AlertBackend, AlertDiversion, AlertmanagerClient};
use crate::breaker::Breaker;
use crate::config::{ChatSettings, RelayConfig};
use crate::error::Result;
use crate::forwarder::{
    self, ConnectionManager, Forwarder, ForwarderSettings, ForwarderStats,
};
use crate::llm::{ChatClient, CompletionBackend, LlmAssistant};
use crate::pipeline::DecisionPipeline;
use crate::startup;
use crate::store::MessageStore;
use crate::transport::{Endpoint, LettreTransport, SmtpCredentials, Transport};

/// Backends the relay talks to.
pub struct RelayDeps {
    pub transport: Box<dyn Transport>,
    pub alerts: Option<Arc<dyn AlertBackend>>,
    pub llm: Option<Arc<dyn CompletionBackend>>,
}

impl RelayDeps {
    /// Production backends for the configured sections.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let alerts = match &config.alertmanager {
            Some(am) => Some(Arc::new(AlertmanagerClient::new(am)?) as Arc<dyn AlertBackend>),
            None => None,
        };
        let llm = match &config.llm {
            Some(llm) => Some(Arc::new(ChatClient::new(llm)?) as Arc<dyn CompletionBackend>),
            None => None,
        };
        Ok(Self {
            transport: Box::new(LettreTransport::new()),
            alerts,
            llm,
        })
    }
}

/// A started relay.
pub struct Relay {
    store: Arc<MessageStore>,
    breaker: Breaker,
    forwarder: Forwarder,
}

impl Relay {
    /// Start every component and run the startup phase.
    ///
    /// `cancel` aborts the catch-up wait. A failing startup notification
    /// stops the forwarder and returns the error.
    pub async fn start(config: RelayConfig, deps: RelayDeps, cancel: &CancellationToken) -> Result<Self> {
        config.validate()?;

        let breaker = Breaker::new();
        let (queue, rx) = forwarder::channel(config.forwarder.queue_capacity());

        let connection = ConnectionManager::new(
            deps.transport,
            Endpoint::from_config(&config.forwarder),
            SmtpCredentials::from_config(&config.forwarder)?,
            breaker.clone(),
        );
        let pipeline = build_pipeline(&config, deps.alerts, deps.llm)?;
        let forwarder = Forwarder::spawn(
            rx,
            connection,
            pipeline,
            breaker.clone(),
            ForwarderSettings::from_config(&config.forwarder),
        );

        let store = Arc::new(MessageStore::new(config.store.clone(), breaker.clone(), queue));
        let relay = Self {
            store,
            breaker,
            forwarder,
        };

        let recovered = relay.store.catch_up(cancel).await;
        if recovered > 0 {
            info!(count = recovered, "Stored messages recovered");
        }

        if let Some(notification) = &config.startup_notification {
            let sent = startup::send_notification(&relay.store, notification).await;
            if let Err(e) = sent {
                relay.shutdown().await;
                return Err(e);
            }
        }

        info!(
            dir = %relay.store.directory().display(),
            upstream = %config.forwarder.hostname,
            "Relay ready"
        );
        Ok(relay)
    }

    /// The store the SMTP front end submits to.
    pub fn store(&self) -> Arc<MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    pub fn stats(&self) -> watch::Receiver<ForwarderStats> {
        self.forwarder.stats()
    }

    /// Drain the forwarding queue and stop the worker.
    pub async fn shutdown(self) {
        info!("Relay shutting down");
        self.forwarder.shutdown().await;
    }
}

fn build_pipeline(
    config: &RelayConfig,
    alerts: Option<Arc<dyn AlertBackend>>,
    llm: Option<Arc<dyn CompletionBackend>>,
) -> Result<DecisionPipeline> {
    let llm_config = config.llm.as_ref();
    let subject_settings: ChatSettings = llm_config
        .map(|c| c.subject_helper.clone())
        .unwrap_or_default();
    let summary_settings: ChatSettings = llm_config
        .map(|c| c.alert_summarizer.clone())
        .unwrap_or_default();

    let subject_helper = llm
        .clone()
        .map(|backend| LlmAssistant::subject_helper(backend, &subject_settings));
    let summarizer = llm.map(|backend| LlmAssistant::alert_summarizer(backend, &summary_settings));

    let diversion = match (&config.alertmanager, alerts) {
        (Some(am), Some(backend)) => Some(AlertDiversion::new(am, backend, summarizer)?),
        _ => None,
    };

    Ok(DecisionPipeline::new(&config.forwarder, diversion, subject_helper)?)
}
