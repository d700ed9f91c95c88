//! Forwarding to the upstream SMTP relay.
//!
//! ```text
//! MessageStore ──try_enqueue──▶ ForwardingQueue ──▶ worker task
//!                                                    ├─ DecisionPipeline
//!                                                    ├─ ConnectionManager ──▶ upstream
//!                                                    └─ RetryQueue (idle ticks)
//! ```

pub mod connection;
pub mod queue;
mod retry;
mod worker;

pub use connection::{ConnectionManager, ConnectionState};
pub use queue::{ForwardingQueue, QueueReceiver, channel};
pub use retry::RetryQueue;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::breaker::Breaker;
use crate::config::ForwarderConfig;
use crate::pipeline::{Decision, DecisionPipeline};
use worker::Worker;

/// Counters published by the worker after every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub sent: u64,
    pub voided: u64,
    pub diverted: u64,
    /// Refused for good by the upstream relay and discarded.
    pub rejected: u64,
    /// Left on disk without a definitive outcome.
    pub kept: u64,
    pub failed: u64,
    pub retry_pending: usize,
    pub connection: ConnectionState,
}

impl ForwarderStats {
    fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::Sent => self.sent += 1,
            Decision::Voided => self.voided += 1,
            Decision::Diverted => self.diverted += 1,
            Decision::Rejected(_) => self.rejected += 1,
            Decision::Failed(_) => self.failed += 1,
            Decision::NoRecipient | Decision::Disabled | Decision::Unreadable(_) => self.kept += 1,
            Decision::Missing => {}
        }
    }
}

/// Timing knobs of the worker.
#[derive(Debug, Clone, Copy)]
pub struct ForwarderSettings {
    pub idle_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl ForwarderSettings {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        Self {
            idle_delay: config.idle_delay(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Handle to the running forwarder task.
pub struct Forwarder {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    stats: watch::Receiver<ForwarderStats>,
    shutdown_timeout: Duration,
}

impl Forwarder {
    /// Start the worker. It runs until shutdown or a permanent failure.
    pub fn spawn(
        rx: QueueReceiver,
        connection: ConnectionManager,
        pipeline: DecisionPipeline,
        breaker: Breaker,
        settings: ForwarderSettings,
    ) -> Self {
        let (stats_tx, stats) = watch::channel(ForwarderStats::default());
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let worker = Worker {
            rx,
            connection,
            pipeline,
            breaker,
            idle_delay: settings.idle_delay,
            stats: stats_tx,
            retry: RetryQueue::new(),
            idle_deadline: None,
        };
        let task = tokio::spawn(worker.run(shutdown.clone(), abort.clone()));

        Self {
            task,
            shutdown,
            abort,
            stats,
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    pub fn stats(&self) -> watch::Receiver<ForwarderStats> {
        self.stats.clone()
    }

    /// Stop admissions, let the worker drain what was admitted, and wait
    /// for it. After the shutdown timeout the worker is cancelled; a send
    /// already in flight still completes.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        match tokio::time::timeout(self.shutdown_timeout, &mut self.task).await {
            Ok(result) => log_join(result),
            Err(_) => {
                warn!(
                    timeout = ?self.shutdown_timeout,
                    "Forwarder did not drain in time, cancelling"
                );
                self.abort.cancel();
                log_join(self.task.await);
            }
        }
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Forwarder task failed");
    }
}
