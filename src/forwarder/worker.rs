//! The forwarder task.
//!
//! One task owns the queue receiver, the upstream connection, the retry
//! queue and the idle deadline. Everything that touches the connection is
//! an event of its loop, so at most one send is ever in flight.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ForwarderStats;
use super::connection::ConnectionManager;
use super::queue::QueueReceiver;
use super::retry::RetryQueue;
use crate::breaker::Breaker;
use crate::pipeline::{Decision, DecisionPipeline};
use crate::store::{MessageHandle, files};

pub(super) struct Worker {
    pub(super) rx: QueueReceiver,
    pub(super) connection: ConnectionManager,
    pub(super) pipeline: DecisionPipeline,
    pub(super) breaker: Breaker,
    pub(super) idle_delay: Duration,
    pub(super) stats: watch::Sender<ForwarderStats>,
    pub(super) retry: RetryQueue,
    pub(super) idle_deadline: Option<Instant>,
}

impl Worker {
    pub(super) async fn run(mut self, shutdown: CancellationToken, abort: CancellationToken) {
        info!(idle_delay = ?self.idle_delay, "Forwarder started");
        let mut draining = false;

        loop {
            if self.should_stop() {
                warn!("Forwarder stopping, upstream relay failed permanently");
                break;
            }
            let deadline = self.idle_deadline;

            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    warn!(retry_pending = self.retry.len(), "Forwarder cancelled");
                    break;
                }
                _ = self.breaker.tripped() => {}
                _ = shutdown.cancelled(), if !draining => {
                    info!("Forwarder draining queue before shutdown");
                    draining = true;
                    self.rx.close();
                }
                next = self.rx.recv() => match next {
                    Some(handle) => {
                        self.forward(handle).await;
                        self.rx.complete();
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_idle().await;
                }
            }
        }

        self.connection.disconnect().await;
        self.publish(None);
        info!("Forwarder stopped");
    }

    fn should_stop(&self) -> bool {
        self.breaker.is_open() || self.connection.is_permanently_failed()
    }

    async fn forward(&mut self, handle: MessageHandle) -> bool {
        let decision = self.pipeline.process(&handle, &mut self.connection).await;
        self.settle(handle, decision).await
    }

    /// Apply a decision. Returns `true` for a definitive outcome.
    async fn settle(&mut self, handle: MessageHandle, decision: Decision) -> bool {
        let settled = decision.is_final();
        if settled && !files::remove(&handle.path).await {
            warn!(id = %handle.id, path = %handle.path.display(), "Failed to delete forwarded message");
        }

        let retry = decision.is_retryable();
        if retry {
            self.retry.push(handle);
        }
        if retry || matches!(decision, Decision::Sent) {
            self.arm_idle_timer();
        }
        self.publish(Some(&decision));
        settled
    }

    fn arm_idle_timer(&mut self) {
        self.idle_deadline = Some(Instant::now() + self.idle_delay);
    }

    /// Retry what failed on the network, then close an unused session.
    async fn on_idle(&mut self) {
        self.idle_deadline = None;

        let pending = self.retry.take_existing().await;
        if !pending.is_empty() {
            info!(count = pending.len(), "Retrying messages after network failure");
        }

        let mut delivered = 0usize;
        for handle in pending {
            if self.should_stop() {
                self.retry.push(handle);
                continue;
            }
            if self.forward(handle).await {
                delivered += 1;
            }
        }

        if delivered == 0 && self.connection.state().is_established() {
            info!("Auto disconnect");
            self.connection.disconnect().await;
        }
        self.publish(None);
    }

    /// Publish counters, connection state and retry backlog in one update.
    fn publish(&self, decision: Option<&Decision>) {
        let state = self.connection.state();
        let retry_pending = self.retry.len();
        self.stats.send_modify(|s| {
            if let Some(decision) = decision {
                s.record(decision);
            }
            s.connection = state;
            s.retry_pending = retry_pending;
        });
    }
}
