//! Process-wide fail-fast flag.
//!
//! Tripped when the upstream relay cannot be reached for a reason retrying
//! will not fix. Once open it stays open until the process restarts: the
//! store refuses new mail and the forwarder stops sending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::error;

/// Shared handle to the breaker. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Breaker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    open: AtomicBool,
    notify: watch::Sender<bool>,
}

impl Breaker {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                open: AtomicBool::new(false),
                notify,
            }),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Open the breaker. Returns `true` if this call changed the state.
    pub fn trip(&self, reason: &str) -> bool {
        if self.inner.open.swap(true, Ordering::AcqRel) {
            return false;
        }
        error!(reason = %reason, "Forwarding failed permanently, rejecting all mail until restart");
        self.inner.notify.send_replace(true);
        true
    }

    /// Resolves once the breaker is open.
    pub async fn tripped(&self) {
        let mut rx = self.inner.notify.subscribe();
        // The sender lives in `self`, so `wait_for` can only fail if it is
        // dropped, which cannot happen while we hold a reference.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_closed() {
        assert!(!Breaker::new().is_open());
    }

    #[test]
    fn trip_is_sticky_and_shared() {
        let breaker = Breaker::new();
        let clone = breaker.clone();

        assert!(breaker.trip("auth rejected"));
        assert!(!clone.trip("second"));
        assert!(clone.is_open());
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn tripped_resolves_after_trip() {
        let breaker = Breaker::new();
        let waiter = {
            let breaker = breaker.clone();
            tokio::spawn(async move { breaker.tripped().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        breaker.trip("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn tripped_resolves_immediately_when_already_open() {
        let breaker = Breaker::new();
        breaker.trip("test");
        tokio::time::timeout(Duration::from_millis(100), breaker.tripped())
            .await
            .unwrap();
    }
}
