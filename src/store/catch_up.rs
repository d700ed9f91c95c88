//! Startup recovery of messages left over from a previous run.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{MessageStore, files};

impl MessageStore {
    /// Re-queue every message still on disk, oldest first, then wait until
    /// the forwarder has worked through them.
    ///
    /// Runs before the front end starts accepting mail. Returns early when
    /// the breaker trips or `cancel` fires. Scan errors are logged and never
    /// abort startup. Returns the number of messages queued.
    pub async fn catch_up(&self, cancel: &CancellationToken) -> usize {
        if !self.config.catch_up_on_startup {
            return 0;
        }
        let root = self.directory();
        if !files::exists(root).await {
            info!(dir = %root.display(), "Store directory does not exist yet, nothing to catch up");
            return 0;
        }

        let paths = match files::scan(root).await {
            Ok(paths) => paths,
            Err(e) => {
                error!(dir = %root.display(), error = %e, "Failed to scan store directory");
                return 0;
            }
        };
        if paths.is_empty() {
            return 0;
        }
        info!(count = paths.len(), "Catching up on stored messages");

        let mut queued = 0;
        for path in paths {
            let handle = match files::load_handle(&path).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable stored message");
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return queued,
                _ = self.breaker.tripped() => return queued,
                admitted = self.queue.enqueue(handle) => {
                    if !admitted {
                        warn!("Forwarding queue closed during catch-up");
                        return queued;
                    }
                    queued += 1;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.breaker.tripped() => {}
            _ = self.queue.wait_drained() => {
                info!(count = queued, "Catch-up complete");
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::breaker::Breaker;
    use crate::config::StoreConfig;
    use crate::forwarder::queue;

    fn config(dir: &std::path::Path, enabled: bool) -> StoreConfig {
        StoreConfig {
            directory: dir.to_path_buf(),
            catch_up_on_startup: enabled,
            destination_whitelist: Vec::new(),
            max_message_size: None,
            reject_empty_recipient: false,
        }
    }

    fn seed(dir: &std::path::Path, count: usize) {
        let sender = dir.join("ops@example.com");
        std::fs::create_dir_all(&sender).unwrap();
        for _ in 0..count {
            std::fs::write(
                sender.join(format!("{}.mime", uuid::Uuid::new_v4())),
                "From: ops@example.com\r\nTo: a@example.com\r\n\r\nbody",
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn disabled_catch_up_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), 2);
        let (queue, _rx) = queue::channel(5);
        let store = MessageStore::new(config(dir.path(), false), Breaker::new(), queue);

        assert_eq!(store.catch_up(&CancellationToken::new()).await, 0);
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _rx) = queue::channel(5);
        let store = MessageStore::new(
            config(&dir.path().join("missing"), true),
            Breaker::new(),
            queue,
        );

        assert_eq!(store.catch_up(&CancellationToken::new()).await, 0);
    }

    #[tokio::test]
    async fn queues_everything_and_waits_for_drain() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), 3);
        let (queue, mut rx) = queue::channel(1);
        let store = MessageStore::new(config(dir.path(), true), Breaker::new(), queue);

        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(_handle) = rx.recv().await {
                seen += 1;
                rx.complete();
                if seen == 3 {
                    break;
                }
            }
            seen
        });

        let queued = tokio::time::timeout(
            Duration::from_secs(5),
            store.catch_up(&CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(queued, 3);
        assert_eq!(consumer.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn breaker_trip_ends_catch_up() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), 3);
        let (queue, _rx) = queue::channel(1);
        let breaker = Breaker::new();
        let store = MessageStore::new(config(dir.path(), true), breaker.clone(), queue);

        let tripper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            breaker.trip("test");
        });

        let queued = tokio::time::timeout(
            Duration::from_secs(5),
            store.catch_up(&CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(queued, 1);
        tripper.await.unwrap();
    }
}
