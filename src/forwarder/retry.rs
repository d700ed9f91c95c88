//! Messages waiting for another attempt after a network failure.

use std::collections::VecDeque;

use tracing::debug;

use crate::store::{MessageHandle, files};

/// Unbounded FIFO of handles whose send failed with a transient error.
/// Owned by the forwarder worker and drained on idle ticks.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<MessageHandle>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: MessageHandle) {
        self.entries.push_back(handle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take the current entries, dropping those whose file has disappeared.
    ///
    /// Handles that fail again are pushed back by the caller and wait for
    /// the next tick, so one drain never loops on the same message.
    pub async fn take_existing(&mut self) -> Vec<MessageHandle> {
        let snapshot = std::mem::take(&mut self.entries);
        let mut ready = Vec::with_capacity(snapshot.len());
        for handle in snapshot {
            if files::exists(&handle.path).await {
                ready.push(handle);
            } else {
                debug!(id = %handle.id, "Dropping retry entry, stored file is gone");
            }
        }
        ready
    }
}
