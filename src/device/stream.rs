//! Per-stream callback queues
//!
//! Callbacks registered on a stream run once the stream reaches the point at
//! which they were enqueued. The host device only observes that point when a
//! stream is synchronized, so the queue simply holds callbacks until then.

use std::collections::HashMap;
use std::fmt;

use super::StreamId;

/// Host callback scheduled on a device stream
pub type StreamCallback = Box<dyn FnOnce() + Send + 'static>;

/// Pending callbacks keyed by stream
#[derive(Default)]
pub struct CallbackQueues {
    pending: HashMap<StreamId, Vec<StreamCallback>>,
}

impl CallbackQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback behind everything already queued on `stream`
    pub fn push(&mut self, stream: StreamId, callback: StreamCallback) {
        self.pending.entry(stream).or_default().push(callback);
    }

    /// Remove every callback queued on `stream`, in registration order
    pub fn take(&mut self, stream: StreamId) -> Vec<StreamCallback> {
        self.pending.remove(&stream).unwrap_or_default()
    }

    /// Remove every queued callback, ordered by stream then registration
    pub fn take_all(&mut self) -> Vec<StreamCallback> {
        let mut streams: Vec<StreamId> = self.pending.keys().copied().collect();
        streams.sort_unstable();
        streams
            .into_iter()
            .flat_map(|stream| self.take(stream))
            .collect()
    }

    /// Number of callbacks waiting on `stream`
    pub fn pending_on(&self, stream: StreamId) -> usize {
        self.pending.get(&stream).map_or(0, Vec::len)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

impl fmt::Debug for CallbackQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueues")
            .field("total_pending", &self.total_pending())
            .finish()
    }
}
