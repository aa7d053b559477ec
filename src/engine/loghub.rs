//! In-memory pub/sub fan-out of job log entries to live subscribers.
//!
//! Each job with at least one subscriber gets a bounded broadcast
//! channel. Delivery happens after the entry is durably recorded
//! (`JobContext::log` persists first, then publishes). A subscriber that
//! falls behind the channel capacity loses the oldest entries and
//! receives a `Dropped` gap marker instead, so a slow tail never blocks
//! job execution.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use crate::engine::job::LogEntry;

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An event observed on a live log stream.
#[derive(Debug, Clone)]
pub enum LogStreamEvent {
    /// A persisted log entry.
    Entry(LogEntry),
    /// `count` entries were evicted because this subscriber fell behind.
    Dropped { count: u64 },
    /// The job reached a terminal state; no further entries will arrive.
    Closed,
}

/// A live subscription to one job's log stream.
pub struct LogStream {
    rx: broadcast::Receiver<LogStreamEvent>,
}

impl LogStream {
    /// Wait for the next event. Returns `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<LogStreamEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(LogStreamEvent::Dropped { count })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Registry of per-job log broadcast channels.
pub struct LogHub {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<LogStreamEvent>>>,
}

impl LogHub {
    /// Create a hub with the default per-job channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub with an explicit per-job channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a job's live log stream.
    ///
    /// Entries published before this call are not replayed; callers that
    /// need history read it from the StateStore first.
    pub async fn subscribe(&self, job_id: Uuid) -> LogStream {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        LogStream { rx: tx.subscribe() }
    }

    /// A stream that is already at end-of-stream. Returned when
    /// subscribing to a job that has already terminated.
    pub fn closed_stream() -> LogStream {
        let (tx, rx) = broadcast::channel(1);
        let _ = tx.send(LogStreamEvent::Closed);
        LogStream { rx }
    }

    /// Publish an entry to all current subscribers of a job.
    ///
    /// A job with no subscribers has no channel; the entry is already
    /// durable in the StateStore, so nothing is lost.
    pub async fn publish(&self, job_id: Uuid, entry: LogEntry) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&job_id) {
            // Send fails only when every receiver is gone.
            let _ = tx.send(LogStreamEvent::Entry(entry));
        }
    }

    /// Close a job's stream with an end-of-stream signal and drop its
    /// channel. Called when the job reaches a terminal state.
    pub async fn close(&self, job_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.remove(&job_id) {
            let _ = tx.send(LogStreamEvent::Closed);
            debug!(job_id = %job_id, "Closed log stream");
        }
    }

    /// Close every stream. Called at daemon shutdown.
    pub async fn close_all(&self) {
        let mut channels = self.channels.write().await;
        for (_, tx) in channels.drain() {
            let _ = tx.send(LogStreamEvent::Closed);
        }
    }

    /// Number of live subscribers for a job.
    pub async fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.channels
            .read()
            .await
            .get(&job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::LogLevel;
    use chrono::Utc;

    fn entry(seq: i64, message: &str) -> LogEntry {
        LogEntry {
            seq,
            level: LogLevel::Info,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_sees_entries_in_order() {
        let hub = LogHub::new();
        let job_id = Uuid::new_v4();
        let mut stream = hub.subscribe(job_id).await;

        hub.publish(job_id, entry(1, "first")).await;
        hub.publish(job_id, entry(2, "second")).await;
        hub.close(job_id).await;

        match stream.next().await.unwrap() {
            LogStreamEvent::Entry(e) => assert_eq!((e.seq, e.message.as_str()), (1, "first")),
            other => panic!("expected entry, got {other:?}"),
        }
        match stream.next().await.unwrap() {
            LogStreamEvent::Entry(e) => assert_eq!((e.seq, e.message.as_str()), (2, "second")),
            other => panic!("expected entry, got {other:?}"),
        }
        assert!(matches!(stream.next().await, Some(LogStreamEvent::Closed)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn two_subscribers_observe_identical_streams() {
        let hub = LogHub::new();
        let job_id = Uuid::new_v4();
        let mut a = hub.subscribe(job_id).await;
        let mut b = hub.subscribe(job_id).await;
        assert_eq!(hub.subscriber_count(job_id).await, 2);

        for i in 1..=3 {
            hub.publish(job_id, entry(i, &format!("line {i}"))).await;
        }
        hub.close(job_id).await;

        let mut seen_a = Vec::new();
        while let Some(LogStreamEvent::Entry(e)) = a.next().await {
            seen_a.push(e.seq);
        }
        let mut seen_b = Vec::new();
        while let Some(LogStreamEvent::Entry(e)) = b.next().await {
            seen_b.push(e.seq);
        }

        assert_eq!(seen_a, vec![1, 2, 3]);
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap_marker_not_backpressure() {
        let hub = LogHub::with_capacity(4);
        let job_id = Uuid::new_v4();
        let mut stream = hub.subscribe(job_id).await;

        // Publish far past capacity without the subscriber reading.
        for i in 1..=20 {
            hub.publish(job_id, entry(i, "flood")).await;
        }

        match stream.next().await.unwrap() {
            LogStreamEvent::Dropped { count } => assert_eq!(count, 16),
            other => panic!("expected gap marker, got {other:?}"),
        }
        // The remaining entries are the newest ones.
        match stream.next().await.unwrap() {
            LogStreamEvent::Entry(e) => assert_eq!(e.seq, 17),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = LogHub::new();
        let job_id = Uuid::new_v4();
        hub.publish(job_id, entry(1, "nobody listening")).await;
        assert_eq!(hub.subscriber_count(job_id).await, 0);
    }

    #[tokio::test]
    async fn closed_stream_ends_immediately() {
        let mut stream = LogHub::closed_stream();
        assert!(matches!(stream.next().await, Some(LogStreamEvent::Closed)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let hub = LogHub::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let mut a = hub.subscribe(job_a).await;
        let mut b = hub.subscribe(job_b).await;

        hub.close_all().await;

        assert!(matches!(a.next().await, Some(LogStreamEvent::Closed)));
        assert!(matches!(b.next().await, Some(LogStreamEvent::Closed)));
    }
}
