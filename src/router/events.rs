//! Structured router events
//!
//! Every dispatch, commit, abort and gate decision becomes one
//! [`RouterEvent`]. Events go to `tracing`, to registered sinks and to a
//! broadcast stream for live subscribers.

use crate::router::types::PartitionId;
use crate::storage::Record;
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    Dispatched,
    /// One hop committed
    Committed { hop_index: u32 },
    /// Final hop committed; the tag entered the Done Set
    TransactionCommitted,
    Aborted { reason: String, removed: usize },
    DependencyWait { missing: Vec<String> },
    DependencyUnsatisfiable { reason: String, missing: Vec<String> },
    ReadResult { rows: Vec<Record> },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Dispatched => "dispatched",
            EventKind::Committed { .. } => "committed",
            EventKind::TransactionCommitted => "transaction_committed",
            EventKind::Aborted { .. } => "aborted",
            EventKind::DependencyWait { .. } => "dependency_wait",
            EventKind::DependencyUnsatisfiable { .. } => "dependency_unsatisfiable",
            EventKind::ReadResult { .. } => "read_result",
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterEvent {
    pub run_id: String,
    pub sequence: u64,
    pub transaction_tag: String,
    pub partition: PartitionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &RouterEvent);
}

/// Sink writing every event through `tracing`
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &RouterEvent) {
        match &event.kind {
            EventKind::Aborted { reason, removed } => tracing::warn!(
                tag = %event.transaction_tag,
                partition = event.partition,
                removed = removed,
                "Transaction aborted: {}",
                reason
            ),
            EventKind::DependencyUnsatisfiable { reason, missing } => tracing::error!(
                tag = %event.transaction_tag,
                partition = event.partition,
                missing = ?missing,
                "Dependency unsatisfiable: {}",
                reason
            ),
            EventKind::ReadResult { rows } => tracing::info!(
                tag = %event.transaction_tag,
                partition = event.partition,
                rows = ?rows,
                "Read value"
            ),
            kind => tracing::debug!(
                tag = %event.transaction_tag,
                partition = event.partition,
                event = kind.name(),
                "Router event"
            ),
        }
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: Mutex<Vec<RouterEvent>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RouterEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events of one transaction, in emission order
    pub fn events_for(&self, tag: &str) -> Vec<RouterEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.transaction_tag == tag)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, event: &RouterEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Fan-out point for router events
pub struct EventBus {
    sequence: AtomicU64,
    sinks: Vec<Arc<dyn EventSink>>,
    tx: Sender<RouterEvent>,
    // keeps the stream open while nobody is subscribed
    idle_rx: InactiveReceiver<RouterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true); // Drop oldest events when a subscriber lags
        Self {
            sequence: AtomicU64::new(0),
            sinks,
            tx,
            idle_rx: rx.deactivate(),
        }
    }

    /// Live stream of events emitted from now on
    pub fn subscribe(&self) -> Receiver<RouterEvent> {
        self.idle_rx.activate_cloned()
    }

    pub fn emit(&self, run_id: &str, tag: &str, partition: PartitionId, kind: EventKind) -> RouterEvent {
        let event = RouterEvent {
            run_id: run_id.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            transaction_tag: tag.to_string(),
            partition,
            timestamp: Utc::now(),
            kind,
        };
        for sink in &self.sinks {
            sink.emit(&event);
        }
        // no active subscribers is not an error
        let _ = self.tx.try_broadcast(event.clone());
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_fans_out_to_sinks_and_subscribers() {
        let buffer = Arc::new(BufferingEventSink::new());
        let bus = EventBus::new(16, vec![buffer.clone(), Arc::new(LoggingEventSink)]);
        let mut rx = bus.subscribe();

        bus.emit("run-1", "T1", 0, EventKind::Dispatched);
        bus.emit("run-1", "T1", 0, EventKind::TransactionCommitted);
        bus.emit("run-1", "T2", 1, EventKind::Dispatched);

        assert_eq!(buffer.events().len(), 3);
        assert_eq!(buffer.events_for("T1").len(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.kind, EventKind::Dispatched);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind.name(), "transaction_committed");

        buffer.clear();
        assert!(buffer.events().is_empty());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(1, vec![]);
        let event = bus.emit("run-1", "T1", 2, EventKind::Dispatched);
        let event2 = bus.emit("run-1", "T1", 2, EventKind::Dispatched);
        assert_eq!(event.partition, 2);
        assert!(event2.sequence > event.sequence);
    }
}
