use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{RecordData, RecordSource};

/// Canonical event kinds carried on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum EventKind {
    #[display("dns.record.created")]
    #[serde(rename = "dns.record.created")]
    RecordCreated,
    #[display("dns.record.updated")]
    #[serde(rename = "dns.record.updated")]
    RecordUpdated,
    #[display("dns.record.deleted")]
    #[serde(rename = "dns.record.deleted")]
    RecordDeleted,
    #[display("dns.record.orphaned")]
    #[serde(rename = "dns.record.orphaned")]
    RecordOrphaned,
    #[display("tunnel.created")]
    #[serde(rename = "tunnel.created")]
    TunnelCreated,
    #[display("tunnel.deployed")]
    #[serde(rename = "tunnel.deployed")]
    TunnelDeployed,
    #[display("tunnel.deleted")]
    #[serde(rename = "tunnel.deleted")]
    TunnelDeleted,
    #[display("system.sync.completed")]
    #[serde(rename = "system.sync.completed")]
    SyncCompleted,
    #[display("system.error")]
    #[serde(rename = "system.error")]
    SystemError,
}

/// A lifecycle event published by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Per-cycle action counts reported in `system.sync.completed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub orphaned: usize,
    pub restored: usize,
    pub failed: usize,
}

impl SyncCounts {
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.deleted + self.orphaned + self.restored
    }
}

/// Broadcast bus for engine lifecycle events.
///
/// Downstream collaborators (webhooks, audit shipping, dashboards) subscribe;
/// the engine never blocks on them. Publishing with no subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        let event = Event::new(kind, payload);
        tracing::debug!(kind = %event.kind, id = %event.id, "Publishing event");
        // Err means no subscribers are currently attached
        let _ = self.tx.send(event);
    }

    /// Publish a record lifecycle event with the standard payload shape
    pub fn publish_record(
        &self,
        kind: EventKind,
        provider_id: i64,
        source: RecordSource,
        data: &RecordData,
    ) {
        self.publish(
            kind,
            serde_json::json!({
                "provider_id": provider_id,
                "hostname": data.hostname,
                "record_type": data.record_type,
                "content": data.content,
                "source": source,
            }),
        );
    }

    pub fn publish_sync_completed(&self, provider_id: i64, counts: &SyncCounts) {
        self.publish(
            EventKind::SyncCompleted,
            serde_json::json!({
                "provider_id": provider_id,
                "created": counts.created,
                "updated": counts.updated,
                "deleted": counts.deleted,
                "orphaned": counts.orphaned,
                "restored": counts.restored,
                "failed": counts.failed,
            }),
        );
    }

    pub fn publish_error(&self, scope: &str, message: &str) {
        self.publish(
            EventKind::SystemError,
            serde_json::json!({
                "scope": scope,
                "message": message,
            }),
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_format() {
        assert_eq!(EventKind::RecordCreated.to_string(), "dns.record.created");
        assert_eq!(
            serde_json::to_string(&EventKind::SyncCompleted).unwrap(),
            "\"system.sync.completed\""
        );
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish_error("test", "first");
        bus.publish_error("test", "second");

        assert_eq!(rx.recv().await.unwrap().payload["message"], "first");
        assert_eq!(rx.recv().await.unwrap().payload["message"], "second");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish_error("test", "nobody listening");
    }
}
