//! Cross-context state synchronization
//!
//! Session mutations are broadcast to sibling contexts ("tabs") sharing
//! a logical session channel. Delivery is fire-and-forget with
//! per-sender ordering only; there is no global order across senders, so
//! consumers treat each message as an idempotent last-write-wins merge
//! keyed on the embedded timestamps, not as a sequential log.
//!
//! A context constructed without a channel degrades to a no-op: local
//! state stays authoritative for that context alone, and callers cannot
//! tell the difference.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use common::now_millis;
use gymflow_auth::api::{EntitlementStatus, SessionUser};

/// Session mutations propagated between contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SessionUpdated { user: SessionUser },
    EntitlementUpdated { status: EntitlementStatus },
    Logout,
}

/// Envelope carrying the originating context and send time. `origin`
/// lets receivers drop their own echoes; `sent_at` drives
/// last-write-wins merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub origin: String,
    pub sent_at: u64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// The shared session channel. Clone one handle into every context that
/// should converge.
#[derive(Clone)]
pub struct TabChannel {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl TabChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for TabChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One context's attachment to the channel.
pub struct TabSync {
    origin: String,
    tx: Option<broadcast::Sender<BroadcastMessage>>,
}

impl TabSync {
    /// Join the shared channel under a fresh origin id.
    pub fn connected(channel: &TabChannel) -> Self {
        Self {
            origin: Uuid::new_v4().to_string(),
            tx: Some(channel.tx.clone()),
        }
    }

    /// Degraded mode for hosts without a broadcast primitive. Publishing
    /// and subscribing become no-ops, transparently to callers.
    pub fn detached() -> Self {
        Self {
            origin: Uuid::new_v4().to_string(),
            tx: None,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_connected(&self) -> bool {
        self.tx.is_some()
    }

    /// Fire-and-forget publish. A channel with no other listeners is
    /// not an error, and neither is running detached.
    pub fn publish(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let message = BroadcastMessage {
            origin: self.origin.clone(),
            sent_at: now_millis(),
            event,
        };
        if tx.send(message).is_err() {
            debug!("broadcast dropped, no sibling contexts listening");
        }
    }

    /// Receiver of channel traffic, `None` when detached. The channel
    /// echoes to every subscriber, so consumers must drop messages for
    /// which [`TabSync::is_self`] holds.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BroadcastMessage>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Whether this context sent the message.
    pub fn is_self(&self, message: &BroadcastMessage) -> bool {
        message.origin == self.origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> SessionUser {
        serde_json::from_value(serde_json::json!({
            "_id": "u1",
            "name": "Dana",
            "email": "dana@gym.test",
            "role": "gym-owner"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_sibling_subscriber() {
        let channel = TabChannel::default();
        let a = TabSync::connected(&channel);
        let b = TabSync::connected(&channel);

        let mut rx = b.subscribe().unwrap();
        a.publish(SyncEvent::Logout);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.origin, a.origin());
        assert!(!b.is_self(&message));
        assert!(matches!(message.event, SyncEvent::Logout));
        assert!(message.sent_at > 0);
    }

    #[tokio::test]
    async fn own_messages_are_identifiable() {
        let channel = TabChannel::default();
        let a = TabSync::connected(&channel);

        let mut rx = a.subscribe().unwrap();
        a.publish(SyncEvent::SessionUpdated { user: test_user() });

        // The channel echoes to every subscriber; the origin marks it
        let message = rx.recv().await.unwrap();
        assert!(a.is_self(&message));
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order_per_sender() {
        let channel = TabChannel::default();
        let a = TabSync::connected(&channel);
        let b = TabSync::connected(&channel);

        let mut rx = b.subscribe().unwrap();
        a.publish(SyncEvent::SessionUpdated { user: test_user() });
        a.publish(SyncEvent::Logout);

        assert!(matches!(
            rx.recv().await.unwrap().event,
            SyncEvent::SessionUpdated { .. }
        ));
        assert!(matches!(rx.recv().await.unwrap().event, SyncEvent::Logout));
    }

    #[test]
    fn detached_sync_is_a_no_op() {
        let sync = TabSync::detached();
        assert!(!sync.is_connected());
        assert!(sync.subscribe().is_none());
        // Must not panic or block
        sync.publish(SyncEvent::Logout);
    }

    #[test]
    fn distinct_contexts_get_distinct_origins() {
        let channel = TabChannel::default();
        let a = TabSync::connected(&channel);
        let b = TabSync::connected(&channel);
        assert_ne!(a.origin(), b.origin());
    }

    #[test]
    fn message_serializes_with_kebab_case_tag() {
        let message = BroadcastMessage {
            origin: "ctx-1".into(),
            sent_at: 42,
            event: SyncEvent::EntitlementUpdated {
                status: EntitlementStatus {
                    has_active_subscription: true,
                    requires_subscription: true,
                    plan: "pro".into(),
                    days_remaining: 3,
                    checked_at: 41,
                },
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "entitlement-updated");
        assert_eq!(json["origin"], "ctx-1");
        assert_eq!(json["status"]["plan"], "pro");

        let back: BroadcastMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(back.event, SyncEvent::EntitlementUpdated { .. }));
    }
}
