// src/processing/broadcast.rs
//
// Live status push. Delivery is best-effort/at-most-once: a client that is
// not connected simply misses the update and resyncs through the status
// query on reconnect. Publishing never blocks or fails stage processing.

use async_trait::async_trait;
use lapin::Channel;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data_model::StatusUpdate;
use crate::messaging::queues::publish_json;
use crate::utils::prometheus_metrics::STATUS_BROADCAST_ERRORS_TOTAL;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait StatusBroadcaster: Send + Sync {
    /// Pushes one snapshot toward the owning user. Failures are logged and
    /// counted, never returned.
    async fn publish(&self, update: &StatusUpdate);
}

/// In-process broadcaster: one `broadcast` channel per connected user,
/// consumed by the gateway's WebSocket handlers.
#[derive(Default)]
pub struct ChannelBroadcaster {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<StatusUpdate>>>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the WebSocket route when a user connects.
    pub async fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<StatusUpdate> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drops the per-user channel once its last receiver is gone.
    pub async fn prune(&self, user_id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(sender) = channels.get(&user_id) {
            if sender.receiver_count() == 0 {
                channels.remove(&user_id);
            }
        }
    }
}

#[async_trait]
impl StatusBroadcaster for ChannelBroadcaster {
    async fn publish(&self, update: &StatusUpdate) {
        let channels = self.channels.read().await;
        match channels.get(&update.user_id) {
            Some(sender) => {
                // send() only fails when every receiver is gone; the update
                // is simply missed, which at-most-once allows.
                if sender.send(update.clone()).is_err() {
                    debug!(user_id = %update.user_id, "No live subscribers for status update");
                }
            }
            None => {
                debug!(user_id = %update.user_id, "User has no live channel; status update dropped");
            }
        }
    }
}

/// Broker-backed broadcaster for worker processes: snapshots travel over the
/// status queue to whatever gateway instance holds the user's socket.
pub struct AmqpBroadcaster {
    channel: Channel,
    status_queue: String,
}

impl AmqpBroadcaster {
    pub fn new(channel: Channel, status_queue: impl Into<String>) -> Self {
        AmqpBroadcaster {
            channel,
            status_queue: status_queue.into(),
        }
    }
}

#[async_trait]
impl StatusBroadcaster for AmqpBroadcaster {
    async fn publish(&self, update: &StatusUpdate) {
        if let Err(e) = publish_json(&self.channel, &self.status_queue, update).await {
            STATUS_BROADCAST_ERRORS_TOTAL.inc();
            warn!(
                document_id = %update.document_id,
                error = %e,
                "Failed to publish status snapshot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::DocumentStatus;

    fn update(user_id: Uuid) -> StatusUpdate {
        StatusUpdate {
            document_id: Uuid::new_v4(),
            user_id,
            status: DocumentStatus::Processing,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_update() {
        let broadcaster = ChannelBroadcaster::new();
        let user_id = Uuid::new_v4();

        let mut rx = broadcaster.subscribe(user_id).await;
        let sent = update(user_id);
        broadcaster.publish(&sent).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.document_id, sent.document_id);
        assert_eq!(received.status, DocumentStatus::Processing);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = ChannelBroadcaster::new();
        // Nothing to assert beyond "does not panic / does not block".
        broadcaster.publish(&update(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn updates_are_scoped_to_the_owning_user() {
        let broadcaster = ChannelBroadcaster::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut alice_rx = broadcaster.subscribe(alice).await;
        let mut bob_rx = broadcaster.subscribe(bob).await;

        broadcaster.publish(&update(alice)).await;

        assert!(alice_rx.recv().await.is_ok());
        assert!(bob_rx.try_recv().is_err());
    }
}
