//! In-process loopback implementation of the messaging service.
//!
//! Used when clustering is disabled, and as the degraded fallback when
//! the broker is unreachable at startup. Delivery goes through a
//! dispatch task so subscribers see the same executor semantics as the
//! broker implementation: FIFO per channel, never on the publisher's
//! stack.

use super::{ClusterMessage, MessagingError, SubscriptionTable};
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct LocalMessaging {
    proxy_id: String,
    table: Arc<SubscriptionTable>,
    tx: mpsc::UnboundedSender<(String, ClusterMessage)>,
}

impl LocalMessaging {
    pub fn new(proxy_id: String) -> Self {
        let table: Arc<SubscriptionTable> = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, ClusterMessage)>();

        let dispatch_table = table.clone();
        let dispatch_proxy_id = proxy_id.clone();
        tokio::spawn(async move {
            while let Some((channel, message)) = rx.recv().await {
                let from_self = message.source_proxy_id() == dispatch_proxy_id;
                dispatch_table.dispatch(&channel, &message, from_self);
            }
            debug!("Loopback messaging dispatch stopped");
        });

        Self {
            proxy_id,
            table,
            tx,
        }
    }

    pub fn publish(&self, channel: &str, message: ClusterMessage) -> Result<(), MessagingError> {
        self.tx
            .send((channel.to_string(), message))
            .map_err(|_| MessagingError::Disconnected)
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub(super) fn table(&self) -> &SubscriptionTable {
        &self.table
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::services::messaging::{channels, ChatMessage, HeartbeatMessage};
    use std::time::Duration;

    fn heartbeat(source: &str) -> ClusterMessage {
        ClusterMessage::Heartbeat(HeartbeatMessage {
            source_proxy_id: source.to_string(),
            region: "eu".into(),
            host: "proxy.example.com".into(),
            port: 27015,
            player_count: 0,
            max_players: 1000,
            uptime_ms: 0,
            version: "0.1.0".into(),
            shutting_down: false,
        })
    }

    /// Loopback delivery reaches opted-in subscribers off the
    /// publisher's stack
    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_delivery() {
        let messaging = LocalMessaging::new("eu-1".to_string());
        let (tx, rx) = std::sync::mpsc::channel();

        messaging.table().subscribe(
            channels::HEARTBEAT,
            None,
            true,
            Box::new(move |message| {
                let _ = tx.send(message.clone());
            }),
        );

        messaging
            .publish(channels::HEARTBEAT, heartbeat("eu-1"))
            .unwrap();

        let received = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(received.source_proxy_id(), "eu-1");
    }

    /// Messages keep publish order per channel
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_per_channel() {
        let messaging = LocalMessaging::new("eu-1".to_string());
        let (tx, rx) = std::sync::mpsc::channel();

        messaging.table().subscribe(
            channels::CHAT,
            None,
            true,
            Box::new(move |message| {
                if let ClusterMessage::Chat(chat) = message {
                    let _ = tx.send(chat.message.clone());
                }
            }),
        );

        for index in 0..16 {
            messaging
                .publish(
                    channels::CHAT,
                    ClusterMessage::Chat(ChatMessage {
                        source_proxy_id: "eu-1".into(),
                        message: index.to_string(),
                    }),
                )
                .unwrap();
        }

        let received = tokio::task::spawn_blocking(move || {
            (0..16)
                .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
        let expected: Vec<String> = (0..16).map(|index| index.to_string()).collect();
        assert_eq!(received, expected);
    }
}
