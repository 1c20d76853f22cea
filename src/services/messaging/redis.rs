//! Broker backed implementation of the messaging service.
//!
//! Holds two transport handles: a pub/sub connection that feeds the
//! dispatch task, and a multiplexed connection used for publishing.
//! The pub/sub side subscribes to every cluster channel up front; which
//! messages actually reach handlers is decided by the shared
//! subscription table.

use super::{channels, ClusterMessage, MessagingError, SubscriptionTable};
use crate::config::BrokerConfig;
use futures_util::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct RedisMessaging {
    proxy_id: String,
    /// Publishing handle; cheap to clone per publish
    publisher: redis::aio::MultiplexedConnection,
    connected: Arc<AtomicBool>,
    table: Arc<SubscriptionTable>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl RedisMessaging {
    /// Connects both broker handles and starts the dispatch task.
    /// Failing here makes the caller fall back to loopback messaging.
    pub async fn connect(
        proxy_id: String,
        config: &BrokerConfig,
    ) -> Result<Self, MessagingError> {
        let client = redis::Client::open(config.url())?;

        let mut pubsub = client.get_async_pubsub().await?;
        for channel in channels::ALL {
            pubsub.subscribe(channel).await?;
        }

        let publisher = client.get_multiplexed_tokio_connection().await?;

        let connected = Arc::new(AtomicBool::new(true));
        let table: Arc<SubscriptionTable> = Arc::default();

        let dispatch = {
            let connected = connected.clone();
            let table = table.clone();
            let proxy_id = proxy_id.clone();
            tokio::spawn(async move {
                let mut stream = pubsub.into_on_message();
                while let Some(message) = stream.next().await {
                    let channel = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(value) => value,
                        Err(err) => {
                            warn!("Unreadable payload on {}: {}", channel, err);
                            continue;
                        }
                    };
                    let message: ClusterMessage = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!("Failed to decode message on {}: {}", channel, err);
                            continue;
                        }
                    };

                    let from_self = message.source_proxy_id() == proxy_id;
                    table.dispatch(&channel, &message, from_self);
                }

                // The substrate owns reconnection; from here on this
                // service only reports itself as disconnected
                connected.store(false, Ordering::SeqCst);
                warn!("Broker subscription stream ended, cluster messaging is down");
            })
        };

        debug!("Connected to cluster broker at {}:{}", config.host, config.port);

        Ok(Self {
            proxy_id,
            publisher,
            connected,
            table,
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    pub async fn publish(
        &self,
        channel: &str,
        message: ClusterMessage,
    ) -> Result<(), MessagingError> {
        if !self.is_connected() {
            return Err(MessagingError::Disconnected);
        }

        let payload = serde_json::to_string(&message)?;
        let mut publisher = self.publisher.clone();
        let result: Result<i64, redis::RedisError> = publisher.publish(channel, payload).await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!("Publish to {} failed: {}", channel, err);
                Err(MessagingError::Broker(err))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn shutdown(&self) {
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    pub(super) fn table(&self) -> &SubscriptionTable {
        &self.table
    }
}

#[cfg(test)]
mod test {
    use crate::config::ClusterConfig;
    use crate::services::messaging::MessagingService;
    use std::time::Duration;

    /// An unreachable broker degrades to loopback messaging
    #[tokio::test]
    async fn test_unreachable_broker_falls_back() {
        let mut cluster = ClusterConfig::default();
        cluster.enabled = true;
        // Nothing listens on this port
        cluster.broker.host = "127.0.0.1".to_string();
        cluster.broker.port = 1;

        let messaging = tokio::time::timeout(
            Duration::from_secs(10),
            MessagingService::connect("eu-1".to_string(), &cluster),
        )
        .await
        .expect("fallback should resolve quickly");

        assert!(!messaging.is_cluster_mode());
        assert!(messaging.is_connected());
    }
}
