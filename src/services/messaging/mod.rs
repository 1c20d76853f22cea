//! Channel/topic messaging between cluster peers.
//!
//! Two interchangeable implementations share one interface: a pub/sub
//! broker client for real clusters and an in-process loopback used when
//! clustering is disabled or the broker is unreachable at startup.
//! Every payload is a JSON envelope tagged with a `messageType`
//! discriminator that selects the concrete record on receive.

use crate::config::ClusterConfig;
use crate::utils::types::Port;
use hashbrown::HashMap;
use log::{error, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub mod local;
pub mod redis;

pub use self::local::LocalMessaging;
pub use self::redis::RedisMessaging;

/// Stable channel identifiers shared by every proxy in a cluster
pub mod channels {
    pub const HEARTBEAT: &str = "numdrassl:heartbeat";
    pub const SERVER_LIST: &str = "numdrassl:server-list";
    pub const PLAYER_COUNT: &str = "numdrassl:player-count";
    pub const CHAT: &str = "numdrassl:chat";
    pub const TRANSFER: &str = "numdrassl:transfer";
    pub const PLUGIN: &str = "numdrassl:plugin";
    pub const BROADCAST: &str = "numdrassl:broadcast";

    /// Every channel the broker implementation listens on
    pub const ALL: [&str; 7] = [
        HEARTBEAT,
        SERVER_LIST,
        PLAYER_COUNT,
        CHAT,
        TRANSFER,
        PLUGIN,
        BROADCAST,
    ];
}

/// Errors that can occur while publishing or connecting
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to reach the broker: {0}")]
    Broker(#[from] ::redis::RedisError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("messaging service is disconnected")]
    Disconnected,
}

/// Periodic liveness and status report from a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    pub source_proxy_id: String,
    pub region: String,
    pub host: String,
    pub port: Port,
    pub player_count: usize,
    pub max_players: usize,
    pub uptime_ms: u64,
    pub version: String,
    pub shutting_down: bool,
}

/// Kind discriminator for server-list replication records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerListKind {
    Register,
    Unregister,
    Sync,
}

/// Replicates one backend registration change across the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerListMessage {
    pub source_proxy_id: String,
    /// Millisecond timestamp at the originating proxy
    pub timestamp: i64,
    pub kind: ServerListKind,
    pub server_name: String,
    pub host: Option<String>,
    pub port: Option<Port>,
    #[serde(default)]
    pub is_default: bool,
}

impl ServerListMessage {
    /// REGISTER and SYNC need an address; UNREGISTER ignores it
    pub fn is_valid(&self) -> bool {
        match self.kind {
            ServerListKind::Register | ServerListKind::Sync => {
                self.host.as_ref().is_some_and(|host| !host.is_empty())
                    && self.port.is_some_and(|port| port >= 1)
            }
            ServerListKind::Unregister => !self.server_name.is_empty(),
        }
    }
}

/// Lightweight player-count update between heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCountMessage {
    pub source_proxy_id: String,
    pub player_count: usize,
}

/// Chat line broadcast to every player on every proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub source_proxy_id: String,
    pub message: String,
}

/// Asks the proxy currently holding a player to move them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMessage {
    pub source_proxy_id: String,
    pub uuid: Uuid,
    pub server_name: String,
}

/// Plugin payload relayed between proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRelayMessage {
    pub source_proxy_id: String,
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Operator broadcast shown to every player on every proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub source_proxy_id: String,
    pub message: String,
}

/// Envelope carried on every cluster channel. The JSON representation
/// tags each record with its `messageType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum ClusterMessage {
    Heartbeat(HeartbeatMessage),
    ServerList(ServerListMessage),
    PlayerCount(PlayerCountMessage),
    Chat(ChatMessage),
    Transfer(TransferMessage),
    Plugin(PluginRelayMessage),
    Broadcast(BroadcastMessage),
}

/// Fieldless view of [`ClusterMessage`] used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Heartbeat,
    ServerList,
    PlayerCount,
    Chat,
    Transfer,
    Plugin,
    Broadcast,
}

impl ClusterMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ClusterMessage::Heartbeat(_) => MessageKind::Heartbeat,
            ClusterMessage::ServerList(_) => MessageKind::ServerList,
            ClusterMessage::PlayerCount(_) => MessageKind::PlayerCount,
            ClusterMessage::Chat(_) => MessageKind::Chat,
            ClusterMessage::Transfer(_) => MessageKind::Transfer,
            ClusterMessage::Plugin(_) => MessageKind::Plugin,
            ClusterMessage::Broadcast(_) => MessageKind::Broadcast,
        }
    }

    /// Proxy that published this message
    pub fn source_proxy_id(&self) -> &str {
        match self {
            ClusterMessage::Heartbeat(msg) => &msg.source_proxy_id,
            ClusterMessage::ServerList(msg) => &msg.source_proxy_id,
            ClusterMessage::PlayerCount(msg) => &msg.source_proxy_id,
            ClusterMessage::Chat(msg) => &msg.source_proxy_id,
            ClusterMessage::Transfer(msg) => &msg.source_proxy_id,
            ClusterMessage::Plugin(msg) => &msg.source_proxy_id,
            ClusterMessage::Broadcast(msg) => &msg.source_proxy_id,
        }
    }
}

/// Handler invoked for every message delivered to a subscription
pub type MessageHandler = Box<dyn Fn(&ClusterMessage) + Send + Sync>;

struct Subscription {
    /// Deliver messages published by this proxy itself
    include_self: bool,
    /// Only deliver this message kind when set
    filter: Option<MessageKind>,
    handler: MessageHandler,
}

/// Channel keyed table of subscriptions, shared by both messaging
/// implementations. Reads dominate; the writer path is only taken on
/// (un)subscribe.
#[derive(Default)]
pub struct SubscriptionTable {
    subscriptions: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
}

impl SubscriptionTable {
    pub fn subscribe(
        &self,
        channel: &str,
        filter: Option<MessageKind>,
        include_self: bool,
        handler: MessageHandler,
    ) {
        let subscription = Arc::new(Subscription {
            include_self,
            filter,
            handler,
        });
        self.subscriptions
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(subscription);
    }

    pub fn unsubscribe_all(&self, channel: &str) {
        self.subscriptions.write().remove(channel);
    }

    /// Delivers a message to every matching subscription in
    /// registration order. A panicking handler is logged and skipped;
    /// a faulty subscriber must not poison the dispatch task.
    pub fn dispatch(&self, channel: &str, message: &ClusterMessage, from_self: bool) {
        let subscriptions = {
            let table = self.subscriptions.read();
            match table.get(channel) {
                Some(values) => values.clone(),
                None => return,
            }
        };

        for subscription in subscriptions {
            if from_self && !subscription.include_self {
                continue;
            }
            if let Some(filter) = subscription.filter {
                if filter != message.kind() {
                    continue;
                }
            }
            let result = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(message)));
            if result.is_err() {
                error!("Subscriber for channel {} panicked", channel);
            }
        }
    }
}

/// Messaging service selected at boot. The broker variant is used when
/// cluster mode is configured and the broker was reachable; everything
/// else runs over the loopback.
pub enum MessagingService {
    Broker(RedisMessaging),
    Loopback(LocalMessaging),
}

impl MessagingService {
    /// Applies the selection rule: cluster enabled and broker
    /// reachable means broker messaging, otherwise loopback with a
    /// degraded-cluster warning.
    pub async fn connect(proxy_id: String, cluster: &ClusterConfig) -> MessagingService {
        if !cluster.enabled {
            return MessagingService::Loopback(LocalMessaging::new(proxy_id));
        }

        match RedisMessaging::connect(proxy_id.clone(), &cluster.broker).await {
            Ok(messaging) => MessagingService::Broker(messaging),
            Err(err) => {
                warn!(
                    "Failed to connect to the cluster broker, running degraded: {}",
                    err
                );
                MessagingService::Loopback(LocalMessaging::new(proxy_id))
            }
        }
    }

    pub async fn publish(
        &self,
        channel: &str,
        message: ClusterMessage,
    ) -> Result<(), MessagingError> {
        match self {
            MessagingService::Broker(broker) => broker.publish(channel, message).await,
            MessagingService::Loopback(local) => local.publish(channel, message),
        }
    }

    pub fn subscribe(
        &self,
        channel: &str,
        filter: Option<MessageKind>,
        include_self: bool,
        handler: impl Fn(&ClusterMessage) + Send + Sync + 'static,
    ) {
        self.table()
            .subscribe(channel, filter, include_self, Box::new(handler));
    }

    pub fn unsubscribe_all(&self, channel: &str) {
        self.table().unsubscribe_all(channel);
    }

    pub fn is_connected(&self) -> bool {
        match self {
            MessagingService::Broker(broker) => broker.is_connected(),
            MessagingService::Loopback(_) => true,
        }
    }

    /// Whether cross-proxy coordination is live
    pub fn is_cluster_mode(&self) -> bool {
        matches!(self, MessagingService::Broker(broker) if broker.is_connected())
    }

    pub fn shutdown(&self) {
        if let MessagingService::Broker(broker) = self {
            broker.shutdown();
        }
    }

    fn table(&self) -> &SubscriptionTable {
        match self {
            MessagingService::Broker(broker) => broker.table(),
            MessagingService::Loopback(local) => local.table(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Envelopes are tagged with messageType and round trip
    #[test]
    fn test_envelope_round_trip() {
        let message = ClusterMessage::Heartbeat(HeartbeatMessage {
            source_proxy_id: "eu-1".to_string(),
            region: "eu".to_string(),
            host: "proxy.example.com".to_string(),
            port: 27015,
            player_count: 12,
            max_players: 1000,
            uptime_ms: 60_000,
            version: "0.1.0".to_string(),
            shutting_down: false,
        });

        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.contains("\"messageType\":\"Heartbeat\""));

        let decoded: ClusterMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    /// Every envelope variant survives encode and decode
    #[test]
    fn test_all_variants_round_trip() {
        let variants = [
            ClusterMessage::ServerList(ServerListMessage {
                source_proxy_id: "eu-1".into(),
                timestamp: 1,
                kind: ServerListKind::Register,
                server_name: "lobby".into(),
                host: Some("10.0.0.5".into()),
                port: Some(28001),
                is_default: true,
            }),
            ClusterMessage::PlayerCount(PlayerCountMessage {
                source_proxy_id: "eu-1".into(),
                player_count: 3,
            }),
            ClusterMessage::Chat(ChatMessage {
                source_proxy_id: "eu-1".into(),
                message: "hello".into(),
            }),
            ClusterMessage::Transfer(TransferMessage {
                source_proxy_id: "eu-1".into(),
                uuid: Uuid::new_v4(),
                server_name: "arena".into(),
            }),
            ClusterMessage::Plugin(PluginRelayMessage {
                source_proxy_id: "eu-1".into(),
                channel: "example:channel".into(),
                payload: vec![1, 2, 3],
            }),
            ClusterMessage::Broadcast(BroadcastMessage {
                source_proxy_id: "eu-1".into(),
                message: "restarting soon".into(),
            }),
        ];

        for message in variants {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ClusterMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    /// REGISTER and SYNC need an address, UNREGISTER does not
    #[test]
    fn test_server_list_validation() {
        let mut message = ServerListMessage {
            source_proxy_id: "eu-1".into(),
            timestamp: 1,
            kind: ServerListKind::Register,
            server_name: "lobby".into(),
            host: Some("10.0.0.5".into()),
            port: Some(28001),
            is_default: false,
        };
        assert!(message.is_valid());

        message.port = Some(0);
        assert!(!message.is_valid());

        message.port = None;
        message.kind = ServerListKind::Unregister;
        assert!(message.is_valid());

        message.kind = ServerListKind::Sync;
        assert!(!message.is_valid());
    }

    /// Self-published messages are filtered unless opted in, and type
    /// filters narrow delivery
    #[test]
    fn test_dispatch_filters() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let table = SubscriptionTable::default();
        let without_self = Arc::new(AtomicUsize::new(0));
        let with_self = Arc::new(AtomicUsize::new(0));
        let heartbeat_only = Arc::new(AtomicUsize::new(0));

        {
            let counter = without_self.clone();
            table.subscribe(
                channels::HEARTBEAT,
                None,
                false,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let counter = with_self.clone();
            table.subscribe(
                channels::HEARTBEAT,
                None,
                true,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let counter = heartbeat_only.clone();
            table.subscribe(
                channels::HEARTBEAT,
                Some(MessageKind::ServerList),
                true,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let message = ClusterMessage::PlayerCount(PlayerCountMessage {
            source_proxy_id: "eu-1".into(),
            player_count: 0,
        });

        table.dispatch(channels::HEARTBEAT, &message, true);
        table.dispatch(channels::HEARTBEAT, &message, false);

        assert_eq!(without_self.load(Ordering::SeqCst), 1);
        assert_eq!(with_self.load(Ordering::SeqCst), 2);
        assert_eq!(heartbeat_only.load(Ordering::SeqCst), 0);
    }

    /// A panicking subscriber does not poison later subscribers
    #[test]
    fn test_panicking_subscriber_is_isolated() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let table = SubscriptionTable::default();
        table.subscribe(
            channels::CHAT,
            None,
            true,
            Box::new(|_| panic!("faulty subscriber")),
        );

        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let counter = delivered.clone();
            table.subscribe(
                channels::CHAT,
                None,
                true,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let message = ClusterMessage::Chat(ChatMessage {
            source_proxy_id: "eu-1".into(),
            message: "hello".into(),
        });
        table.dispatch(channels::CHAT, &message, false);

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
