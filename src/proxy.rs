//! Root proxy value and the public facade.
//!
//! All core state hangs off one [`Proxy`] value that is passed
//! explicitly; there are no ambient statics. The facade methods here
//! are the surface the extension layer sees: player and server
//! aggregation, transfers, and cluster-wide publishing.

use crate::config::Config;
use crate::ext::ProxyEvents;
use crate::services::cluster::registry::{
    ClusterEvent, ProxyRegistry, DEFAULT_STALE_THRESHOLD,
};
use crate::services::cluster::server_list::ServerListHandler;
use crate::services::control::ControlManager;
use crate::services::messaging::{
    channels, ChatMessage, ClusterMessage, MessageKind, MessagingService, PlayerCountMessage,
    ServerListKind, ServerListMessage,
};
use crate::services::servers::{BackendDescriptor, RegisteredServer, Servers};
use crate::services::session_service::SessionService;
use crate::services::sessions::Sessions;
use crate::session::backend::BackendConnector;
use crate::session::models::{ChatFrame, ClientReferralFrame};
use crate::session::SessionLink;
use crate::utils::signing::{sign_player_referral, SigningKey};
use crate::utils::tls::TlsContext;
use hashbrown::HashMap;
use log::{debug, info, warn};
use rand::Rng;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Proxy ids are capped so heartbeats stay small
const MAX_PROXY_ID_LENGTH: usize = 32;

/// Ports above this cannot be encoded in a client referral
const MAX_REFERRAL_PORT: u16 = 32767;

/// Errors surfaced by the facade transfer entry points
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no backend server named {0}")]
    UnknownServer(String),
    #[error("public port {0} cannot be used for client referrals")]
    PortLimit(u16),
    #[error("session has no player identity")]
    NoIdentity,
}

pub struct Proxy {
    pub config: Config,
    /// Identifier of this proxy within the cluster
    pub proxy_id: String,
    pub sessions: Arc<Sessions>,
    pub servers: Servers,
    pub session_service: SessionService,
    pub messaging: Arc<MessagingService>,
    pub registry: Arc<ProxyRegistry>,
    pub server_list: Arc<ServerListHandler>,
    pub control: Arc<ControlManager>,
    pub connector: BackendConnector,
    pub signing_key: Arc<SigningKey>,
    pub hooks: Arc<dyn ProxyEvents>,
}

impl Proxy {
    /// Builds the proxy root: services, messaging (with its fallback
    /// selection), and all cross-service subscriptions.
    pub async fn new(
        config: Config,
        tls: &TlsContext,
        hooks: Arc<dyn ProxyEvents>,
    ) -> io::Result<Arc<Proxy>> {
        let proxy_id = resolve_proxy_id(&config.cluster.proxy_id);
        let signing_key = Arc::new(SigningKey::resolve(config.secret.as_deref()));

        let sessions = Arc::new(Sessions::default());
        let servers = Servers::from_config(&config.servers);
        let session_service = SessionService::new(config.session_service.clone());

        let messaging = Arc::new(MessagingService::connect(proxy_id.clone(), &config.cluster).await);
        if config.cluster.enabled && !messaging.is_cluster_mode() {
            warn!("Cluster mode degraded: operating as a single node");
        }

        let registry = Arc::new(ProxyRegistry::new(proxy_id.clone(), DEFAULT_STALE_THRESHOLD));
        let server_list = Arc::new(ServerListHandler::new(proxy_id.clone()));

        let connector = BackendConnector::new(tls.client.clone())?;
        let control_connector = BackendConnector::new(tls.control.clone())?;
        let control = Arc::new(ControlManager::new(
            control_connector,
            signing_key.clone(),
            hooks.clone(),
        ));
        for backend in servers.all() {
            control.track_backend(backend);
        }

        let proxy = Arc::new(Proxy {
            config,
            proxy_id,
            sessions,
            servers,
            session_service,
            messaging,
            registry,
            server_list,
            control,
            connector,
            signing_key,
            hooks,
        });

        Self::wire_subscriptions(&proxy);
        Ok(proxy)
    }

    /// Installs the standing cluster subscriptions. Handlers run on
    /// the messaging dispatch task and stay non-blocking.
    fn wire_subscriptions(proxy: &Arc<Proxy>) {
        // Heartbeats maintain the registry; the local entry rides the
        // same path, which keeps it fresh in loopback mode too
        {
            let registry = proxy.registry.clone();
            proxy.messaging.subscribe(
                channels::HEARTBEAT,
                Some(MessageKind::Heartbeat),
                true,
                move |message| {
                    if let ClusterMessage::Heartbeat(heartbeat) = message {
                        registry.handle_heartbeat(heartbeat);
                    }
                },
            );
        }

        // Server-list replication from peers
        {
            let server_list = proxy.server_list.clone();
            proxy.messaging.subscribe(
                channels::SERVER_LIST,
                Some(MessageKind::ServerList),
                false,
                move |message| {
                    if let ClusterMessage::ServerList(record) = message {
                        server_list.handle_message(record);
                    }
                },
            );
        }

        // A departing peer takes its server registrations with it
        {
            let server_list = proxy.server_list.clone();
            proxy.registry.on_event(move |event| {
                if let ClusterEvent::ProxyLeave { id, .. } = event {
                    server_list.handle_proxy_leave(id);
                }
            });
        }

        // Player-count updates between heartbeats
        {
            let registry = proxy.registry.clone();
            proxy.messaging.subscribe(
                channels::PLAYER_COUNT,
                Some(MessageKind::PlayerCount),
                false,
                move |message| {
                    if let ClusterMessage::PlayerCount(update) = message {
                        registry.update_player_count(&update.source_proxy_id, update.player_count);
                    }
                },
            );
        }

        // A peer asked us to move a player we hold
        {
            let weak: Weak<Proxy> = Arc::downgrade(proxy);
            proxy.messaging.subscribe(
                channels::TRANSFER,
                Some(MessageKind::Transfer),
                false,
                move |message| {
                    let proxy = match weak.upgrade() {
                        Some(value) => value,
                        None => return,
                    };
                    if let ClusterMessage::Transfer(transfer) = message {
                        let session = match proxy.sessions.lookup_player(transfer.uuid) {
                            Some(value) => value,
                            None => return,
                        };
                        let server = transfer.server_name.clone();
                        tokio::spawn(async move {
                            if let Err(err) = proxy.transfer_player(&session, &server).await {
                                warn!("Cluster transfer failed: {}", err);
                            }
                        });
                    }
                },
            );
        }

        // Operator broadcasts reach every local player
        {
            let weak: Weak<Proxy> = Arc::downgrade(proxy);
            proxy.messaging.subscribe(
                channels::BROADCAST,
                Some(MessageKind::Broadcast),
                false,
                move |message| {
                    let proxy = match weak.upgrade() {
                        Some(value) => value,
                        None => return,
                    };
                    if let ClusterMessage::Broadcast(broadcast) = message {
                        proxy.send_chat_to_all(&broadcast.message);
                    }
                },
            );
        }
    }

    /// Announces the local server list to the cluster. Called once
    /// after startup so peers that joined earlier converge without a
    /// request channel.
    pub async fn sync_servers(&self) {
        for backend in self.servers.all() {
            let message = self.server_list_message(&backend, ServerListKind::Sync);
            if let Err(err) = self
                .messaging
                .publish(channels::SERVER_LIST, ClusterMessage::ServerList(message))
                .await
            {
                debug!("Server sync publish failed: {}", err);
            }
        }
    }

    /// Whether cross-proxy coordination is live
    pub fn is_cluster_mode(&self) -> bool {
        self.messaging.is_cluster_mode()
    }

    // Player aggregation

    pub fn all_players(&self) -> Vec<SessionLink> {
        self.sessions.live_players()
    }

    pub fn get_player_by_uuid(&self, uuid: Uuid) -> Option<SessionLink> {
        self.sessions.lookup_player(uuid)
    }

    pub fn get_player_by_name(&self, name: &str) -> Option<SessionLink> {
        self.sessions.lookup_player_by_name(name)
    }

    pub fn player_count(&self) -> usize {
        self.sessions.player_count()
    }

    /// Sum of players across the cluster. Peer counts come from the
    /// registry; the local count is always live.
    pub fn global_player_count(&self) -> usize {
        let peers: usize = self
            .registry
            .snapshot()
            .iter()
            .filter(|info| info.id != self.proxy_id)
            .map(|info| info.player_count)
            .sum();
        peers + self.sessions.player_count()
    }

    // Server aggregation

    /// Merged server view; local entries shadow remote entries with
    /// the same case-insensitive name
    pub fn all_servers(&self) -> Vec<RegisteredServer> {
        let mut merged: HashMap<String, RegisteredServer> = HashMap::new();

        for remote in self.server_list.all() {
            merged.insert(
                remote.name.to_lowercase(),
                RegisteredServer {
                    name: remote.name.clone(),
                    host: remote.host.clone(),
                    port: remote.port,
                    is_default: remote.is_default,
                    players: Vec::new(),
                    remote: true,
                },
            );
        }

        for local in self.servers.all() {
            let players = self
                .sessions
                .players_on_server(&local.name)
                .iter()
                .filter_map(|session| session.uuid())
                .collect();
            merged.insert(
                local.name.to_lowercase(),
                RegisteredServer::local(&local, players),
            );
        }

        merged.into_values().collect()
    }

    pub fn get_server(&self, name: &str) -> Option<RegisteredServer> {
        if let Some(local) = self.servers.get(name) {
            let players = self
                .sessions
                .players_on_server(&local.name)
                .iter()
                .filter_map(|session| session.uuid())
                .collect();
            return Some(RegisteredServer::local(&local, players));
        }

        self.server_list.find(name).map(|remote| RegisteredServer {
            name: remote.name.clone(),
            host: remote.host.clone(),
            port: remote.port,
            is_default: remote.is_default,
            players: Vec::new(),
            remote: true,
        })
    }

    /// Registers a backend on this proxy and replicates it to the
    /// cluster. An existing entry with the same name is replaced.
    pub async fn register_server(&self, descriptor: BackendDescriptor) {
        let message = {
            let backend = Arc::new(descriptor.clone());
            self.control.track_backend(backend);
            let replaced = self.servers.register(descriptor.clone());
            if replaced.is_some() {
                info!("Replaced backend server {}", descriptor.name);
            } else {
                info!("Registered backend server {}", descriptor.name);
            }
            self.server_list_message(&descriptor, ServerListKind::Register)
        };

        if let Err(err) = self
            .messaging
            .publish(channels::SERVER_LIST, ClusterMessage::ServerList(message))
            .await
        {
            debug!("Server register publish failed: {}", err);
        }
    }

    /// Removes a backend from this proxy and replicates the removal
    pub async fn unregister_server(&self, name: &str) -> bool {
        let removed = match self.servers.unregister(name) {
            Some(value) => value,
            None => return false,
        };
        self.control.untrack_backend(name);
        info!("Unregistered backend server {}", removed.name);

        let message = ServerListMessage {
            source_proxy_id: self.proxy_id.clone(),
            timestamp: now_millis(),
            kind: ServerListKind::Unregister,
            server_name: removed.name.clone(),
            host: None,
            port: None,
            is_default: false,
        };
        if let Err(err) = self
            .messaging
            .publish(channels::SERVER_LIST, ClusterMessage::ServerList(message))
            .await
        {
            debug!("Server unregister publish failed: {}", err);
        }
        true
    }

    // Transfers

    /// Moves a connected session to another backend without dropping
    /// the client connection
    pub async fn transfer_player(
        &self,
        session: &SessionLink,
        server_name: &str,
    ) -> Result<(), TransferError> {
        let target = self.resolve_backend(server_name)?;
        session.switch_to_backend(target).await;
        Ok(())
    }

    /// Client-side transfer: tells the client to reconnect to this
    /// proxy's public address carrying a referral that encodes its
    /// destination backend
    pub fn refer_player(
        &self,
        session: &SessionLink,
        server_name: &str,
    ) -> Result<(), TransferError> {
        let public_port = self.config.public_port;
        if public_port > MAX_REFERRAL_PORT {
            return Err(TransferError::PortLimit(public_port));
        }
        let target = self.resolve_backend(server_name)?;

        let (uuid, username) = match (session.uuid(), session.username()) {
            (Some(uuid), Some(username)) => (uuid, username),
            _ => return Err(TransferError::NoIdentity),
        };

        let referral = sign_player_referral(
            &self.signing_key,
            uuid,
            &username,
            &target.name,
            &session.addr.ip().to_string(),
        );
        session.push_client(
            ClientReferralFrame {
                host: self.config.advertised_host().to_string(),
                port: public_port,
                referral,
            }
            .encode(),
        );
        Ok(())
    }

    fn resolve_backend(&self, name: &str) -> Result<Arc<BackendDescriptor>, TransferError> {
        if let Some(local) = self.servers.get(name) {
            return Ok(local);
        }
        // Remote registrations are dialable too; they carry an address
        if let Some(remote) = self.server_list.find(name) {
            return Ok(Arc::new(BackendDescriptor::new(
                remote.name.clone(),
                remote.host.clone(),
                remote.port,
                remote.is_default,
            )));
        }
        Err(TransferError::UnknownServer(name.to_string()))
    }

    // Cluster-wide messaging helpers

    /// Shows a chat line to every player on every proxy
    pub async fn broadcast_message(&self, text: &str) {
        self.send_chat_to_all(text);
        let message = ClusterMessage::Broadcast(crate::services::messaging::BroadcastMessage {
            source_proxy_id: self.proxy_id.clone(),
            message: text.to_string(),
        });
        if let Err(err) = self.messaging.publish(channels::BROADCAST, message).await {
            debug!("Broadcast publish failed: {}", err);
        }
    }

    /// Announces the local player count between heartbeats. Fired on
    /// session connect and disconnect; fire-and-forget.
    pub fn publish_player_count(&self) {
        let messaging = self.messaging.clone();
        let message = ClusterMessage::PlayerCount(PlayerCountMessage {
            source_proxy_id: self.proxy_id.clone(),
            player_count: self.sessions.player_count(),
        });
        tokio::spawn(async move {
            if let Err(err) = messaging.publish(channels::PLAYER_COUNT, message).await {
                debug!("Player count publish failed: {}", err);
            }
        });
    }

    /// Relays a plugin payload to peer proxies
    pub async fn publish_plugin(&self, plugin_channel: &str, payload: Vec<u8>) {
        let message = ClusterMessage::Plugin(crate::services::messaging::PluginRelayMessage {
            source_proxy_id: self.proxy_id.clone(),
            channel: plugin_channel.to_string(),
            payload,
        });
        if let Err(err) = self.messaging.publish(channels::PLUGIN, message).await {
            debug!("Plugin publish failed: {}", err);
        }
    }

    /// Relays a chat line on the cluster chat channel
    pub async fn publish_chat(&self, text: &str) {
        let message = ClusterMessage::Chat(ChatMessage {
            source_proxy_id: self.proxy_id.clone(),
            message: text.to_string(),
        });
        if let Err(err) = self.messaging.publish(channels::CHAT, message).await {
            debug!("Chat publish failed: {}", err);
        }
    }

    fn send_chat_to_all(&self, text: &str) {
        let frame = ChatFrame {
            text: text.to_string(),
            color: "white".to_string(),
        }
        .encode();
        for session in self.sessions.live_players() {
            session.push_client(frame.clone());
        }
    }

    fn server_list_message(
        &self,
        descriptor: &BackendDescriptor,
        kind: ServerListKind,
    ) -> ServerListMessage {
        ServerListMessage {
            source_proxy_id: self.proxy_id.clone(),
            timestamp: now_millis(),
            kind,
            server_name: descriptor.name.clone(),
            host: Some(descriptor.host.clone()),
            port: Some(descriptor.port),
            is_default: descriptor.is_default,
        }
    }

    /// Stops cluster participation; the final heartbeat is published
    /// by the caller beforehand
    pub fn shutdown(&self) {
        self.messaging.shutdown();
    }
}

/// Resolves the cluster proxy id: configured value trimmed to the cap,
/// or a generated one when unset
fn resolve_proxy_id(configured: &str) -> String {
    if configured.is_empty() {
        let suffix: u32 = rand::thread_rng().gen();
        let id = format!("proxy-{:08x}", suffix);
        info!("No proxy id configured, using {}", id);
        return id;
    }
    if configured.len() > MAX_PROXY_ID_LENGTH {
        let truncated: String = configured.chars().take(MAX_PROXY_ID_LENGTH).collect();
        warn!(
            "Configured proxy id exceeds {} characters, truncated to {}",
            MAX_PROXY_ID_LENGTH, truncated
        );
        return truncated;
    }
    configured.to_string()
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Clock went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ext::DefaultEvents;
    use crate::services::messaging::LocalMessaging;
    use crate::session::Session;
    use crate::utils::tls::insecure_client_config;

    async fn test_proxy(config: Config) -> Arc<Proxy> {
        let (signing_key, _) = SigningKey::generate();
        let signing_key = Arc::new(signing_key);
        let hooks: Arc<dyn ProxyEvents> = Arc::new(DefaultEvents);

        Arc::new(Proxy {
            config,
            proxy_id: "local".to_string(),
            sessions: Arc::new(Sessions::default()),
            servers: Servers::default(),
            session_service: SessionService::new("http://127.0.0.1:9".to_string()),
            messaging: Arc::new(MessagingService::Loopback(LocalMessaging::new(
                "local".to_string(),
            ))),
            registry: Arc::new(ProxyRegistry::new(
                "local".to_string(),
                DEFAULT_STALE_THRESHOLD,
            )),
            server_list: Arc::new(ServerListHandler::new("local".to_string())),
            control: Arc::new(ControlManager::new(
                BackendConnector::new(insecure_client_config()).unwrap(),
                signing_key.clone(),
                hooks.clone(),
            )),
            connector: BackendConnector::new(insecure_client_config()).unwrap(),
            signing_key,
            hooks,
        })
    }

    fn remote_register(owner: &str, name: &str) -> ServerListMessage {
        ServerListMessage {
            source_proxy_id: owner.to_string(),
            timestamp: 1,
            kind: ServerListKind::Register,
            server_name: name.to_string(),
            host: Some("10.0.0.9".to_string()),
            port: Some(28001),
            is_default: false,
        }
    }

    /// Proxy ids respect the length cap and fall back to generation
    #[test]
    fn test_resolve_proxy_id() {
        assert_eq!(resolve_proxy_id("eu-1"), "eu-1");

        let generated = resolve_proxy_id("");
        assert!(generated.starts_with("proxy-"));
        assert!(generated.len() <= MAX_PROXY_ID_LENGTH);

        let long = "x".repeat(40);
        assert_eq!(resolve_proxy_id(&long).len(), MAX_PROXY_ID_LENGTH);
    }

    /// Local registrations shadow remote entries of the same name, and
    /// unregistering restores the shadowed remote value
    #[tokio::test]
    async fn test_local_shadows_remote() {
        let proxy = test_proxy(Config::default()).await;

        proxy
            .server_list
            .handle_message(&remote_register("peer", "Lobby"));
        assert!(proxy.get_server("lobby").unwrap().remote);

        proxy
            .register_server(BackendDescriptor::new(
                "lobby".to_string(),
                "10.0.0.1".to_string(),
                28005,
                true,
            ))
            .await;

        let server = proxy.get_server("LOBBY").unwrap();
        assert!(!server.remote);
        assert_eq!(server.port, 28005);
        assert_eq!(proxy.all_servers().len(), 1);

        assert!(proxy.unregister_server("lobby").await);
        assert!(proxy.get_server("lobby").unwrap().remote);
        assert!(!proxy.unregister_server("lobby").await);
        assert!(proxy.all_servers().len() == 1);
    }

    /// Without a broker the proxy reports single-node values
    #[tokio::test]
    async fn test_degraded_single_node() {
        let proxy = test_proxy(Config::default()).await;
        assert!(!proxy.is_cluster_mode());
        assert!(proxy.messaging.is_connected());
        assert_eq!(proxy.global_player_count(), proxy.player_count());
    }

    /// Client referrals are refused for unencodable public ports
    #[tokio::test]
    async fn test_refer_player_port_limit() {
        let mut config = Config::default();
        config.public_port = 40000;
        let proxy = test_proxy(config).await;

        let session = Session::for_tests(1, "127.0.0.1:4000".parse().unwrap());
        session.set_player(Uuid::new_v4(), "Steve".to_string());

        assert!(matches!(
            proxy.refer_player(&session, "lobby"),
            Err(TransferError::PortLimit(40000))
        ));
    }

    /// Transfers to unknown servers are refused
    #[tokio::test]
    async fn test_transfer_unknown_server() {
        let proxy = test_proxy(Config::default()).await;
        let session = Session::for_tests(1, "127.0.0.1:4000".parse().unwrap());

        assert!(matches!(
            proxy.transfer_player(&session, "ghost").await,
            Err(TransferError::UnknownServer(_))
        ));
    }
}
