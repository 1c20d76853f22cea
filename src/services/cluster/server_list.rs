//! Replica of backend registrations owned by cluster peers.
//!
//! Keeps a two level map from owning proxy id to lowercased server
//! name. REGISTER and SYNC messages upsert, UNREGISTER removes, and a
//! peer leaving the cluster purges everything it owned. Messages this
//! proxy published itself are ignored; the local server list lives in
//! [`crate::services::servers`].

use crate::services::messaging::{ServerListKind, ServerListMessage};
use crate::utils::types::Port;
use hashbrown::HashMap;
use log::{debug, warn};
use parking_lot::RwLock;
use std::sync::Arc;

/// A backend registered by a cluster peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServer {
    /// Proxy that owns this registration
    pub owner: String,
    pub name: String,
    pub host: String,
    pub port: Port,
    pub is_default: bool,
}

/// Change notification for the replicated list
#[derive(Debug, Clone)]
pub enum ServerListEvent {
    ServerAdded(Arc<RemoteServer>),
    ServerRemoved(Arc<RemoteServer>),
}

type EventListener = Box<dyn Fn(&ServerListEvent) + Send + Sync>;

type OwnerMap = HashMap<String, HashMap<String, Arc<RemoteServer>>>;

pub struct ServerListHandler {
    local_id: String,
    servers: RwLock<OwnerMap>,
    listeners: RwLock<Vec<EventListener>>,
}

impl ServerListHandler {
    pub fn new(local_id: String) -> Self {
        Self {
            local_id,
            servers: Default::default(),
            listeners: Default::default(),
        }
    }

    /// Registers a listener for add and remove events. Listeners run
    /// on the messaging dispatch task and must not block.
    pub fn on_event(&self, listener: impl Fn(&ServerListEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn emit(&self, event: ServerListEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Applies one replication message from the cluster
    pub fn handle_message(&self, message: &ServerListMessage) {
        if message.source_proxy_id == self.local_id {
            return;
        }
        if !message.is_valid() {
            warn!(
                "Ignoring malformed server-list message from {} for {}",
                message.source_proxy_id, message.server_name
            );
            return;
        }

        match message.kind {
            ServerListKind::Register | ServerListKind::Sync => {
                let server = Arc::new(RemoteServer {
                    owner: message.source_proxy_id.clone(),
                    name: message.server_name.clone(),
                    // Validated above
                    host: message.host.clone().unwrap_or_default(),
                    port: message.port.unwrap_or_default(),
                    is_default: message.is_default,
                });

                self.servers
                    .write()
                    .entry(message.source_proxy_id.clone())
                    .or_default()
                    .insert(message.server_name.to_lowercase(), server.clone());

                debug!(
                    "Remote server {} registered by {}",
                    server.name, server.owner
                );
                self.emit(ServerListEvent::ServerAdded(server));
            }
            ServerListKind::Unregister => {
                let removed = {
                    let servers = &mut *self.servers.write();
                    let owned = match servers.get_mut(&message.source_proxy_id) {
                        Some(value) => value,
                        None => return,
                    };
                    let removed = owned.remove(&message.server_name.to_lowercase());
                    if owned.is_empty() {
                        servers.remove(&message.source_proxy_id);
                    }
                    removed
                };

                if let Some(server) = removed {
                    debug!(
                        "Remote server {} unregistered by {}",
                        server.name, server.owner
                    );
                    self.emit(ServerListEvent::ServerRemoved(server));
                }
            }
        }
    }

    /// Purges every server owned by a proxy that left the cluster
    pub fn handle_proxy_leave(&self, proxy_id: &str) {
        let removed = match self.servers.write().remove(proxy_id) {
            Some(value) => value,
            None => return,
        };

        debug!(
            "Dropping {} servers owned by departed proxy {}",
            removed.len(),
            proxy_id
        );
        for (_, server) in removed {
            self.emit(ServerListEvent::ServerRemoved(server));
        }
    }

    /// Finds a remote server by case-insensitive name, any owner
    pub fn find(&self, name: &str) -> Option<Arc<RemoteServer>> {
        let lowered = name.to_lowercase();
        let servers = self.servers.read();
        servers
            .values()
            .find_map(|owned| owned.get(&lowered).cloned())
    }

    /// Snapshot of every remote registration
    pub fn all(&self) -> Vec<Arc<RemoteServer>> {
        self.servers
            .read()
            .values()
            .flat_map(|owned| owned.values().cloned())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn register(owner: &str, name: &str) -> ServerListMessage {
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

    fn unregister(owner: &str, name: &str) -> ServerListMessage {
        ServerListMessage {
            source_proxy_id: owner.to_string(),
            timestamp: 2,
            kind: ServerListKind::Unregister,
            server_name: name.to_string(),
            host: None,
            port: None,
            is_default: false,
        }
    }

    /// Unregistration from proxy P only removes entries owned by P
    #[test]
    fn test_owner_scope() {
        let handler = ServerListHandler::new("local".into());

        handler.handle_message(&register("p1", "lobby"));
        handler.handle_message(&register("p2", "lobby"));
        assert_eq!(handler.all().len(), 2);

        handler.handle_message(&unregister("p1", "LOBBY"));

        let remaining = handler.all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].owner, "p2");
    }

    /// Self-sourced messages are ignored entirely
    #[test]
    fn test_ignores_self() {
        let handler = ServerListHandler::new("local".into());
        handler.handle_message(&register("local", "lobby"));
        assert!(handler.all().is_empty());
    }

    /// A departing peer takes all of its servers with it
    #[test]
    fn test_leave_purges_owner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let handler = ServerListHandler::new("local".into());
        let removed = Arc::new(AtomicUsize::new(0));
        {
            let removed = removed.clone();
            handler.on_event(move |event| {
                if matches!(event, ServerListEvent::ServerRemoved(_)) {
                    removed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        handler.handle_message(&register("p1", "lobby"));
        handler.handle_message(&register("p1", "arena"));
        handler.handle_message(&register("p2", "creative"));

        handler.handle_proxy_leave("p1");
        handler.handle_proxy_leave("p1");

        assert_eq!(removed.load(Ordering::SeqCst), 2);
        assert_eq!(handler.all().len(), 1);
        assert!(handler.find("creative").is_some());
        assert!(handler.find("lobby").is_none());
    }

    /// Invalid registration messages are dropped
    #[test]
    fn test_invalid_rejected() {
        let handler = ServerListHandler::new("local".into());
        let mut message = register("p1", "lobby");
        message.port = Some(0);
        handler.handle_message(&message);
        assert!(handler.all().is_empty());
    }
}
