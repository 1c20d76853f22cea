//! Local backend server registry.
//!
//! Backends come from the configuration file or are registered at
//! runtime through the facade. Names are case-insensitive unique within
//! a proxy; descriptors are immutable once created. The cross-proxy
//! replica of remote registrations lives in
//! [`crate::services::cluster::server_list`].

use crate::config::ServerConfig;
use crate::utils::types::Port;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// An immutable description of a backend game server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Case-insensitive unique name within a proxy
    pub name: String,
    pub host: String,
    pub port: Port,
    /// Whether players without a referral land here
    pub is_default: bool,
    /// Hostname presented for SNI based routing, if any
    pub hostname: Option<String>,
}

impl BackendDescriptor {
    pub fn new(name: String, host: String, port: Port, is_default: bool) -> Self {
        Self {
            name,
            host,
            port,
            is_default,
            hostname: None,
        }
    }

    /// Hostname to use for the TLS handshake when dialing
    pub fn server_name(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.host)
    }
}

impl From<&ServerConfig> for BackendDescriptor {
    fn from(config: &ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            is_default: config.default,
            hostname: config.hostname.clone(),
        }
    }
}

/// Public facing view of a backend: its descriptor, the players
/// currently attached through this proxy, and where it is registered
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub host: String,
    pub port: Port,
    pub is_default: bool,
    /// Players on this server as seen by the local proxy
    pub players: Vec<Uuid>,
    /// True when the registration came from a cluster peer
    pub remote: bool,
}

impl RegisteredServer {
    pub fn local(descriptor: &BackendDescriptor, players: Vec<Uuid>) -> Self {
        Self {
            name: descriptor.name.clone(),
            host: descriptor.host.clone(),
            port: descriptor.port,
            is_default: descriptor.is_default,
            players,
            remote: false,
        }
    }
}

/// Registry of backends owned by this proxy
#[derive(Default)]
pub struct Servers {
    servers: RwLock<HashMap<String, Arc<BackendDescriptor>>>,
}

impl Servers {
    /// Creates the registry from the configured server list
    pub fn from_config(configs: &[ServerConfig]) -> Self {
        let servers = Self::default();
        {
            let map = &mut *servers.servers.write();
            for config in configs {
                let descriptor: BackendDescriptor = config.into();
                map.insert(descriptor.name.to_lowercase(), Arc::new(descriptor));
            }
        }
        servers
    }

    /// Registers a backend, replacing any previous entry with the same
    /// case-insensitive name. Returns the replaced descriptor.
    pub fn register(&self, descriptor: BackendDescriptor) -> Option<Arc<BackendDescriptor>> {
        self.servers
            .write()
            .insert(descriptor.name.to_lowercase(), Arc::new(descriptor))
    }

    /// Removes a backend by name
    pub fn unregister(&self, name: &str) -> Option<Arc<BackendDescriptor>> {
        self.servers.write().remove(&name.to_lowercase())
    }

    /// Looks up a backend by case-insensitive name
    pub fn get(&self, name: &str) -> Option<Arc<BackendDescriptor>> {
        self.servers.read().get(&name.to_lowercase()).cloned()
    }

    /// The backend players land on when they carry no referral
    pub fn default_server(&self) -> Option<Arc<BackendDescriptor>> {
        self.servers
            .read()
            .values()
            .find(|server| server.is_default)
            .cloned()
    }

    /// Snapshot of every locally registered backend
    pub fn all(&self) -> Vec<Arc<BackendDescriptor>> {
        self.servers.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn descriptor(name: &str, is_default: bool) -> BackendDescriptor {
        BackendDescriptor::new(name.to_string(), "10.0.0.1".to_string(), 28001, is_default)
    }

    /// Names are case-insensitive unique; registration replaces
    #[test]
    fn test_register_replaces_case_insensitive() {
        let servers = Servers::default();

        assert!(servers.register(descriptor("Lobby", true)).is_none());
        let replaced = servers.register(descriptor("LOBBY", false)).unwrap();
        assert_eq!(replaced.name, "Lobby");

        assert_eq!(servers.all().len(), 1);
        assert!(servers.get("lobby").is_some());
        assert!(servers.default_server().is_none());
    }

    /// Unregister returns the removed descriptor
    #[test]
    fn test_unregister() {
        let servers = Servers::default();
        servers.register(descriptor("arena", false));

        assert!(servers.unregister("ARENA").is_some());
        assert!(servers.get("arena").is_none());
        assert!(servers.unregister("arena").is_none());
    }

    /// SNI hostname falls back to the host
    #[test]
    fn test_server_name() {
        let mut backend = descriptor("lobby", false);
        assert_eq!(backend.server_name(), "10.0.0.1");

        backend.hostname = Some("lobby.internal".to_string());
        assert_eq!(backend.server_name(), "lobby.internal");
    }
}
