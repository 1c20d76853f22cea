//! Player-independent control connections to the backends.
//!
//! Each backend gets one long-lived QUIC bidirectional stream used for
//! plugin messaging. The handshake authenticates the proxy with a
//! control-marker referral; a supervisor task reconnects dead
//! connections with exponential backoff. Individual sends are never
//! retried, callers may resend later.

use crate::ext::ProxyEvents;
use crate::services::servers::BackendDescriptor;
use crate::session::backend::BackendConnector;
use crate::session::models::PluginMessage;
use crate::session::packet::{Frame, FrameCodec};
use crate::utils::signing::{sign_control_referral, SigningKey};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use hashbrown::{HashMap, HashSet};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Channel the control handshake rides on
pub const CONTROL_HANDSHAKE_CHANNEL: &str = "numdrassl:control_handshake";

/// Supervisor tick driving reconnect attempts
const RECONNECT_TICK: Duration = Duration::from_secs(5);

/// First reconnect delay after a failure
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);

/// Reconnect delay ceiling
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Lifecycle of one control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

struct ControlConnection {
    backend: Arc<BackendDescriptor>,
    state: ControlState,
    tx: Option<mpsc::UnboundedSender<Frame>>,
    connection: Option<quinn::Connection>,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every (re)connect so stale tasks can't tear down a
    /// newer connection
    generation: u64,
    next_attempt: Instant,
    backoff: Duration,
}

impl ControlConnection {
    fn new(backend: Arc<BackendDescriptor>) -> Self {
        Self {
            backend,
            state: ControlState::Disconnected,
            tx: None,
            connection: None,
            reader: None,
            generation: 0,
            next_attempt: Instant::now(),
            backoff: BACKOFF_INITIAL,
        }
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"control closed");
        }
        self.tx = None;
    }
}

pub struct ControlManager {
    connector: BackendConnector,
    signing_key: Arc<SigningKey>,
    hooks: Arc<dyn ProxyEvents>,
    connections: Mutex<HashMap<String, ControlConnection>>,
    /// Channels the extension layer wants plugin messages from
    registered_channels: RwLock<HashSet<String>>,
}

impl ControlManager {
    pub fn new(
        connector: BackendConnector,
        signing_key: Arc<SigningKey>,
        hooks: Arc<dyn ProxyEvents>,
    ) -> Self {
        Self {
            connector,
            signing_key,
            hooks,
            connections: Default::default(),
            registered_channels: Default::default(),
        }
    }

    /// Starts maintaining a control connection to the backend
    pub fn track_backend(&self, backend: Arc<BackendDescriptor>) {
        let mut connections = self.connections.lock();
        connections
            .entry(backend.name.to_lowercase())
            .or_insert_with(|| ControlConnection::new(backend));
    }

    /// Stops maintaining a control connection and closes it
    pub fn untrack_backend(&self, name: &str) {
        let removed = self.connections.lock().remove(&name.to_lowercase());
        if let Some(mut connection) = removed {
            connection.teardown();
        }
    }

    /// Registers a plugin channel for inbound delivery
    pub fn register_channel(&self, channel: &str) {
        self.registered_channels.write().insert(channel.to_string());
    }

    pub fn unregister_channel(&self, channel: &str) {
        self.registered_channels.write().remove(channel);
    }

    fn is_channel_registered(&self, channel: &str) -> bool {
        self.registered_channels.read().contains(channel)
    }

    /// Current state of the named backend's control connection
    pub fn state(&self, name: &str) -> ControlState {
        self.connections
            .lock()
            .get(&name.to_lowercase())
            .map(|connection| connection.state)
            .unwrap_or(ControlState::Disconnected)
    }

    /// Sends a plugin message to one backend. Returns false without an
    /// ACTIVE connection; the message is not queued for later.
    pub fn send(&self, name: &str, channel: &str, payload: Bytes) -> bool {
        let connections = self.connections.lock();
        let connection = match connections.get(&name.to_lowercase()) {
            Some(value) if value.state == ControlState::Active => value,
            _ => return false,
        };
        match &connection.tx {
            Some(tx) => tx
                .send(PluginMessage::new(channel, payload).encode())
                .is_ok(),
            None => false,
        }
    }

    /// Sends a plugin message to every backend with an active control
    /// connection, returning how many accepted it
    pub fn broadcast(&self, channel: &str, payload: Bytes) -> usize {
        let connections = self.connections.lock();
        let mut delivered = 0;
        for connection in connections.values() {
            if connection.state != ControlState::Active {
                continue;
            }
            if let Some(tx) = &connection.tx {
                if tx
                    .send(PluginMessage::new(channel, payload.clone()).encode())
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Marks a connection dead and schedules the next attempt with
    /// exponential backoff. Stale generations are ignored.
    fn mark_disconnected(&self, name: &str, generation: u64) {
        let mut connections = self.connections.lock();
        let connection = match connections.get_mut(name) {
            Some(value) => value,
            None => return,
        };
        if connection.generation != generation
            || connection.state == ControlState::Disconnected
        {
            return;
        }

        connection.teardown();
        connection.state = ControlState::Disconnected;
        let delay = connection.backoff;
        connection.next_attempt = Instant::now() + delay;
        connection.backoff = (delay * 2).min(BACKOFF_MAX);
        debug!(
            "Control connection to {} lost, retrying in {:?}",
            connection.backend.name, delay
        );
    }

    /// One connect + handshake attempt for a backend already marked
    /// as connecting
    async fn attempt(self: Arc<Self>, key: String, backend: Arc<BackendDescriptor>, generation: u64) {
        let result = Self::dial(&self, &key, &backend, generation).await;
        if let Err(err) = result {
            debug!("Control connect to {} failed: {}", backend.name, err);
            self.mark_disconnected(&key, generation);
        }
    }

    async fn dial(
        manager: &Arc<Self>,
        key: &str,
        backend: &Arc<BackendDescriptor>,
        generation: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let connection = manager.connector.connect(backend).await?;
        let (send, recv) = connection.open_bi().await?;

        {
            let mut connections = manager.connections.lock();
            match connections.get_mut(key) {
                Some(value) if value.generation == generation => {
                    value.state = ControlState::Handshaking;
                }
                // Untracked or superseded while dialing
                _ => {
                    connection.close(0u32.into(), b"superseded");
                    return Ok(());
                }
            }
        }

        // Authenticate the stream before anything else rides on it
        let referral = sign_control_referral(&manager.signing_key, &backend.name);
        let handshake = PluginMessage::new(CONTROL_HANDSHAKE_CHANNEL, referral).encode();

        let mut writer = FramedWrite::new(send, FrameCodec);
        writer.send(handshake).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        {
            let manager = manager.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                manager.mark_disconnected(&key, generation);
            });
        }

        let reader = {
            let manager = manager.clone();
            let backend = backend.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                let mut reader = FramedRead::new(recv, FrameCodec);
                while let Some(result) = reader.next().await {
                    let frame = match result {
                        Ok(value) => value,
                        Err(err) => {
                            debug!("Control stream from {} errored: {}", backend.name, err);
                            break;
                        }
                    };
                    let message = match PluginMessage::decode(&frame) {
                        Ok(value) => value,
                        Err(err) => {
                            debug!("Unparsable control frame from {}: {}", backend.name, err);
                            continue;
                        }
                    };
                    if manager.is_channel_registered(&message.channel) {
                        manager
                            .hooks
                            .plugin_message(&backend, &message.channel, &message.payload);
                    } else {
                        debug!(
                            "Dropping plugin message on unregistered channel {}",
                            message.channel
                        );
                    }
                }
                manager.mark_disconnected(&key, generation);
            })
        };

        {
            let mut connections = manager.connections.lock();
            match connections.get_mut(key) {
                Some(value) if value.generation == generation => {
                    value.state = ControlState::Active;
                    value.tx = Some(tx);
                    value.connection = Some(connection);
                    value.reader = Some(reader);
                    value.backoff = BACKOFF_INITIAL;
                    info!("Control connection to {} is active", backend.name);
                }
                _ => {
                    reader.abort();
                    connection.close(0u32.into(), b"superseded");
                }
            }
        }

        Ok(())
    }

    /// Collects backends due for a connection attempt, marking them
    /// as connecting under the lock
    fn due_attempts(&self) -> Vec<(String, Arc<BackendDescriptor>, u64)> {
        let now = Instant::now();
        let mut due = Vec::new();
        let mut connections = self.connections.lock();
        for (key, connection) in connections.iter_mut() {
            if connection.state == ControlState::Disconnected && connection.next_attempt <= now {
                connection.state = ControlState::Connecting;
                connection.generation += 1;
                due.push((key.clone(), connection.backend.clone(), connection.generation));
            }
        }
        due
    }
}

/// Supervisor task probing control connections and reconnecting any
/// that are not active
pub fn start_control_task(manager: Arc<ControlManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now(), RECONNECT_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            for (key, backend, generation) in manager.due_attempts() {
                let manager = manager.clone();
                tokio::spawn(manager.attempt(key, backend, generation));
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ext::DefaultEvents;
    use crate::utils::tls::insecure_client_config;

    fn test_manager() -> Arc<ControlManager> {
        // No traffic flows in these tests, the connector just needs a
        // usable client config
        let connector = BackendConnector::new(insecure_client_config()).unwrap();

        let (signing_key, _) = SigningKey::generate();
        Arc::new(ControlManager::new(
            connector,
            Arc::new(signing_key),
            Arc::new(DefaultEvents),
        ))
    }

    /// Sends without an active connection fail soft
    #[tokio::test]
    async fn test_send_without_connection() {
        let manager = test_manager();
        let backend = Arc::new(BackendDescriptor::new(
            "lobby".to_string(),
            "127.0.0.1".to_string(),
            1,
            true,
        ));
        manager.track_backend(backend);

        assert_eq!(manager.state("lobby"), ControlState::Disconnected);
        assert!(!manager.send("lobby", "example:channel", Bytes::from_static(b"x")));
        assert!(!manager.send("ghost", "example:channel", Bytes::from_static(b"x")));
        assert_eq!(manager.broadcast("example:channel", Bytes::from_static(b"x")), 0);
    }

    /// The channel registrar gates inbound plugin delivery
    #[tokio::test]
    async fn test_channel_registrar() {
        let manager = test_manager();
        assert!(!manager.is_channel_registered("example:channel"));

        manager.register_channel("example:channel");
        assert!(manager.is_channel_registered("example:channel"));

        manager.unregister_channel("example:channel");
        assert!(!manager.is_channel_registered("example:channel"));
    }

    /// Untracked backends are not probed
    #[tokio::test]
    async fn test_untrack() {
        let manager = test_manager();
        let backend = Arc::new(BackendDescriptor::new(
            "lobby".to_string(),
            "127.0.0.1".to_string(),
            1,
            true,
        ));
        manager.track_backend(backend);
        assert_eq!(manager.due_attempts().len(), 1);

        manager.untrack_backend("LOBBY");
        assert!(manager.due_attempts().is_empty());
    }
}
