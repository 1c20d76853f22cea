//! Registry of peer proxies built from heartbeat messages.
//!
//! Entries are last-writer-wins by arrival time. A cleanup task evicts
//! peers whose heartbeat went silent for longer than the stale
//! threshold; the local proxy's own entry is never evicted.

use crate::services::messaging::HeartbeatMessage;
use crate::utils::types::Port;
use hashbrown::HashMap;
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How often the cleanup task looks for stale peers
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Default age after which a peer without heartbeats is evicted
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

/// Everything the cluster knows about one proxy
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub id: String,
    pub region: String,
    pub host: String,
    pub port: Port,
    pub player_count: usize,
    pub max_players: usize,
    pub uptime_ms: u64,
    pub version: String,
    /// Arrival time of the most recent heartbeat
    pub last_heartbeat: Instant,
}

impl ProxyInfo {
    fn from_heartbeat(message: &HeartbeatMessage) -> Self {
        Self {
            id: message.source_proxy_id.clone(),
            region: message.region.clone(),
            host: message.host.clone(),
            port: message.port,
            player_count: message.player_count,
            max_players: message.max_players,
            uptime_ms: message.uptime_ms,
            version: message.version.clone(),
            last_heartbeat: Instant::now(),
        }
    }
}

/// Why a proxy left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The proxy announced shutdown on its final heartbeat
    Graceful,
    /// The proxy stopped heartbeating and went stale
    HeartbeatTimeout,
}

/// Membership change emitted to registered listeners
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    ProxyJoin(ProxyInfo),
    ProxyLeave { id: String, reason: LeaveReason },
}

type EventListener = Box<dyn Fn(&ClusterEvent) + Send + Sync>;

pub struct ProxyRegistry {
    local_id: String,
    proxies: RwLock<HashMap<String, ProxyInfo>>,
    listeners: RwLock<Vec<EventListener>>,
    stale_threshold: Duration,
}

impl ProxyRegistry {
    pub fn new(local_id: String, stale_threshold: Duration) -> Self {
        Self {
            local_id,
            proxies: Default::default(),
            listeners: Default::default(),
            stale_threshold,
        }
    }

    /// Registers a listener for join and leave events. Listeners run
    /// on the messaging dispatch task and must not block.
    pub fn on_event(&self, listener: impl Fn(&ClusterEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    fn emit(&self, event: ClusterEvent) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Applies one inbound heartbeat, local or remote
    pub fn handle_heartbeat(&self, message: &HeartbeatMessage) {
        let id = &message.source_proxy_id;

        if message.shutting_down {
            // Final heartbeat; unknown ids are a no-op
            let removed = self.proxies.write().remove(id);
            if removed.is_some() && *id != self.local_id {
                info!("Proxy {} left the cluster", id);
                self.emit(ClusterEvent::ProxyLeave {
                    id: id.clone(),
                    reason: LeaveReason::Graceful,
                });
            }
            return;
        }

        let info = ProxyInfo::from_heartbeat(message);
        let joined = self.proxies.write().insert(id.clone(), info.clone()).is_none();
        if joined && *id != self.local_id {
            info!("Proxy {} joined the cluster ({})", id, info.region);
            self.emit(ClusterEvent::ProxyJoin(info));
        }
    }

    /// Evicts peers whose last heartbeat is older than the stale
    /// threshold. The local proxy is exempt.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut stale: Vec<String> = Vec::new();

        {
            let proxies = &mut *self.proxies.write();
            proxies.retain(|id, info| {
                if *id == self.local_id {
                    return true;
                }
                let fresh = now.duration_since(info.last_heartbeat) <= self.stale_threshold;
                if !fresh {
                    stale.push(id.clone());
                }
                fresh
            });
        }

        for id in stale {
            info!("Proxy {} timed out and was evicted", id);
            self.emit(ClusterEvent::ProxyLeave {
                id,
                reason: LeaveReason::HeartbeatTimeout,
            });
        }
    }

    /// Applies a player-count update arriving between heartbeats.
    /// Unknown proxies are ignored; the next heartbeat introduces them.
    pub fn update_player_count(&self, id: &str, player_count: usize) {
        if let Some(info) = self.proxies.write().get_mut(id) {
            info.player_count = player_count;
        }
    }

    pub fn get(&self, id: &str) -> Option<ProxyInfo> {
        self.proxies.read().get(id).cloned()
    }

    /// Snapshot of every known proxy, including the local one
    pub fn snapshot(&self) -> Vec<ProxyInfo> {
        self.proxies.read().values().cloned().collect()
    }

    /// Number of known proxies
    pub fn proxy_count(&self) -> usize {
        self.proxies.read().len()
    }

    /// Sum of the advertised player counts across the cluster
    pub fn global_player_count(&self) -> usize {
        self.proxies
            .read()
            .values()
            .map(|info| info.player_count)
            .sum()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

/// Background task running the stale sweep on a fixed interval
pub fn start_cleanup_task(registry: Arc<ProxyRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now() + CLEANUP_INTERVAL;
        let mut interval = interval_at(start, CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            registry.cleanup();
            debug!("Registry sweep complete ({} proxies)", registry.proxy_count());
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn heartbeat(id: &str, shutting_down: bool) -> HeartbeatMessage {
        HeartbeatMessage {
            source_proxy_id: id.to_string(),
            region: "eu".into(),
            host: "proxy.example.com".into(),
            port: 27015,
            player_count: 4,
            max_players: 1000,
            uptime_ms: 1000,
            version: "0.1.0".into(),
            shutting_down,
        }
    }

    /// New peers emit a join, repeat heartbeats only refresh
    #[tokio::test(start_paused = true)]
    async fn test_join_once() {
        let registry = ProxyRegistry::new("local".into(), DEFAULT_STALE_THRESHOLD);
        let joins = Arc::new(AtomicUsize::new(0));
        {
            let joins = joins.clone();
            registry.on_event(move |event| {
                if matches!(event, ClusterEvent::ProxyJoin(_)) {
                    joins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        registry.handle_heartbeat(&heartbeat("peer", false));
        registry.handle_heartbeat(&heartbeat("peer", false));
        // The local proxy's own heartbeats never produce join events
        registry.handle_heartbeat(&heartbeat("local", false));

        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(registry.proxy_count(), 2);
        assert_eq!(registry.global_player_count(), 8);
    }

    /// Graceful shutdown removes the peer exactly once; unknown ids
    /// are a no-op
    #[tokio::test(start_paused = true)]
    async fn test_graceful_leave() {
        let registry = ProxyRegistry::new("local".into(), DEFAULT_STALE_THRESHOLD);
        let leaves = Arc::new(AtomicUsize::new(0));
        {
            let leaves = leaves.clone();
            registry.on_event(move |event| {
                if let ClusterEvent::ProxyLeave { reason, .. } = event {
                    assert_eq!(*reason, LeaveReason::Graceful);
                    leaves.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        registry.handle_heartbeat(&heartbeat("peer", false));
        registry.handle_heartbeat(&heartbeat("peer", true));
        registry.handle_heartbeat(&heartbeat("peer", true));
        registry.handle_heartbeat(&heartbeat("ghost", true));

        assert_eq!(leaves.load(Ordering::SeqCst), 1);
        assert_eq!(registry.proxy_count(), 0);
    }

    /// Stale peers are evicted exactly once, never before the
    /// threshold, and the local entry survives
    #[tokio::test(start_paused = true)]
    async fn test_stale_eviction() {
        let registry = ProxyRegistry::new("local".into(), DEFAULT_STALE_THRESHOLD);
        let leaves = Arc::new(AtomicUsize::new(0));
        {
            let leaves = leaves.clone();
            registry.on_event(move |event| {
                if let ClusterEvent::ProxyLeave { id, reason } = event {
                    assert_eq!(id, "peer");
                    assert_eq!(*reason, LeaveReason::HeartbeatTimeout);
                    leaves.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        registry.handle_heartbeat(&heartbeat("local", false));
        registry.handle_heartbeat(&heartbeat("peer", false));

        // Under the threshold nothing is evicted
        tokio::time::advance(Duration::from_secs(29)).await;
        registry.cleanup();
        assert_eq!(registry.proxy_count(), 2);

        // Past the threshold the peer goes, the local entry stays
        tokio::time::advance(Duration::from_secs(2)).await;
        registry.cleanup();
        registry.cleanup();

        assert_eq!(leaves.load(Ordering::SeqCst), 1);
        assert_eq!(registry.proxy_count(), 1);
        assert!(registry.get("local").is_some());
    }
}
