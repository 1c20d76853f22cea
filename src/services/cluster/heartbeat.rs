//! Periodic heartbeat publication for this proxy.
//!
//! Every few seconds the publisher emits this proxy's identity,
//! region, address, player count and uptime on the heartbeat channel.
//! During shutdown exactly one final heartbeat carries the
//! `shutting_down` flag so peers can drop the entry without waiting
//! for the stale sweep.

use crate::config::VERSION;
use crate::services::messaging::{channels, ClusterMessage, HeartbeatMessage, MessagingService};
use crate::services::sessions::Sessions;
use crate::utils::types::Port;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Delay between heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct HeartbeatPublisher {
    messaging: Arc<MessagingService>,
    sessions: Arc<Sessions>,
    proxy_id: String,
    region: String,
    host: String,
    port: Port,
    max_players: usize,
    started_at: Instant,
}

impl HeartbeatPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messaging: Arc<MessagingService>,
        sessions: Arc<Sessions>,
        proxy_id: String,
        region: String,
        host: String,
        port: Port,
        max_players: usize,
    ) -> Self {
        Self {
            messaging,
            sessions,
            proxy_id,
            region,
            host,
            port,
            max_players,
            started_at: Instant::now(),
        }
    }

    fn build(&self, shutting_down: bool) -> HeartbeatMessage {
        HeartbeatMessage {
            source_proxy_id: self.proxy_id.clone(),
            region: self.region.clone(),
            host: self.host.clone(),
            port: self.port,
            player_count: self.sessions.player_count(),
            max_players: self.max_players,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            version: VERSION.to_string(),
            shutting_down,
        }
    }

    /// Publishes a single heartbeat. `shutting_down` is set true only
    /// on the final heartbeat before the process exits.
    pub async fn publish_once(&self, shutting_down: bool) {
        let message = ClusterMessage::Heartbeat(self.build(shutting_down));
        if let Err(err) = self.messaging.publish(channels::HEARTBEAT, message).await {
            warn!("Failed to publish heartbeat: {}", err);
        }
    }
}

/// Background task publishing heartbeats on a fixed interval
pub fn start_heartbeat_task(publisher: Arc<HeartbeatPublisher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now(), HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            publisher.publish_once(false).await;
        }
    })
}
