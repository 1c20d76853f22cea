use log::{error, info};
use numdrassl_proxy::config::{load_config, VERSION};
use numdrassl_proxy::ext::{DefaultEvents, DisconnectKind};
use numdrassl_proxy::listener;
use numdrassl_proxy::proxy::Proxy;
use numdrassl_proxy::services::cluster::heartbeat::{start_heartbeat_task, HeartbeatPublisher};
use numdrassl_proxy::services::cluster::registry::start_cleanup_task;
use numdrassl_proxy::services::control::start_control_task;
use numdrassl_proxy::utils::logging;
use numdrassl_proxy::utils::tls::TlsContext;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = load_config().unwrap_or_default();

    // Initialize logging
    logging::setup(config.logging_level());

    // Certificate material is loaded once and reused by the listener
    // and the backend dialer; missing material is fatal
    let tls = match TlsContext::load(
        &config.certificate,
        &config.private_key,
        Duration::from_secs(config.timeout_secs),
    ) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to load TLS material: {}", err);
            return;
        }
    };

    let bind_ip: IpAddr = match config.host.parse() {
        Ok(value) => value,
        Err(err) => {
            error!("Invalid bind host {}: {}", config.host, err);
            return;
        }
    };
    let addr = SocketAddr::new(bind_ip, config.port);

    logging::log_connection_urls(config.advertised_host(), config.public_port);

    if config.passthrough {
        info!("Passthrough mode requested; frame interception is left to the extension layer");
    }

    // Build the proxy root; this also selects broker or loopback
    // messaging and wires the cluster subscriptions
    let proxy = match Proxy::new(config, &tls, Arc::new(DefaultEvents)).await {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to start proxy: {}", err);
            return;
        }
    };

    // Cluster background tasks
    let heartbeat = Arc::new(HeartbeatPublisher::new(
        proxy.messaging.clone(),
        proxy.sessions.clone(),
        proxy.proxy_id.clone(),
        proxy.config.cluster.region.clone(),
        proxy.config.advertised_host().to_string(),
        proxy.config.public_port,
        proxy.config.max_connections,
    ));
    start_heartbeat_task(heartbeat.clone());
    start_cleanup_task(proxy.registry.clone());
    start_control_task(proxy.control.clone());

    // Let peers that joined earlier learn about our servers
    proxy.sync_servers().await;

    // Start the client listener
    let listener = match listener::start(proxy.clone(), addr, tls.server.clone()) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to bind client listener on {}: {}", addr, err);
            return;
        }
    };

    info!("Numdrassl proxy started on {} (v{})", addr, VERSION);

    _ = signal::ctrl_c().await;
    info!("Shutting down");

    // Stop accepting, then close out the connected players
    listener.abort();
    for session in proxy.all_players() {
        session.disconnect(Some("Proxy shutting down"), DisconnectKind::Policy);
    }

    // Exactly one final heartbeat carries the shutting_down flag
    heartbeat.publish_once(true).await;
    proxy.shutdown();
}
