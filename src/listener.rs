//! QUIC server accepting client connections.
//!
//! Each accepted transport gets a session object and a driver task.
//! The first bidirectional stream a client opens carries the game
//! protocol in both directions; any further streams feed the same
//! state machine read-only. Connections beyond the configured cap are
//! refused before a session exists.

use crate::ext::DisconnectKind;
use crate::proxy::Proxy;
use crate::session::packet::FrameCodec;
use crate::session::{ClientCommand, Session, SessionLink};
use crate::utils::tls::certificate_fingerprint;
use crate::utils::types::SessionID;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Binds the client endpoint and starts the accept loop
pub fn start(
    proxy: Arc<Proxy>,
    addr: SocketAddr,
    config: quinn::ServerConfig,
) -> io::Result<JoinHandle<()>> {
    let endpoint = Endpoint::server(config, addr)?;
    info!("Accepting game connections on {}", addr);
    Ok(tokio::spawn(accept_loop(proxy, endpoint)))
}

async fn accept_loop(proxy: Arc<Proxy>, endpoint: Endpoint) {
    let mut next_id: SessionID = 1;

    while let Some(incoming) = endpoint.accept().await {
        // Hard cap: refuse before any session state exists
        if proxy.sessions.connection_count() >= proxy.config.max_connections {
            debug!("Refusing connection from {}: server full", incoming.remote_address());
            incoming.refuse();
            continue;
        }

        let connecting = match incoming.accept() {
            Ok(value) => value,
            Err(err) => {
                debug!("Failed to accept connection: {}", err);
                continue;
            }
        };

        let id = next_id;
        next_id = next_id.wrapping_add(1);

        let proxy = proxy.clone();
        tokio::spawn(async move {
            let connection = match connecting.await {
                Ok(value) => value,
                Err(err) => {
                    debug!("Client handshake failed: {}", err);
                    return;
                }
            };
            drive_connection(proxy, id, connection).await;
        });
    }
}

/// Owns a single client connection for its whole lifetime. This task
/// holds the only strong link to the session.
async fn drive_connection(proxy: Arc<Proxy>, id: SessionID, connection: Connection) {
    let addr = connection.remote_address();
    let certificate = peer_certificate(&connection);

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let session = Session::new(
        id,
        addr,
        Arc::downgrade(&proxy),
        connection.clone(),
        client_tx,
        certificate,
    );

    proxy.sessions.add_connection(&session);
    proxy.hooks.session_created(&session);
    debug!("Session {} created for {}", id, addr);

    // The first stream the client opens is the game protocol stream
    let (send, recv) = match connection.accept_bi().await {
        Ok(value) => value,
        Err(err) => {
            debug!("Session {} closed before opening a stream: {}", id, err);
            session.disconnect(None, DisconnectKind::Client);
            return;
        }
    };

    // The writer ends on its own once Close is processed or every
    // sender is gone; aborting it could cut off a final Disconnect
    spawn_writer(connection.clone(), send, client_rx);

    tokio::select! {
        _ = read_stream(&session, recv) => {}
        _ = accept_extra_streams(&session, &connection) => {}
    }

    // Transport observed closed (or the state machine closed it)
    session.disconnect(None, DisconnectKind::Client);
}

/// Reads frames off one client stream into the state machine
async fn read_stream(session: &SessionLink, recv: RecvStream) {
    let mut reader = FramedRead::new(recv, FrameCodec);
    while let Some(result) = reader.next().await {
        match result {
            Ok(frame) => session.handle_client_frame(frame).await,
            Err(err) => {
                if err.kind() == io::ErrorKind::InvalidData {
                    warn!("Session {} broke framing: {}", session.id, err);
                    session.disconnect(Some("Protocol violation"), DisconnectKind::ProtocolViolation);
                }
                break;
            }
        }
    }
}

/// Installs read pipelines for any additional streams the client opens
async fn accept_extra_streams(session: &SessionLink, connection: &Connection) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                debug!("Session {} opened an extra stream", session.id);
                // The proxy only writes on the primary stream
                drop(send);
                let session = session.clone();
                tokio::spawn(async move {
                    read_stream(&session, recv).await;
                });
            }
            Err(_) => return,
        }
    }
}

/// Write task for the client stream. Processes queued frames in order;
/// Close flushes everything written so far before shutting the
/// transport down.
fn spawn_writer(
    connection: Connection,
    send: SendStream,
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    tokio::spawn(async move {
        let mut writer = FramedWrite::new(send, FrameCodec);
        while let Some(command) = rx.recv().await {
            match command {
                ClientCommand::Frame(frame) => {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                ClientCommand::Close => {
                    let _ = writer.flush().await;
                    let _ = writer.get_mut().finish();
                    break;
                }
            }
        }
        connection.close(0u32.into(), b"closed");
    });
}

/// Client TLS leaf certificate captured at handshake time
fn peer_certificate(connection: &Connection) -> Option<CertificateDer<'static>> {
    let identity = connection.peer_identity()?;
    let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
    let leaf = certs.first()?;
    debug!(
        "Client certificate fingerprint: {}",
        certificate_fingerprint(leaf)
    );
    Some(leaf.clone().into_owned())
}
