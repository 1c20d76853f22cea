//! Backend dialing for player sessions.
//!
//! Opens a QUIC connection to the chosen backend with the same TLS
//! identity the client listener serves, opens one bidirectional stream,
//! and replays the session's Connect frame doctored with a signed
//! referral. The resulting handle is published on the session only
//! after the frame is on the wire.

use crate::services::servers::BackendDescriptor;
use crate::session::packet::{Frame, FrameCodec};
use crate::session::SessionLink;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use quinn::{ClientConfig, Connection, Endpoint};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Errors raised while dialing a backend. All of them resolve the
/// owning session toward disconnect (or reconnect, for control
/// connections).
#[derive(Debug, Error)]
pub enum BackendConnectError {
    #[error("failed to resolve backend address: {0}")]
    Lookup(io::Error),
    #[error("backend address did not resolve")]
    NoAddress,
    #[error("invalid backend address: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("backend connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("session has no identity to replay")]
    MissingIdentity,
    #[error("backend stream write failed: {0}")]
    Write(io::Error),
}

/// Dialer shared by every session (and, with its own congestion
/// settings, by the control manager). Owns one client endpoint.
pub struct BackendConnector {
    endpoint: Endpoint,
}

impl BackendConnector {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(config);
        Ok(Self { endpoint })
    }

    /// Opens a QUIC connection to the backend
    pub async fn connect(
        &self,
        backend: &BackendDescriptor,
    ) -> Result<Connection, BackendConnectError> {
        let address = tokio::net::lookup_host((backend.host.as_str(), backend.port))
            .await
            .map_err(BackendConnectError::Lookup)?
            .next()
            .ok_or(BackendConnectError::NoAddress)?;

        let connection = self.endpoint.connect(address, backend.server_name())?.await?;
        Ok(connection)
    }
}

/// A live backend connection owned by a session
pub struct BackendHandle {
    descriptor: Arc<BackendDescriptor>,
    connection: Connection,
    tx: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

impl BackendHandle {
    pub fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    /// Queues a frame toward the backend. Frames sent after the write
    /// task stopped are dropped, releasing their buffers.
    pub fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    /// Closes the backend transport. Queued but unwritten frames are
    /// dropped with the channel.
    pub fn close(self, reason: &'static [u8]) {
        self.reader.abort();
        self.connection.close(0u32.into(), reason);
    }
}

/// Dials `backend` for `session`, writes the doctored Connect frame and
/// publishes the handle. ConnectAccept or Disconnect on the new stream
/// resolves the session state machine.
pub async fn connect(
    session: &SessionLink,
    backend: Arc<BackendDescriptor>,
) -> Result<(), BackendConnectError> {
    let proxy = match session.proxy() {
        Some(value) => value,
        None => return Ok(()),
    };

    let connection = proxy.connector.connect(&backend).await?;
    let (send, recv) = connection.open_bi().await?;

    let connect_frame = session
        .doctored_connect(&backend)
        .ok_or(BackendConnectError::MissingIdentity)?;

    let mut writer = FramedWrite::new(send, FrameCodec);
    // The rewritten Connect goes out before anything else can be
    // queued on this stream
    writer
        .send(connect_frame)
        .await
        .map_err(BackendConnectError::Write)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    });

    let weak = SessionLink::downgrade(session);
    let reader = tokio::spawn(async move {
        let mut reader = FramedRead::new(recv, FrameCodec);
        while let Some(result) = reader.next().await {
            match result {
                Ok(frame) => {
                    let session = match weak.upgrade() {
                        Some(value) => value,
                        None => return,
                    };
                    session.handle_backend_frame(frame).await;
                }
                Err(err) => {
                    debug!("Backend stream error: {}", err);
                    break;
                }
            }
        }
        if let Some(session) = weak.upgrade() {
            session.handle_backend_closed();
        }
    });

    session.install_backend(BackendHandle {
        descriptor: backend,
        connection,
        tx,
        reader,
    });

    Ok(())
}
