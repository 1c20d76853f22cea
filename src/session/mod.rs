//! Sessions are client connections to the proxy along with the state
//! machine that carries them from the initial handshake through
//! authentication, backend connection and in-session transfers.
//!
//! All mutation happens from the tasks driving the session's own
//! streams; shared state is limited to short lock windows and handle
//! publication. The session store holds weak links; the client driver
//! task is the sole strong owner.

use crate::ext::{DisconnectKind, FrameAction, FrameDirection, PreConnectDecision, PreLoginDecision};
use crate::proxy::Proxy;
use crate::services::servers::BackendDescriptor;
use crate::session::backend::BackendHandle;
use crate::session::models::{
    frame_id, frame_name, AuthGrantFrame, AuthTokenFrame, ChatFrame, ConnectFrame,
    DisconnectFrame, ServerAuthTokenFrame,
};
use crate::session::packet::Frame;
use crate::utils::signing::{decode_player_referral, sign_player_referral};
use crate::utils::tls::certificate_fingerprint;
use crate::utils::types::SessionID;
use bytes::Bytes;
use log::{debug, log_enabled, warn};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod backend;
pub mod models;
pub mod packet;

pub type SessionLink = Arc<Session>;
pub type WeakSessionLink = Weak<Session>;

/// Disconnect reason for a player displaced by a newer login
const DUPLICATE_LOGIN_REASON: &str = "You logged in from another location";

/// States a session moves through. Disconnected is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Handshaking,
    Authenticating,
    Connecting,
    Connected,
    Transferring,
    Disconnected,
}

/// Identity captured from the Connect frame
#[derive(Debug, Clone)]
pub struct PlayerIdentity {
    pub uuid: Uuid,
    pub username: String,
}

/// Commands accepted by the client write task
pub enum ClientCommand {
    /// Write a frame to the client stream
    Frame(Frame),
    /// Flush and close the client transport
    Close,
}

/// Write half of the client connection
struct ClientHandle {
    connection: quinn::Connection,
    tx: mpsc::UnboundedSender<ClientCommand>,
}

/// Mutable session state, guarded by a short-lived lock
#[derive(Default)]
struct SessionData {
    state: SessionState,
    /// Set while switching backends; suppresses backend-close
    /// propagation toward the client
    transferring: bool,
    player: Option<PlayerIdentity>,
    protocol_fingerprint: Bytes,
    identity_token: String,
    authorization_grant: Option<String>,
    server_identity_token: Option<String>,
    access_token: Option<String>,
    server_access_token: Option<String>,
    /// Original Connect frame, persisted for replay on backend dials
    connect_frame: Option<ConnectFrame>,
    current_backend: Option<Arc<BackendDescriptor>>,
    pending_backend: Option<Arc<BackendDescriptor>>,
    /// Client TLS leaf certificate and its SHA-256 fingerprint
    client_certificate: Option<CertificateDer<'static>>,
    client_cert_fingerprint: Option<String>,
}

/// A client connection and its state machine
pub struct Session {
    /// Unique identifier for this session
    pub id: SessionID,
    /// Client network endpoint
    pub addr: SocketAddr,
    /// Weak handle to this session itself, handed to stores and hooks
    link: WeakSessionLink,
    proxy: Weak<Proxy>,
    client: Option<ClientHandle>,
    data: RwLock<SessionData>,
    /// Live backend connection. Never holds a handle while a previous
    /// one is still open; see [`Self::install_backend`].
    backend: Mutex<Option<BackendHandle>>,
}

impl Session {
    pub fn new(
        id: SessionID,
        addr: SocketAddr,
        proxy: Weak<Proxy>,
        connection: quinn::Connection,
        client_tx: mpsc::UnboundedSender<ClientCommand>,
        client_certificate: Option<CertificateDer<'static>>,
    ) -> SessionLink {
        let client_cert_fingerprint = client_certificate
            .as_ref()
            .map(certificate_fingerprint);
        let data = SessionData {
            client_certificate,
            client_cert_fingerprint,
            ..Default::default()
        };
        Arc::new_cyclic(|link| Self {
            id,
            addr,
            link: link.clone(),
            proxy,
            client: Some(ClientHandle {
                connection,
                tx: client_tx,
            }),
            data: RwLock::new(data),
            backend: Mutex::new(None),
        })
    }

    /// Bare session for store and facade tests
    #[cfg(test)]
    pub fn for_tests(id: SessionID, addr: SocketAddr) -> SessionLink {
        Arc::new_cyclic(|link| Self {
            id,
            addr,
            link: link.clone(),
            proxy: Weak::new(),
            client: None,
            data: RwLock::new(SessionData::default()),
            backend: Mutex::new(None),
        })
    }

    pub(crate) fn proxy(&self) -> Option<Arc<Proxy>> {
        self.proxy.upgrade()
    }

    /// Strong link to this session; None only while dropping
    fn link(&self) -> Option<SessionLink> {
        self.link.upgrade()
    }

    pub fn state(&self) -> SessionState {
        self.data.read().state
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.data.read().player.as_ref().map(|player| player.uuid)
    }

    pub fn username(&self) -> Option<String> {
        self.data
            .read()
            .player
            .as_ref()
            .map(|player| player.username.clone())
    }

    /// Name of the backend the session is currently attached to
    pub fn server_name(&self) -> Option<String> {
        self.data
            .read()
            .current_backend
            .as_ref()
            .map(|backend| backend.name.clone())
    }

    pub fn current_backend(&self) -> Option<Arc<BackendDescriptor>> {
        self.data.read().current_backend.clone()
    }

    pub fn client_certificate(&self) -> Option<CertificateDer<'static>> {
        self.data.read().client_certificate.clone()
    }

    pub fn client_cert_fingerprint(&self) -> Option<String> {
        self.data.read().client_cert_fingerprint.clone()
    }

    /// Opaque identity token the client presented at Connect
    pub fn identity_token(&self) -> String {
        self.data.read().identity_token.clone()
    }

    /// Opaque fingerprint of the client protocol build
    pub fn protocol_fingerprint(&self) -> Bytes {
        self.data.read().protocol_fingerprint.clone()
    }

    /// Authorization grant captured during the handshake
    pub fn authorization_grant(&self) -> Option<String> {
        self.data.read().authorization_grant.clone()
    }

    pub fn server_identity_token(&self) -> Option<String> {
        self.data.read().server_identity_token.clone()
    }

    /// Client access token captured during the handshake
    pub fn access_token(&self) -> Option<String> {
        self.data.read().access_token.clone()
    }

    pub fn server_access_token(&self) -> Option<String> {
        self.data.read().server_access_token.clone()
    }

    pub fn is_transferring(&self) -> bool {
        self.data.read().transferring
    }

    /// Round trip estimate to the client from the QUIC transport
    pub fn ping(&self) -> Option<Duration> {
        self.client.as_ref().map(|client| client.connection.rtt())
    }

    #[cfg(test)]
    pub fn set_player(&self, uuid: Uuid, username: String) {
        self.data.write().player = Some(PlayerIdentity { uuid, username });
    }

    #[cfg(test)]
    pub fn set_state(&self, state: SessionState) {
        self.data.write().state = state;
    }

    /// Queues a frame toward the client. A closed write task drops the
    /// frame, releasing its buffer with it.
    pub fn push_client(&self, frame: Frame) {
        if let Some(client) = &self.client {
            let _ = client.tx.send(ClientCommand::Frame(frame));
        }
    }

    /// Queues a frame toward the backend, dropping it when no backend
    /// stream is live
    fn push_backend(&self, frame: Frame) {
        let backend = self.backend.lock();
        if let Some(handle) = &*backend {
            handle.send(frame);
        }
    }

    /// Publishes a freshly dialed backend connection. The caller must
    /// have fully closed any previous backend first; a session that
    /// disconnected while the dial was in flight closes the new handle
    /// immediately instead.
    pub(crate) fn install_backend(&self, handle: BackendHandle) {
        if self.state() == SessionState::Disconnected {
            handle.close(b"session closed");
            return;
        }
        let previous = self.backend.lock().replace(handle);
        if let Some(previous) = previous {
            // Should be unreachable; the transfer path closes first
            warn!("Session {} replaced a live backend handle", self.id);
            previous.close(b"replaced");
        }
    }

    /// Closes and removes the current backend connection, if any
    pub(crate) fn close_backend(&self, reason: &'static [u8]) {
        let handle = self.backend.lock().take();
        if let Some(handle) = handle {
            handle.close(reason);
        }
    }

    /// Logs a frame with its resolved name and basic session info
    fn debug_log_frame(&self, action: &'static str, frame: &Frame) {
        // Skip if debug logging is disabled
        if !log_enabled!(log::Level::Debug) {
            return;
        }
        match frame_name(frame.id) {
            Some(name) => debug!(
                "Session {} {} {} ({} bytes)",
                self.id,
                action,
                name,
                frame.contents.len()
            ),
            None => debug!(
                "Session {} {} frame {:#06x} ({} bytes)",
                self.id,
                action,
                frame.id,
                frame.contents.len()
            ),
        }
    }

    /// Entry point for every frame read from a client stream
    pub async fn handle_client_frame(&self, frame: Frame) {
        let state = self.state();
        if state == SessionState::Disconnected {
            return;
        }

        self.debug_log_frame("read", &frame);

        match frame.id {
            frame_id::CONNECT => self.handle_connect(frame).await,
            frame_id::AUTH_TOKEN => self.handle_auth_token(frame).await,
            frame_id::DISCONNECT => {
                let reason = DisconnectFrame::decode(&frame)
                    .map(|value| value.reason)
                    .unwrap_or_default();
                debug!("Session {} disconnecting at client request: {}", self.id, reason);
                self.disconnect(None, DisconnectKind::Client);
            }
            _ => {
                if state == SessionState::Connected {
                    self.forward_to_backend(frame);
                }
                // Not connected yet: released
            }
        }
    }

    /// HANDSHAKING -> AUTHENTICATING on the inbound Connect frame
    async fn handle_connect(&self, frame: Frame) {
        let (proxy, link) = match (self.proxy(), self.link()) {
            (Some(proxy), Some(link)) => (proxy, link),
            _ => return,
        };

        if self.state() != SessionState::Handshaking {
            self.protocol_violation("unexpected Connect");
            return;
        }

        let connect = match ConnectFrame::decode(&frame) {
            Ok(value) => value,
            Err(err) => {
                warn!("Session {} sent a malformed Connect: {}", self.id, err);
                self.protocol_violation("malformed Connect");
                return;
            }
        };

        debug!(
            "Session {} connecting as {} ({})",
            self.id, connect.username, connect.uuid
        );

        {
            let data = &mut *self.data.write();
            data.player = Some(PlayerIdentity {
                uuid: connect.uuid,
                username: connect.username.clone(),
            });
            data.protocol_fingerprint = connect.protocol_fingerprint.clone();
            data.identity_token = connect.identity_token.clone();
            data.connect_frame = Some(connect.clone());
            data.state = SessionState::Authenticating;
        }

        // Visibility registration only; a live session under the same
        // uuid is displaced at backend acceptance, not here
        if !proxy.sessions.try_register_player(connect.uuid, &link) {
            debug!("Player {} already has a live session", connect.uuid);
        }

        if let PreLoginDecision::Deny(reason) = proxy.hooks.pre_login(self.addr) {
            self.disconnect(Some(&reason), DisconnectKind::Policy);
            return;
        }

        match proxy
            .session_service
            .request_grant(connect.uuid, &connect.username, &connect.identity_token)
            .await
        {
            Ok(grant) => {
                {
                    let data = &mut *self.data.write();
                    data.authorization_grant = Some(grant.authorization_grant.clone());
                    data.server_identity_token = Some(grant.server_identity_token.clone());
                }
                self.push_client(
                    AuthGrantFrame {
                        authorization_grant: grant.authorization_grant,
                        server_identity_token: grant.server_identity_token,
                    }
                    .encode(),
                );
            }
            Err(err) => {
                warn!("Grant request failed for session {}: {}", self.id, err);
                self.disconnect(Some("Server authentication failed"), DisconnectKind::AuthFailed);
            }
        }
    }

    /// AUTHENTICATING: client access token arrived; exchange the
    /// server grant when present, then move on to the backend
    async fn handle_auth_token(&self, frame: Frame) {
        let proxy = match self.proxy() {
            Some(value) => value,
            None => return,
        };

        if self.state() != SessionState::Authenticating {
            self.protocol_violation("unexpected AuthToken");
            return;
        }

        let auth = match AuthTokenFrame::decode(&frame) {
            Ok(value) => value,
            Err(err) => {
                warn!("Session {} sent a malformed AuthToken: {}", self.id, err);
                self.protocol_violation("malformed AuthToken");
                return;
            }
        };

        self.data.write().access_token = Some(auth.access_token.clone());

        // An empty grant skips the exchange and leaves the server
        // access token unset
        let server_access_token = if auth.server_authorization_grant.is_empty() {
            String::new()
        } else {
            match proxy
                .session_service
                .exchange_grant(&auth.server_authorization_grant)
                .await
            {
                Ok(exchange) => exchange.server_access_token,
                Err(err) => {
                    warn!("Grant exchange failed for session {}: {}", self.id, err);
                    self.disconnect(
                        Some("Server authentication failed"),
                        DisconnectKind::AuthFailed,
                    );
                    return;
                }
            }
        };

        if !server_access_token.is_empty() {
            self.data.write().server_access_token = Some(server_access_token.clone());
        }
        self.push_client(
            ServerAuthTokenFrame {
                server_access_token,
            }
            .encode(),
        );

        self.connect_to_backend().await;
    }

    /// AUTHENTICATING -> CONNECTING: resolve the target backend and
    /// hand over to the dialer
    async fn connect_to_backend(&self) {
        let (proxy, link) = match (self.proxy(), self.link()) {
            (Some(proxy), Some(link)) => (proxy, link),
            _ => return,
        };

        let (referral_bytes, player) = {
            let data = self.data.read();
            let referral = data
                .connect_frame
                .as_ref()
                .map(|connect| connect.referral.clone())
                .unwrap_or_default();
            (referral, data.player.clone())
        };
        let player = match player {
            Some(value) => value,
            None => {
                self.protocol_violation("authenticated without identity");
                return;
            }
        };

        let target = if !referral_bytes.is_empty() {
            // Destination-encoded referral from a previous
            // ClientReferral round trip
            match decode_player_referral(&proxy.signing_key, &referral_bytes) {
                Ok(referral) => {
                    if referral.uuid != player.uuid || referral.username != player.username {
                        warn!(
                            "Session {} referral identity mismatch ({} vs {})",
                            self.id, referral.username, player.username
                        );
                        self.disconnect(Some("Invalid referral"), DisconnectKind::AuthFailed);
                        return;
                    }
                    match proxy.servers.get(&referral.server) {
                        Some(backend) => backend,
                        None => {
                            warn!(
                                "Session {} referred to unknown backend {}",
                                self.id, referral.server
                            );
                            self.disconnect(
                                Some("No backend server available"),
                                DisconnectKind::Policy,
                            );
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!("Session {} carried a rejected referral: {}", self.id, err);
                    self.disconnect(Some("Invalid referral"), DisconnectKind::AuthFailed);
                    return;
                }
            }
        } else {
            match proxy.servers.default_server() {
                Some(backend) => backend,
                None => {
                    self.disconnect(Some("No backend server available"), DisconnectKind::Policy);
                    return;
                }
            }
        };

        let target = match proxy.hooks.pre_connect(&link, &target) {
            PreConnectDecision::Allow => target,
            PreConnectDecision::Deny(reason) => {
                self.disconnect(Some(&reason), DisconnectKind::Policy);
                return;
            }
            PreConnectDecision::Redirect(name) => match proxy.servers.get(&name) {
                Some(backend) => backend,
                None => {
                    warn!(
                        "Pre-connect redirected session {} to unknown backend {}",
                        self.id, name
                    );
                    self.disconnect(Some("No backend server available"), DisconnectKind::Policy);
                    return;
                }
            },
        };

        self.dial(target).await;
    }

    /// CONNECTING: dial and report failures to the player
    async fn dial(&self, target: Arc<BackendDescriptor>) {
        let link = match self.link() {
            Some(value) => value,
            None => return,
        };

        let was_transfer = {
            let data = &mut *self.data.write();
            data.state = SessionState::Connecting;
            data.pending_backend = Some(target.clone());
            data.transferring
        };

        if let Err(err) = backend::connect(&link, target.clone()).await {
            warn!(
                "Session {} failed to reach backend {}: {}",
                self.id, target.name, err
            );
            if was_transfer {
                self.push_client(ChatFrame::transfer_failed(&target.name).encode());
            }
            self.disconnect(
                Some(&format!(
                    "Failed to connect to {}. Please try again later.",
                    target.name
                )),
                DisconnectKind::Backend,
            );
        }
    }

    /// Entry point for every frame read from the backend stream
    pub async fn handle_backend_frame(&self, frame: Frame) {
        self.debug_log_frame("read from backend", &frame);

        match frame.id {
            frame_id::CONNECT_ACCEPT => self.handle_connect_accept(),
            frame_id::DISCONNECT => {
                // While transferring, the old backend going away must
                // not take the client with it
                if self.is_transferring() {
                    return;
                }
                let reason = DisconnectFrame::decode(&frame)
                    .map(|value| value.reason)
                    .unwrap_or_else(|_| "Disconnected".to_string());
                self.disconnect(Some(&reason), DisconnectKind::Backend);
            }
            _ => {
                if self.state() == SessionState::Connected {
                    self.forward_to_client(frame);
                } else {
                    debug!(
                        "Session {} dropped early backend frame {:#06x}",
                        self.id, frame.id
                    );
                }
            }
        }
    }

    /// CONNECTING -> CONNECTED on ConnectAccept. The accept frame is
    /// not forwarded: the client finished its own handshake with the
    /// proxy long ago.
    fn handle_connect_accept(&self) {
        let (proxy, link) = match (self.proxy(), self.link()) {
            (Some(proxy), Some(link)) => (proxy, link),
            _ => return,
        };

        if self.state() != SessionState::Connecting {
            debug!("Session {} received a stray ConnectAccept", self.id);
            return;
        }

        let uuid = match self.uuid() {
            Some(value) => value,
            None => {
                self.protocol_violation("accepted without identity");
                return;
            }
        };

        // Forcing registration: any other live session under this uuid
        // is closed before this one becomes visible as connected
        if let Some(existing) = proxy.sessions.take_conflicting_player(uuid, self.id) {
            warn!(
                "Closing session {} displaced by a newer login for {}",
                existing.id, uuid
            );
            existing.disconnect(Some(DUPLICATE_LOGIN_REASON), DisconnectKind::Policy);
        }

        let (was_transfer, backend, previous) = {
            let mut data = self.data.write();
            let backend = match data.pending_backend.take() {
                Some(value) => value,
                None => {
                    drop(data);
                    self.protocol_violation("accepted without a pending backend");
                    return;
                }
            };
            let previous = data.current_backend.replace(backend.clone());
            let was_transfer = data.transferring;
            data.transferring = false;
            data.state = SessionState::Connected;
            (was_transfer, backend, previous)
        };

        proxy.sessions.register_player(uuid, &link);
        proxy.publish_player_count();

        debug!(
            "Session {} connected to backend {} (transfer: {})",
            self.id, backend.name, was_transfer
        );

        if was_transfer {
            // Deferred until acceptance so the player never sees a
            // success notice for a backend that then refused them
            self.push_client(ChatFrame::transfer_notice(&backend.name).encode());
        } else {
            proxy.hooks.post_login(&link);
        }
        proxy.hooks.server_connected(&link, &backend, previous.as_deref());
    }

    /// Invoked by the backend reader when its stream ends
    pub fn handle_backend_closed(&self) {
        if self.is_transferring() {
            debug!("Session {} old backend closed during transfer", self.id);
            return;
        }
        if self.state() == SessionState::Disconnected {
            return;
        }
        self.disconnect(Some("Lost connection to server"), DisconnectKind::Backend);
    }

    fn forward_to_backend(&self, frame: Frame) {
        let (proxy, link) = match (self.proxy(), self.link()) {
            (Some(proxy), Some(link)) => (proxy, link),
            _ => return,
        };
        match proxy
            .hooks
            .map_frame(&link, frame, FrameDirection::ClientToBackend)
        {
            FrameAction::Forward(frame) => self.push_backend(frame),
            FrameAction::Drop => {}
        }
    }

    fn forward_to_client(&self, frame: Frame) {
        let (proxy, link) = match (self.proxy(), self.link()) {
            (Some(proxy), Some(link)) => (proxy, link),
            _ => return,
        };
        match proxy
            .hooks
            .map_frame(&link, frame, FrameDirection::BackendToClient)
        {
            FrameAction::Forward(frame) => self.push_client(frame),
            FrameAction::Drop => {}
        }
    }

    /// CONNECTED -> TRANSFERRING -> CONNECTING: move this session to
    /// another backend while the client stays attached
    pub async fn switch_to_backend(&self, target: Arc<BackendDescriptor>) {
        {
            let data = &mut *self.data.write();
            if data.state != SessionState::Connected {
                warn!(
                    "Session {} cannot transfer while {:?}",
                    self.id, data.state
                );
                return;
            }
            if data
                .current_backend
                .as_ref()
                .is_some_and(|current| current.name.eq_ignore_ascii_case(&target.name))
            {
                warn!("Session {} is already connected to {}", self.id, target.name);
                return;
            }
            data.transferring = true;
            data.state = SessionState::Transferring;
        }

        debug!("Session {} transferring to {}", self.id, target.name);

        // The previous backend is fully closed before the replacement
        // stream exists anywhere
        self.close_backend(b"transfer");

        self.dial(target).await;
    }

    /// Rewrites the persisted Connect frame with a signed referral for
    /// the given backend. Used for the initial dial and for the
    /// synthesized Connect on transfers.
    pub(crate) fn doctored_connect(&self, target: &BackendDescriptor) -> Option<Frame> {
        let proxy = self.proxy()?;
        let data = self.data.read();
        let connect = data.connect_frame.as_ref()?;
        let player = data.player.as_ref()?;

        let referral = sign_player_referral(
            &proxy.signing_key,
            player.uuid,
            &player.username,
            &target.name,
            &self.addr.ip().to_string(),
        );
        Some(connect.with_referral(referral).encode())
    }

    fn protocol_violation(&self, detail: &str) {
        warn!("Session {} protocol violation: {}", self.id, detail);
        self.disconnect(Some("Protocol violation"), DisconnectKind::ProtocolViolation);
    }

    /// Tears the session down exactly once: backend transport first,
    /// then the client transport, then store and hook cleanup.
    pub fn disconnect(&self, reason: Option<&str>, kind: DisconnectKind) {
        {
            let data = &mut *self.data.write();
            if data.state == SessionState::Disconnected {
                return;
            }
            data.state = SessionState::Disconnected;
        }

        if let Some(reason) = reason {
            self.push_client(DisconnectFrame::new(reason).encode());
        }

        self.close_backend(b"disconnect");

        if let Some(client) = &self.client {
            // The write task flushes queued frames (including the
            // Disconnect above) before closing the transport
            let _ = client.tx.send(ClientCommand::Close);
        }

        if let Some(proxy) = self.proxy() {
            proxy.sessions.remove_connection(self.id, self.uuid());
            proxy.publish_player_count();
            if let Some(link) = self.link() {
                proxy.hooks.disconnect(&link, kind);
            }
        }

        debug!("Session stopped (SID: {})", self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Disconnected is terminal; no handler moves a session out of it
    #[test]
    fn test_state_terminal() {
        let session = Session::for_tests(1, "127.0.0.1:4000".parse().unwrap());
        session.set_state(SessionState::Disconnected);

        session.disconnect(Some("again"), DisconnectKind::Client);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    /// Sessions start in the handshake state with no identity
    #[test]
    fn test_initial_state() {
        let session = Session::for_tests(1, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(session.state(), SessionState::Handshaking);
        assert!(session.uuid().is_none());
        assert!(session.server_name().is_none());
        assert!(!session.is_transferring());
    }
}
