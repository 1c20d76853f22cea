//! Hook surface consumed from the out-of-scope extension layer.
//!
//! Extensions implement [`ProxyEvents`] and hand it to the proxy at
//! construction; every method has a pass-through default so an
//! implementation only overrides what it cares about. Handlers run on
//! the calling session's task and must not block.

use crate::services::servers::BackendDescriptor;
use crate::session::packet::Frame;
use crate::session::SessionLink;
use std::net::SocketAddr;

/// Outcome of the pre-login hook
#[derive(Debug, Clone)]
pub enum PreLoginDecision {
    Allow,
    Deny(String),
}

/// Outcome of the pre-connect hook
#[derive(Debug, Clone)]
pub enum PreConnectDecision {
    Allow,
    Deny(String),
    /// Send the player to a different named backend instead
    Redirect(String),
}

/// Direction a frame is travelling through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    ClientToBackend,
    BackendToClient,
}

/// What to do with an intercepted frame
pub enum FrameAction {
    /// Forward this frame, possibly rewritten
    Forward(Frame),
    /// Swallow the frame entirely
    Drop,
}

/// Why a session ended, as reported to the disconnect hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The client asked to leave or its transport closed
    Client,
    /// The backend closed the stream outside of a transfer
    Backend,
    /// Authentication or referral validation failed
    AuthFailed,
    /// A hook or the facade requested the disconnect
    Policy,
    /// The session broke protocol
    ProtocolViolation,
}

/// Event hooks the core fires toward the extension layer. Explicit
/// trait methods instead of reflective dispatch; the extension layer
/// composes its own handler lists behind one implementation.
pub trait ProxyEvents: Send + Sync {
    /// A transport was accepted and a session object attached
    fn session_created(&self, session: &SessionLink) {
        let _ = session;
    }

    /// A client sent Connect; deny to refuse before authentication
    fn pre_login(&self, addr: SocketAddr) -> PreLoginDecision {
        let _ = addr;
        PreLoginDecision::Allow
    }

    /// The session completed authentication
    fn post_login(&self, session: &SessionLink) {
        let _ = session;
    }

    /// A backend was chosen for the session; deny or redirect here
    fn pre_connect(
        &self,
        session: &SessionLink,
        backend: &BackendDescriptor,
    ) -> PreConnectDecision {
        let _ = (session, backend);
        PreConnectDecision::Allow
    }

    /// The backend accepted the session
    fn server_connected(
        &self,
        session: &SessionLink,
        backend: &BackendDescriptor,
        previous: Option<&BackendDescriptor>,
    ) {
        let _ = (session, backend, previous);
    }

    /// The session closed; advisory only
    fn disconnect(&self, session: &SessionLink, kind: DisconnectKind) {
        let _ = (session, kind);
    }

    /// Called for every frame once the session is connected. The
    /// default forwards unchanged.
    fn map_frame(&self, session: &SessionLink, frame: Frame, direction: FrameDirection) -> FrameAction {
        let _ = (session, direction);
        FrameAction::Forward(frame)
    }

    /// A plugin message arrived on a registered control channel
    fn plugin_message(&self, server: &BackendDescriptor, channel: &str, payload: &[u8]) {
        let _ = (server, channel, payload);
    }
}

/// No-op hook implementation used when no extension layer is attached
pub struct DefaultEvents;

impl ProxyEvents for DefaultEvents {}
