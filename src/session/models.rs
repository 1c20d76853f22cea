//! Typed views over the frames the proxy intercepts.
//!
//! Only the frames named here are ever decoded; every other frame id
//! flows through the proxy as an opaque [`Frame`]. Strings are u16
//! length prefixed UTF-8, uuids are their 16 raw bytes, optional blobs
//! use a zero length to mean absent.

use super::packet::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::utils::types::Port;

/// Frame ids the proxy interprets
pub mod frame_id {
    pub const CONNECT: u16 = 0x01;
    pub const AUTH_GRANT: u16 = 0x02;
    pub const AUTH_TOKEN: u16 = 0x03;
    pub const SERVER_AUTH_TOKEN: u16 = 0x04;
    pub const CONNECT_ACCEPT: u16 = 0x05;
    pub const DISCONNECT: u16 = 0x06;
    pub const CLIENT_REFERRAL: u16 = 0x07;
    pub const CHAT: u16 = 0x08;
    pub const PLUGIN_MESSAGE: u16 = 0x09;
}

/// Display name for an interpreted frame id, used by debug logging
pub fn frame_name(id: u16) -> Option<&'static str> {
    Some(match id {
        frame_id::CONNECT => "Connect",
        frame_id::AUTH_GRANT => "AuthGrant",
        frame_id::AUTH_TOKEN => "AuthToken",
        frame_id::SERVER_AUTH_TOKEN => "ServerAuthToken",
        frame_id::CONNECT_ACCEPT => "ConnectAccept",
        frame_id::DISCONNECT => "Disconnect",
        frame_id::CLIENT_REFERRAL => "ClientReferral",
        frame_id::CHAT => "Chat",
        frame_id::PLUGIN_MESSAGE => "PluginMessage",
        _ => return None,
    })
}

/// Errors produced when decoding an interpreted frame. These are
/// protocol violations; the owning session closes on them.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame payload ended unexpectedly")]
    UnexpectedEnd,
    #[error("frame contained an invalid string")]
    InvalidString,
    #[error("frame contained an invalid uuid")]
    InvalidUuid,
    #[error("plugin message magic missing")]
    InvalidMagic,
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::UnexpectedEnd);
    }
    let length = buf.get_u16() as usize;
    if buf.remaining() < length {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.split_to(length))
}

fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    let bytes = get_blob(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidString)
}

fn get_uuid(buf: &mut Bytes) -> Result<Uuid, DecodeError> {
    if buf.remaining() < 16 {
        return Err(DecodeError::UnexpectedEnd);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

fn put_blob(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_blob(buf, value.as_bytes());
}

/// First frame a client sends, opening the login handshake
#[derive(Debug, Clone)]
pub struct ConnectFrame {
    pub uuid: Uuid,
    pub username: String,
    /// Opaque fingerprint of the client protocol build
    pub protocol_fingerprint: Bytes,
    /// Opaque identity token minted by the game launcher
    pub identity_token: String,
    /// Referral blob from a previous ClientReferral, empty when absent
    pub referral: Bytes,
}

impl ConnectFrame {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        let uuid = get_uuid(&mut buf)?;
        let username = get_string(&mut buf)?;
        let protocol_fingerprint = get_blob(&mut buf)?;
        let identity_token = get_string(&mut buf)?;
        let referral = get_blob(&mut buf)?;
        Ok(Self {
            uuid,
            username,
            protocol_fingerprint,
            identity_token,
            referral,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_slice(self.uuid.as_bytes());
        put_string(&mut buf, &self.username);
        put_blob(&mut buf, &self.protocol_fingerprint);
        put_string(&mut buf, &self.identity_token);
        put_blob(&mut buf, &self.referral);
        Frame::new(frame_id::CONNECT, buf.freeze())
    }

    /// Copy of this frame with the referral field replaced; used when
    /// forwarding the login to a backend with a signed referral
    pub fn with_referral(&self, referral: Bytes) -> Self {
        Self {
            referral,
            ..self.clone()
        }
    }
}

/// Authorization grant handed to the client after the proxy asked the
/// session service on its behalf
#[derive(Debug, Clone)]
pub struct AuthGrantFrame {
    pub authorization_grant: String,
    pub server_identity_token: String,
}

impl AuthGrantFrame {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        Ok(Self {
            authorization_grant: get_string(&mut buf)?,
            server_identity_token: get_string(&mut buf)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.authorization_grant);
        put_string(&mut buf, &self.server_identity_token);
        Frame::new(frame_id::AUTH_GRANT, buf.freeze())
    }
}

/// Client response carrying its access token and, usually, a grant the
/// proxy can exchange for a server access token
#[derive(Debug, Clone)]
pub struct AuthTokenFrame {
    pub access_token: String,
    /// Empty when the client completed without a server grant
    pub server_authorization_grant: String,
}

impl AuthTokenFrame {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        Ok(Self {
            access_token: get_string(&mut buf)?,
            server_authorization_grant: get_string(&mut buf)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.access_token);
        put_string(&mut buf, &self.server_authorization_grant);
        Frame::new(frame_id::AUTH_TOKEN, buf.freeze())
    }
}

/// Server access token produced by the grant exchange, completing the
/// client side of the handshake
#[derive(Debug, Clone)]
pub struct ServerAuthTokenFrame {
    /// Empty when no server grant was exchanged
    pub server_access_token: String,
}

impl ServerAuthTokenFrame {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        Ok(Self {
            server_access_token: get_string(&mut buf)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.server_access_token);
        Frame::new(frame_id::SERVER_AUTH_TOKEN, buf.freeze())
    }
}

/// Backend acknowledgement that a player login was accepted
#[derive(Debug, Clone)]
pub struct ConnectAcceptFrame;

impl ConnectAcceptFrame {
    pub fn encode(&self) -> Frame {
        Frame::new_empty(frame_id::CONNECT_ACCEPT)
    }
}

/// Connection teardown with a user visible reason
#[derive(Debug, Clone)]
pub struct DisconnectFrame {
    pub reason: String,
}

impl DisconnectFrame {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        Ok(Self {
            reason: get_string(&mut buf)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.reason);
        Frame::new(frame_id::DISCONNECT, buf.freeze())
    }
}

/// Tells a client to reconnect to the given address with a referral
/// blob that encodes its destination
#[derive(Debug, Clone)]
pub struct ClientReferralFrame {
    pub host: String,
    pub port: Port,
    pub referral: Bytes,
}

impl ClientReferralFrame {
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        let host = get_string(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let port = buf.get_u16();
        let referral = get_blob(&mut buf)?;
        Ok(Self {
            host,
            port,
            referral,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.host);
        buf.put_u16(self.port);
        put_blob(&mut buf, &self.referral);
        Frame::new(frame_id::CLIENT_REFERRAL, buf.freeze())
    }
}

/// Chat message shown to the player, used for transfer notices
#[derive(Debug, Clone)]
pub struct ChatFrame {
    pub text: String,
    pub color: String,
}

impl ChatFrame {
    /// Gold notice shown while moving a player between backends
    pub fn transfer_notice(server: &str) -> Self {
        Self {
            text: format!("Connecting to {}", server),
            color: "gold".to_string(),
        }
    }

    /// Red notice shown when a transfer target was unreachable
    pub fn transfer_failed(server: &str) -> Self {
        Self {
            text: format!("Failed to connect to {}. Please try again later.", server),
            color: "red".to_string(),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        Ok(Self {
            text: get_string(&mut buf)?,
            color: get_string(&mut buf)?,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.text);
        put_string(&mut buf, &self.color);
        Frame::new(frame_id::CHAT, buf.freeze())
    }
}

/// Envelope for player independent plugin traffic on control streams:
/// 4 byte magic, length prefixed channel identifier, payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMessage {
    pub channel: String,
    pub payload: Bytes,
}

impl PluginMessage {
    /// Magic bytes prefixed to every plugin message payload
    pub const MAGIC: [u8; 4] = *b"NDPM";

    pub fn new(channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let mut buf = frame.contents.clone();
        if buf.remaining() < 4 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != Self::MAGIC {
            return Err(DecodeError::InvalidMagic);
        }
        let channel = get_string(&mut buf)?;
        let payload = buf;
        Ok(Self { channel, payload })
    }

    pub fn encode(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_slice(&Self::MAGIC);
        put_string(&mut buf, &self.channel);
        buf.extend_from_slice(&self.payload);
        Frame::new(frame_id::PLUGIN_MESSAGE, buf.freeze())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Connect frames round trip with and without referral data
    #[test]
    fn test_connect_round_trip() {
        let connect = ConnectFrame {
            uuid: Uuid::new_v4(),
            username: "Steve".to_string(),
            protocol_fingerprint: Bytes::from_static(&[0xde, 0xad]),
            identity_token: "identity-token".to_string(),
            referral: Bytes::new(),
        };

        let decoded = ConnectFrame::decode(&connect.encode()).unwrap();
        assert_eq!(decoded.uuid, connect.uuid);
        assert_eq!(decoded.username, connect.username);
        assert!(decoded.referral.is_empty());

        let with_referral = connect.with_referral(Bytes::from_static(b"referral"));
        let decoded = ConnectFrame::decode(&with_referral.encode()).unwrap();
        assert_eq!(&decoded.referral[..], b"referral");
        // Identity token must survive the referral rewrite
        assert_eq!(decoded.identity_token, connect.identity_token);
    }

    /// Truncated payloads are decode errors, not panics
    #[test]
    fn test_truncated_connect() {
        let connect = ConnectFrame {
            uuid: Uuid::new_v4(),
            username: "Steve".to_string(),
            protocol_fingerprint: Bytes::new(),
            identity_token: String::new(),
            referral: Bytes::new(),
        };
        let frame = connect.encode();
        let truncated = Frame::new(frame.id, frame.contents.slice(..frame.contents.len() - 3));

        assert!(ConnectFrame::decode(&truncated).is_err());
    }

    /// Disconnect reasons pass through unchanged
    #[test]
    fn test_disconnect_reason() {
        let frame = DisconnectFrame::new("Server authentication failed").encode();
        let decoded = DisconnectFrame::decode(&frame).unwrap();
        assert_eq!(decoded.reason, "Server authentication failed");
    }

    /// Client referral frames carry host, port and blob
    #[test]
    fn test_client_referral_round_trip() {
        let referral = ClientReferralFrame {
            host: "proxy.example.com".to_string(),
            port: 27015,
            referral: Bytes::from_static(b"blob"),
        };
        let decoded = ClientReferralFrame::decode(&referral.encode()).unwrap();
        assert_eq!(decoded.host, referral.host);
        assert_eq!(decoded.port, referral.port);
        assert_eq!(decoded.referral, referral.referral);
    }

    /// Plugin messages enforce their magic prefix
    #[test]
    fn test_plugin_message_magic() {
        let message = PluginMessage::new("numdrassl:control_handshake", Bytes::from_static(b"hi"));
        let frame = message.encode();
        assert_eq!(PluginMessage::decode(&frame).unwrap(), message);

        let mut corrupted = BytesMut::from(&frame.contents[..]);
        corrupted[0] = b'X';
        let corrupted = Frame::new(frame.id, corrupted.freeze());
        assert!(matches!(
            PluginMessage::decode(&corrupted),
            Err(DecodeError::InvalidMagic)
        ));
    }
}
