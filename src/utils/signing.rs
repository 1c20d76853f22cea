//! Referral signing for the proxy to backend boundary.
//!
//! Referrals are HMAC-tagged binary blobs that let a backend accept a
//! player (or a proxy control connection) without asking the external
//! session service again. Player blobs and control blobs share the same
//! outer framing; the first length-prefixed field disambiguates the two.

use base64ct::{Base64, Encoding};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{info, warn};
use rand::{rngs::OsRng, RngCore};
use ring::hmac::{self, Key, Tag, HMAC_SHA256};
use std::env;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Environment variable that overrides the configured shared secret
pub const SECRET_ENV_KEY: &str = "NUMDRASSL_SECRET";

/// Marker used as the first field of control-connection referrals
const CONTROL_MARKER: &[u8] = b"NUMDRASSL_CONTROL";

/// Length of the HMAC-SHA256 tag appended to every referral
const TAG_LENGTH: usize = 32;

/// Referrals are rejected when their timestamp falls outside this
/// window on either side of the receiver clock (5 minutes)
const TIMESTAMP_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Errors produced when validating a referral blob
#[derive(Debug, Error)]
pub enum ReferralError {
    /// The blob is truncated, malformed, or its signature doesn't match
    #[error("referral is invalid")]
    InvalidReferral,
    /// The blob timestamp is outside the allowed window
    #[error("referral is stale")]
    StaleReferral,
    /// The signed identity doesn't match the connecting player or server
    #[error("referral identity mismatch")]
    IdentityMismatch,
}

/// Decoded contents of a player-info referral
#[derive(Debug, PartialEq, Eq)]
pub struct PlayerReferral {
    pub uuid: Uuid,
    pub username: String,
    /// Name of the backend server the referral points at
    pub server: String,
    /// Source IP of the client as observed by the signing proxy
    pub client_ip: String,
    /// Millisecond timestamp the blob was signed at
    pub timestamp: i64,
}

/// HMAC key shared between the proxy and its backends
pub struct SigningKey(Key);

impl SigningKey {
    const KEY_LENGTH: usize = 32;

    /// Resolves the shared secret in priority order: environment
    /// variable, configuration field, random generation. A generated
    /// secret is logged so operators can copy it to the backends.
    pub fn resolve(config_secret: Option<&str>) -> Self {
        if let Ok(value) = env::var(SECRET_ENV_KEY) {
            if !value.is_empty() {
                match Self::parse_secret(&value) {
                    Some(key) => return key,
                    None => warn!(
                        "{} is set but is not a base64 or raw 32 byte secret, ignoring",
                        SECRET_ENV_KEY
                    ),
                }
            }
        }

        if let Some(value) = config_secret {
            match Self::parse_secret(value) {
                Some(key) => return key,
                None => warn!("Configured secret is not a base64 or raw 32 byte secret, ignoring"),
            }
        }

        let (key, secret) = Self::generate();
        info!(
            "No shared secret provided, generated one for this run: {}",
            Base64::encode_string(&secret)
        );
        key
    }

    /// Accepts either a base64 encoded 32 byte secret or the raw
    /// 32 byte value itself
    fn parse_secret(value: &str) -> Option<Self> {
        if let Ok(decoded) = Base64::decode_vec(value) {
            if decoded.len() == Self::KEY_LENGTH {
                return Some(Self(Key::new(HMAC_SHA256, &decoded)));
            }
        }

        let raw = value.as_bytes();
        if raw.len() == Self::KEY_LENGTH {
            return Some(Self(Key::new(HMAC_SHA256, raw)));
        }

        None
    }

    #[inline]
    pub fn new(secret: &[u8; Self::KEY_LENGTH]) -> Self {
        Self(Key::new(HMAC_SHA256, secret))
    }

    /// Generates a new random signing key
    pub fn generate() -> (Self, [u8; Self::KEY_LENGTH]) {
        let mut secret = [0; Self::KEY_LENGTH];
        OsRng.fill_bytes(&mut secret);
        (Self::new(&secret), secret)
    }

    #[inline]
    fn sign(&self, data: &[u8]) -> Tag {
        hmac::sign(&self.0, data)
    }

    #[inline]
    fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        hmac::verify(&self.0, data, tag).is_ok()
    }
}

/// Current time in milliseconds since the unix epoch
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Clock went backwards")
        .as_millis() as i64
}

fn put_prefixed(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn read_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, ReferralError> {
    if buf.remaining() < 2 {
        return Err(ReferralError::InvalidReferral);
    }
    let length = buf.get_u16() as usize;
    if buf.remaining() < length {
        return Err(ReferralError::InvalidReferral);
    }
    let value = buf[..length].to_vec();
    buf.advance(length);
    Ok(value)
}

fn read_prefixed_string(buf: &mut &[u8]) -> Result<String, ReferralError> {
    let bytes = read_prefixed(buf)?;
    String::from_utf8(bytes).map_err(|_| ReferralError::InvalidReferral)
}

fn check_timestamp(timestamp: i64) -> Result<(), ReferralError> {
    let delta = now_millis() - timestamp;
    if delta.abs() > TIMESTAMP_WINDOW_MS {
        return Err(ReferralError::StaleReferral);
    }
    Ok(())
}

/// Signs a player-info referral authorizing `uuid`/`username` onto the
/// backend named `server`.
pub fn sign_player_referral(
    key: &SigningKey,
    uuid: Uuid,
    username: &str,
    server: &str,
    client_ip: &str,
) -> Bytes {
    let mut buf = BytesMut::new();
    put_prefixed(&mut buf, uuid.as_bytes());
    buf.put_i64(now_millis());
    put_prefixed(&mut buf, server.as_bytes());
    put_prefixed(&mut buf, username.as_bytes());
    put_prefixed(&mut buf, client_ip.as_bytes());

    let tag = key.sign(&buf);
    buf.put_slice(tag.as_ref());
    buf.freeze()
}

/// Signs a control-connection referral for the backend named `server`
pub fn sign_control_referral(key: &SigningKey, server: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_prefixed(&mut buf, CONTROL_MARKER);
    buf.put_i64(now_millis());
    put_prefixed(&mut buf, server.as_bytes());

    let tag = key.sign(&buf);
    buf.put_slice(tag.as_ref());
    buf.freeze()
}

/// Checks the signature and timestamp of a player referral and decodes
/// its contents. Identity checks are the caller's responsibility; use
/// [`verify_player_referral`] when the expected identity is known.
pub fn decode_player_referral(
    key: &SigningKey,
    blob: &[u8],
) -> Result<PlayerReferral, ReferralError> {
    if blob.len() < TAG_LENGTH {
        return Err(ReferralError::InvalidReferral);
    }
    let (signed, tag) = blob.split_at(blob.len() - TAG_LENGTH);
    if !key.verify(signed, tag) {
        return Err(ReferralError::InvalidReferral);
    }

    let mut reader = signed;
    let uuid_bytes = read_prefixed(&mut reader)?;
    let uuid = Uuid::from_slice(&uuid_bytes).map_err(|_| ReferralError::InvalidReferral)?;

    if reader.remaining() < 8 {
        return Err(ReferralError::InvalidReferral);
    }
    let timestamp = reader.get_i64();
    check_timestamp(timestamp)?;

    let server = read_prefixed_string(&mut reader)?;
    let username = read_prefixed_string(&mut reader)?;
    let client_ip = read_prefixed_string(&mut reader)?;

    Ok(PlayerReferral {
        uuid,
        username,
        server,
        client_ip,
        timestamp,
    })
}

/// Full validation of a player referral against the identity the
/// receiver established through its own handshake.
pub fn verify_player_referral(
    key: &SigningKey,
    blob: &[u8],
    expected_uuid: Uuid,
    expected_username: &str,
    expected_server: &str,
) -> Result<PlayerReferral, ReferralError> {
    let referral = decode_player_referral(key, blob)?;

    if referral.uuid != expected_uuid
        || referral.username != expected_username
        || !referral.server.eq_ignore_ascii_case(expected_server)
    {
        return Err(ReferralError::IdentityMismatch);
    }

    Ok(referral)
}

/// Validates a control-connection referral for the named backend
pub fn verify_control_referral(
    key: &SigningKey,
    blob: &[u8],
    expected_server: &str,
) -> Result<(), ReferralError> {
    if blob.len() < TAG_LENGTH {
        return Err(ReferralError::InvalidReferral);
    }
    let (signed, tag) = blob.split_at(blob.len() - TAG_LENGTH);
    if !key.verify(signed, tag) {
        return Err(ReferralError::InvalidReferral);
    }

    let mut reader = signed;
    let marker = read_prefixed(&mut reader)?;
    if marker != CONTROL_MARKER {
        return Err(ReferralError::InvalidReferral);
    }

    if reader.remaining() < 8 {
        return Err(ReferralError::InvalidReferral);
    }
    let timestamp = reader.get_i64();
    check_timestamp(timestamp)?;

    let server = read_prefixed_string(&mut reader)?;
    if !server.eq_ignore_ascii_case(expected_server) {
        return Err(ReferralError::IdentityMismatch);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_key() -> SigningKey {
        SigningKey::generate().0
    }

    /// Signed player referrals verify against the same identity
    #[test]
    fn test_player_round_trip() {
        let key = test_key();
        let uuid = Uuid::new_v4();

        let blob = sign_player_referral(&key, uuid, "Steve", "lobby", "203.0.113.7");
        let referral = verify_player_referral(&key, &blob, uuid, "Steve", "lobby").unwrap();

        assert_eq!(referral.uuid, uuid);
        assert_eq!(referral.username, "Steve");
        assert_eq!(referral.server, "lobby");
        assert_eq!(referral.client_ip, "203.0.113.7");
    }

    /// Backend name comparison is case-insensitive
    #[test]
    fn test_player_server_case_insensitive() {
        let key = test_key();
        let uuid = Uuid::new_v4();

        let blob = sign_player_referral(&key, uuid, "Steve", "Lobby", "203.0.113.7");
        verify_player_referral(&key, &blob, uuid, "Steve", "LOBBY").unwrap();
    }

    /// Any single byte flip in the signed region or the tag fails
    #[test]
    fn test_player_mutation_rejected() {
        let key = test_key();
        let uuid = Uuid::new_v4();
        let blob = sign_player_referral(&key, uuid, "Steve", "lobby", "203.0.113.7");

        for index in 0..blob.len() {
            let mut mutated = blob.to_vec();
            mutated[index] ^= 0x01;
            assert!(matches!(
                verify_player_referral(&key, &mutated, uuid, "Steve", "lobby"),
                Err(ReferralError::InvalidReferral)
            ));
        }
    }

    /// Mismatching any identity parameter is an identity error
    #[test]
    fn test_player_identity_mismatch() {
        let key = test_key();
        let uuid = Uuid::new_v4();
        let blob = sign_player_referral(&key, uuid, "Steve", "lobby", "203.0.113.7");

        assert!(matches!(
            verify_player_referral(&key, &blob, Uuid::new_v4(), "Steve", "lobby"),
            Err(ReferralError::IdentityMismatch)
        ));
        assert!(matches!(
            verify_player_referral(&key, &blob, uuid, "Alex", "lobby"),
            Err(ReferralError::IdentityMismatch)
        ));
        assert!(matches!(
            verify_player_referral(&key, &blob, uuid, "Steve", "arena"),
            Err(ReferralError::IdentityMismatch)
        ));
    }

    /// A referral signed with a different key never verifies
    #[test]
    fn test_wrong_key_rejected() {
        let uuid = Uuid::new_v4();
        let blob = sign_player_referral(&test_key(), uuid, "Steve", "lobby", "203.0.113.7");

        assert!(matches!(
            verify_player_referral(&test_key(), &blob, uuid, "Steve", "lobby"),
            Err(ReferralError::InvalidReferral)
        ));
    }

    /// Referrals outside the timestamp window are stale
    #[test]
    fn test_stale_timestamp() {
        let key = test_key();
        let uuid = Uuid::new_v4();

        // Re-create the signing path with an expired timestamp
        let mut buf = BytesMut::new();
        put_prefixed(&mut buf, uuid.as_bytes());
        buf.put_i64(now_millis() - TIMESTAMP_WINDOW_MS - 1000);
        put_prefixed(&mut buf, b"lobby");
        put_prefixed(&mut buf, b"Steve");
        put_prefixed(&mut buf, b"203.0.113.7");
        let tag = key.sign(&buf);
        buf.put_slice(tag.as_ref());

        assert!(matches!(
            decode_player_referral(&key, &buf),
            Err(ReferralError::StaleReferral)
        ));
    }

    /// Control referrals round trip and pin the backend name
    #[test]
    fn test_control_round_trip() {
        let key = test_key();
        let blob = sign_control_referral(&key, "lobby");

        verify_control_referral(&key, &blob, "lobby").unwrap();
        assert!(matches!(
            verify_control_referral(&key, &blob, "arena"),
            Err(ReferralError::IdentityMismatch)
        ));
    }

    /// A player blob is never accepted as a control blob
    #[test]
    fn test_variant_confusion_rejected() {
        let key = test_key();
        let uuid = Uuid::new_v4();
        let blob = sign_player_referral(&key, uuid, "Steve", "lobby", "203.0.113.7");

        assert!(matches!(
            verify_control_referral(&key, &blob, "lobby"),
            Err(ReferralError::InvalidReferral)
        ));
    }

    /// Secrets parse from base64 and raw forms
    #[test]
    fn test_parse_secret() {
        let secret = [7u8; 32];
        assert!(SigningKey::parse_secret(&Base64::encode_string(&secret)).is_some());
        assert!(SigningKey::parse_secret("0123456789abcdef0123456789abcdef").is_some());
        assert!(SigningKey::parse_secret("too-short").is_none());
    }
}
