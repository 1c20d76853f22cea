//! TLS material loading for the QUIC endpoints.
//!
//! The certificate and key are loaded once at startup and shared between
//! the client listener and the backend dialer: backends pin the proxy by
//! certificate fingerprint, so both sides of the proxy present the same
//! key pair. Peer certificates are required on every connection but are
//! validated by fingerprint at the application layer rather than through
//! a PKI chain.

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use ring::digest::{digest, SHA256};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The single ALPN token spoken on both sides of the proxy
pub const ALPN: &[u8] = b"numdrassl/1";

/// Flow control windows for backend connections: 10MB connection,
/// 1MB per stream, 100 bidirectional streams
const BACKEND_MAX_DATA: u32 = 10 * 1024 * 1024;
const BACKEND_STREAM_MAX_DATA: u32 = 1024 * 1024;
const BACKEND_MAX_BIDI_STREAMS: u32 = 100;

/// Errors that can occur while loading TLS material. All of these are
/// fatal at startup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse certificate chain: {0}")]
    ParseCertificate(String),
    #[error("certificate chain is empty")]
    EmptyCertificate,
    #[error("no usable private key found")]
    MissingKey,
    #[error("tls configuration rejected: {0}")]
    Crypto(#[from] rustls::Error),
    #[error("quic incompatible tls configuration: {0}")]
    Quic(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
}

/// Shared TLS context built once at startup
pub struct TlsContext {
    /// Server configuration for the client listener
    pub server: quinn::ServerConfig,
    /// Client configuration for per-player backend connections
    pub client: quinn::ClientConfig,
    /// Client configuration for control connections; same identity,
    /// BBR congestion control
    pub control: quinn::ClientConfig,
}

impl TlsContext {
    /// Loads the certificate and key from disk and builds the listener
    /// and dialer configurations around them.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        idle_timeout: Duration,
    ) -> Result<TlsContext, TlsError> {
        let certs = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;

        let server = server_config(certs.clone(), key.clone_key(), idle_timeout)?;
        let client = client_config(certs.clone(), key.clone_key(), idle_timeout, false)?;
        let control = client_config(certs, key, idle_timeout, true)?;

        Ok(TlsContext {
            server,
            client,
            control,
        })
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = std::fs::read(path).map_err(|error| TlsError::Read {
        path: path.display().to_string(),
        error,
    })?;

    let mut reader = &pem[..];
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| TlsError::ParseCertificate(err.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::EmptyCertificate);
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = std::fs::read(path).map_err(|error| TlsError::Read {
        path: path.display().to_string(),
        error,
    })?;

    let mut reader = &pem[..];
    rustls_pemfile::private_key(&mut reader)
        .map_err(|_| TlsError::MissingKey)?
        .ok_or(TlsError::MissingKey)
}

/// The ring provider is used explicitly; relying on the process
/// default breaks once another dependency enables a second provider
fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, TlsError> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(Arc::new(RequireAnyClientCert))
        .with_single_cert(certs, key)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(crypto)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(idle_timeout_for(idle_timeout));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    idle_timeout: Duration,
    bbr: bool,
) -> Result<quinn::ClientConfig, TlsError> {
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(certs, key)?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(crypto)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(idle_timeout_for(idle_timeout));
    transport.receive_window(VarInt::from_u32(BACKEND_MAX_DATA));
    transport.stream_receive_window(VarInt::from_u32(BACKEND_STREAM_MAX_DATA));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(BACKEND_MAX_BIDI_STREAMS));
    if bbr {
        transport
            .congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
    }
    config.transport_config(Arc::new(transport));

    Ok(config)
}

fn idle_timeout_for(duration: Duration) -> Option<IdleTimeout> {
    IdleTimeout::try_from(duration).ok()
}

/// SHA-256 fingerprint of a DER encoded certificate as lowercase hex
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    let hash = digest(&SHA256, cert.as_ref());
    hash.as_ref().iter().fold(
        String::with_capacity(64),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

/// Client certificate verifier that requires a certificate but accepts
/// any; identity is established by fingerprint pinning above TLS.
#[derive(Debug)]
struct RequireAnyClientCert;

impl ClientCertVerifier for RequireAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

/// Server certificate verifier used when dialing backends; backends are
/// deployed with the shared secret out-of-band, their certificates are
/// not chained to a public root.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        supported_schemes()
    }
}

fn supported_schemes() -> Vec<SignatureScheme> {
    vec![
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ECDSA_NISTP384_SHA384,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PSS_SHA256,
        SignatureScheme::RSA_PSS_SHA384,
        SignatureScheme::RSA_PSS_SHA512,
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::RSA_PKCS1_SHA384,
        SignatureScheme::RSA_PKCS1_SHA512,
    ]
}

/// Client config with no server verification and no client auth, for
/// tests that construct dialers without certificate material
#[cfg(test)]
pub fn insecure_client_config() -> quinn::ClientConfig {
    let crypto = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("tls13 unavailable")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let crypto = QuicClientConfig::try_from(crypto).expect("tls13 suites unavailable");
    quinn::ClientConfig::new(Arc::new(crypto))
}

#[cfg(test)]
mod test {
    use super::*;

    /// Fingerprints are stable lowercase hex over the DER bytes
    #[test]
    fn test_fingerprint_format() {
        let cert = CertificateDer::from(vec![1u8, 2, 3, 4]);
        let fingerprint = certificate_fingerprint(&cert);

        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fingerprint, certificate_fingerprint(&cert));
    }
}
