//! QUIC/TLS configuration with fingerprint pinning
//!
//! No PKI: every node presents a self-signed certificate and peers are
//! identified purely by certificate fingerprint. The client verifier pins
//! the server's fingerprint through the trust store (TOFU); the server
//! accepts any syntactically valid, time-valid client certificate and
//! derives the peer identity from its fingerprint afterwards.
//!
//! The `dangerous()` rustls APIs are used intentionally: verification here
//! is fingerprint-based, not chain-based.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, UnixTime};
use tracing::warn;

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{NodeIdentity, PeerId};
use crate::tofu::TrustStore;

/// ALPN protocol identifier for all VibePN connections.
pub const ALPN: &[u8] = b"vibepn/0.1";

/// SNI value used on dials; verification ignores it and pins fingerprints.
pub const SERVER_NAME: &str = "vibepn";

/// Sessions idle longer than this are torn down by the transport. The
/// application-level keepalive fires every 10 s, so this only catches
/// fully wedged peers.
const MAX_IDLE: std::time::Duration = std::time::Duration::from_secs(60);

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Build the QUIC server configuration for the listening endpoint.
pub fn server_config(identity: &NodeIdentity) -> CryptoResult<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AnyValidClientCert))
        .with_single_cert(identity.certs(), identity.key())?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| CryptoError::Tls(rustls::Error::General(format!("QUIC server config: {e}"))))?,
    ));

    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config is exclusively owned at construction");
    transport.max_idle_timeout(Some(
        MAX_IDLE.try_into().expect("60s fits in a VarInt duration"),
    ));

    Ok(config)
}

/// Build a QUIC client configuration that pins the named peer's
/// fingerprint through the trust store.
///
/// `pinned` is the peer's configured fingerprint, if any; it is checked
/// before the trust store is consulted.
pub fn client_config(
    identity: &NodeIdentity,
    peer_name: &str,
    pinned: Option<&str>,
    store: Arc<TrustStore>,
) -> CryptoResult<quinn::ClientConfig> {
    let verifier = PinnedServerCert {
        peer_name: peer_name.to_string(),
        pinned: pinned.map(|fp| fp.to_ascii_lowercase()),
        store,
    };

    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(identity.certs(), identity.key())?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| CryptoError::Tls(rustls::Error::General(format!("QUIC client config: {e}"))))?,
    )))
}

/// Derive the peer identity from an established connection's certificate.
pub fn peer_id_from_connection(connection: &quinn::Connection) -> Option<PeerId> {
    let identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer<'_>> = identity.downcast_ref()?;
    Some(PeerId::from_der(certs.first()?.as_ref()))
}

/// Reject certificates outside their validity window.
fn check_validity(cert_der: &[u8], now: UnixTime) -> Result<(), rustls::Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

    let now = now.as_secs() as i64;
    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::NotValidYet,
        ));
    }
    if now > validity.not_after.timestamp() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::Expired,
        ));
    }
    Ok(())
}

/// Client-side verifier: pins the server certificate's fingerprint for the
/// configured peer name, trusting on first use.
#[derive(Debug)]
struct PinnedServerCert {
    peer_name: String,
    pinned: Option<String>,
    store: Arc<TrustStore>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_validity(end_entity.as_ref(), now)?;

        let fingerprint = PeerId::from_der(end_entity.as_ref());

        if let Some(expected) = &self.pinned {
            if fingerprint.as_str() != expected {
                warn!(
                    peer = %self.peer_name,
                    expected = %expected,
                    actual = %fingerprint,
                    "configured fingerprint mismatch"
                );
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        }

        self.store
            .admit(&self.peer_name, fingerprint.as_str())
            .map_err(|e| {
                warn!(peer = %self.peer_name, error = %e, "rejecting peer certificate");
                rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                )
            })?;

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server-side verifier: any syntactically valid, time-valid client
/// certificate is accepted; the peer identity is its fingerprint.
#[derive(Debug)]
struct AnyValidClientCert;

impl rustls::server::danger::ClientCertVerifier for AnyValidClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        check_validity(end_entity.as_ref(), now)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}
