//! Node identity
//!
//! A node is identified by the SHA-256 fingerprint of its DER-encoded leaf
//! certificate. The fingerprint is the sole equality key for peers: it is
//! what the trust store pins, what the registry keys sessions by, and what
//! routes are attributed to.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};

/// A peer identity: the lowercase-hex SHA-256 of the peer's leaf certificate.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Derive a peer identity from a DER-encoded certificate.
    pub fn from_der(cert: &[u8]) -> Self {
        let digest = Sha256::digest(cert);
        Self(hex::encode(digest))
    }

    /// Wrap an already-rendered fingerprint (e.g. from configuration).
    pub fn from_hex(fingerprint: impl Into<String>) -> Self {
        Self(fingerprint.into().to_ascii_lowercase())
    }

    /// The full hex fingerprint.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.0[..self.0.len().min(12)])
    }
}

/// A node's loaded identity: certificate chain, private key, and the
/// fingerprint of the leaf certificate.
#[derive(Debug)]
pub struct NodeIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Load an identity from PEM-encoded certificate and key files.
    ///
    /// If `expected_fingerprint` is set, the leaf certificate's fingerprint
    /// must match it exactly; a mismatch is fatal.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        expected_fingerprint: Option<&str>,
    ) -> CryptoResult<Self> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
                .collect::<Result<_, _>>()?;
        let leaf = certs
            .first()
            .ok_or_else(|| CryptoError::NoCertificate(cert_path.display().to_string()))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| CryptoError::NoPrivateKey(key_path.display().to_string()))?;

        let peer_id = PeerId::from_der(leaf.as_ref());

        if let Some(expected) = expected_fingerprint {
            if peer_id.as_str() != expected.to_ascii_lowercase() {
                return Err(CryptoError::FingerprintMismatch {
                    expected: expected.to_string(),
                    actual: peer_id.as_str().to_string(),
                });
            }
        }

        Ok(Self {
            certs,
            key,
            peer_id,
        })
    }

    /// Build an identity from already-parsed material.
    pub fn from_parts(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        let peer_id = PeerId::from_der(certs[0].as_ref());
        Self {
            certs,
            key,
            peer_id,
        }
    }

    /// This node's own fingerprint.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The certificate chain, leaf first.
    pub fn certs(&self) -> Vec<CertificateDer<'static>> {
        self.certs.clone()
    }

    /// A clone of the private key for TLS configuration.
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}
