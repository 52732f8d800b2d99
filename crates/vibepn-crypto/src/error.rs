//! Identity and trust errors

use thiserror::Error;

/// Identity and trust errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// I/O error reading identity material or the trust store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No certificate found in the PEM file
    #[error("no certificate found in {0}")]
    NoCertificate(String),

    /// No private key found in the PEM file
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// Certificate could not be parsed
    #[error("bad certificate: {0}")]
    BadCertificate(String),

    /// Loaded certificate does not match the configured fingerprint
    #[error("fingerprint mismatch: got {actual}, expected {expected}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Peer presented a certificate that differs from the pinned fingerprint
    #[error("trust mismatch for peer {peer}: expected {expected}, got {actual}")]
    TrustMismatch {
        peer: String,
        expected: String,
        actual: String,
    },

    /// Trust store file could not be read or written
    #[error("trust store error: {0}")]
    TrustStore(String),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Result type for identity and trust operations
pub type CryptoResult<T> = Result<T, CryptoError>;
