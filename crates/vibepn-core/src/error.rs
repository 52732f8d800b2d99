//! Core runtime errors

use thiserror::Error;

/// Core runtime errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed configuration or invalid prefix/address
    #[error("configuration error: {0}")]
    Config(String),

    /// Identity or trust failure
    #[error("identity error: {0}")]
    Crypto(#[from] vibepn_crypto::CryptoError),

    /// Transport, framing, or interface failure
    #[error("network error: {0}")]
    Net(#[from] vibepn_net::NetError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session has no established control stream yet
    #[error("control stream not established")]
    ControlUnavailable,

    /// Malformed admin request
    #[error("admin error: {0}")]
    Admin(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
