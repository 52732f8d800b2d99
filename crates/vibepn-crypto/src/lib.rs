//! VibePN identity and trust
//!
//! Provides the cryptographic identity model for VibePN nodes:
//! - Certificate/key loading and SHA-256 fingerprinting
//! - Peer identity (`PeerId`) derived from the leaf certificate
//! - Trust-on-first-use pinning store
//! - QUIC/TLS configuration with fingerprint-pinned verification

pub mod error;
pub mod identity;
pub mod tls;
pub mod tofu;

pub use error::{CryptoError, CryptoResult};
pub use identity::{NodeIdentity, PeerId};
pub use tls::{client_config, peer_id_from_connection, server_config, ALPN};
pub use tofu::TrustStore;
