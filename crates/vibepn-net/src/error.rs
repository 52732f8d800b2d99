//! Networking errors

use thiserror::Error;

/// Networking errors
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control frame length outside [1, 4096]
    #[error("invalid control frame length: {0}")]
    InvalidFrameLength(usize),

    /// Message body shorter than its type requires
    #[error("truncated {0} body")]
    Truncated(&'static str),

    /// Unknown control type tag
    #[error("unknown control type: 0x{0:02x}")]
    UnknownControlType(u8),

    /// Network name is empty or longer than 255 bytes
    #[error("invalid network name length: {0}")]
    InvalidNameLength(usize),

    /// Network name is not valid UTF-8
    #[error("network name is not valid UTF-8")]
    InvalidName,

    /// Prefix string is empty or longer than 255 bytes
    #[error("invalid prefix length: {0}")]
    InvalidPrefixLength(usize),

    /// Announce carried no route tuples
    #[error("route-announce carries no routes")]
    EmptyAnnounce,

    /// Data frame packet length is zero or the packet exceeds 65535 bytes
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(usize),

    /// Dial did not complete within the deadline
    #[error("dial to {0} timed out")]
    DialTimeout(std::net::SocketAddr),

    /// Stream open did not complete within the deadline
    #[error("stream open timed out")]
    StreamOpenTimeout,

    /// QUIC connect setup failed
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// QUIC connection failed or was closed
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// QUIC stream write failed
    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    /// Local packet interface was closed
    #[error("packet interface {0} closed")]
    InterfaceClosed(String),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),
}

/// Result type for networking operations
pub type NetResult<T> = Result<T, NetError>;
