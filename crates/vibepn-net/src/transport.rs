//! QUIC transport
//!
//! One endpoint serves both roles: it listens for inbound sessions and
//! dials outbound ones. All stream opens on hot paths carry a 2-second
//! deadline; dials carry a 5-second deadline.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::{NetError, NetResult};

/// Deadline for establishing an outbound session.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for opening a stream on an established session.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind the endpoint that accepts and originates sessions.
pub fn bind(addr: SocketAddr, server_config: quinn::ServerConfig) -> NetResult<quinn::Endpoint> {
    let endpoint = quinn::Endpoint::server(server_config, addr)?;
    debug!(addr = %endpoint.local_addr()?, "QUIC endpoint bound");
    Ok(endpoint)
}

/// Dial a peer with the 5-second deadline.
pub async fn dial(
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    config: quinn::ClientConfig,
    server_name: &str,
) -> NetResult<quinn::Connection> {
    let connecting = endpoint.connect_with(config, addr, server_name)?;
    match timeout(DIAL_TIMEOUT, connecting).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NetError::DialTimeout(addr)),
    }
}

/// Open a bidirectional stream with the 2-second deadline.
pub async fn open_bi(
    connection: &quinn::Connection,
) -> NetResult<(quinn::SendStream, quinn::RecvStream)> {
    match timeout(STREAM_OPEN_TIMEOUT, connection.open_bi()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NetError::StreamOpenTimeout),
    }
}

/// Open a unidirectional stream with the 2-second deadline.
pub async fn open_uni(connection: &quinn::Connection) -> NetResult<quinn::SendStream> {
    match timeout(STREAM_OPEN_TIMEOUT, connection.open_uni()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NetError::StreamOpenTimeout),
    }
}
