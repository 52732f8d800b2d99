//! Data plane
//!
//! Outbound: one dispatcher task per local interface reads datagrams,
//! resolves the destination to a peer through the route table, and writes
//! one framed packet on a fresh unidirectional stream. The per-packet
//! stream localizes errors: a failed write costs a stream, not the
//! session.
//!
//! Inbound: each accepted data stream is read frame by frame; packets are
//! demultiplexed to the interface named in the frame and written verbatim.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use vibepn_net::iface::{ip, PacketInterface};
use vibepn_net::{transport, DataFrame, NetError};

use crate::engine::Context;
use crate::metrics::counters;

/// Spawn the outbound dispatcher for one interface.
pub fn spawn_dispatcher(
    ctx: Arc<Context>,
    network: String,
    iface: Arc<dyn PacketInterface>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(network = %network, device = iface.name(), "dispatcher started");
        loop {
            let packet = match iface.recv().await {
                Ok(packet) => packet,
                Err(NetError::InterfaceClosed(name)) => {
                    info!(network = %network, device = %name, "interface closed, dispatcher exiting");
                    return;
                }
                Err(e) => {
                    warn!(network = %network, error = %e, "interface read error");
                    continue;
                }
            };

            if !ip::is_ipv4(&packet) {
                warn!(network = %network, "dropping non-IPv4 packet");
                ctx.counters.incr(counters::PACKETS_DROPPED_NOT_IPV4);
                continue;
            }
            let Some(destination) = ip::ipv4_destination(&packet) else {
                warn!(network = %network, len = packet.len(), "dropping malformed packet");
                ctx.counters.incr(counters::PACKETS_DROPPED_NOT_IPV4);
                continue;
            };

            let Some(route) = ctx.routes.lookup(&network, destination) else {
                warn!(network = %network, %destination, "no route");
                ctx.counters.incr(counters::PACKETS_DROPPED_NO_ROUTE);
                continue;
            };

            let Some(session) = ctx.registry.get(&route.peer) else {
                warn!(network = %network, peer = %route.peer, "no active session for route");
                ctx.counters.incr(counters::PACKETS_DROPPED_NO_SESSION);
                continue;
            };

            let mut stream = match transport::open_uni(&session.connection).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(network = %network, peer = %route.peer, error = %e, "failed to open data stream");
                    continue;
                }
            };

            let frame = match DataFrame::encode(&network, &packet) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(network = %network, error = %e, "dropping unframeable packet");
                    continue;
                }
            };

            if let Err(e) = stream.write_all(&frame).await {
                warn!(network = %network, peer = %route.peer, error = %e, "data stream write failed");
                continue;
            }
            let _ = stream.finish();

            ctx.counters.incr(counters::PACKETS_FORWARDED);
            trace!(network = %network, %destination, peer = %route.peer, len = packet.len(), "forwarded packet");
        }
    })
}

/// Read data frames from one inbound stream until it ends.
///
/// Frames for unknown networks are dropped and reading continues; an
/// interface write error or framing violation releases the stream.
pub async fn handle_data_stream(ctx: Arc<Context>, mut stream: quinn::RecvStream) {
    loop {
        match DataFrame::read(&mut stream).await {
            Ok(Some(frame)) => {
                let Some(iface) = ctx.interfaces.get(&frame.network) else {
                    debug!(network = %frame.network, "dropping packet for unknown network");
                    ctx.counters.incr(counters::PACKETS_DROPPED_UNKNOWN_NETWORK);
                    continue;
                };

                if let Err(e) = iface.send(&frame.packet).await {
                    warn!(network = %frame.network, error = %e, "interface write failed");
                    return;
                }
                ctx.counters.incr(counters::PACKETS_RECEIVED);
                trace!(network = %frame.network, len = frame.packet.len(), "delivered packet");
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "abandoning data stream");
                return;
            }
        }
    }
}
