//! Session drivers
//!
//! One dialer task per configured peer and one handler per accepted
//! connection. Both sides converge on the same shape: a single long-lived
//! bidirectional control stream carrying Hello, route announcements, and
//! keepalives, plus unidirectional data streams in each direction.
//!
//! Closing the QUIC connection cancels every child stream, so the control
//! reader, keepalive sender, and data-stream handlers all terminate with
//! the session; no separate cancellation channel exists.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::{debug, error, info, warn};

use vibepn_crypto::tls::SERVER_NAME;
use vibepn_crypto::{client_config, peer_id_from_connection, PeerId};
use vibepn_net::{transport, AnnouncedRoute, ControlMessage};

use crate::config::PeerConfig;
use crate::control::{self, Flow};
use crate::engine::Context;
use crate::metrics::counters;
use crate::forward;
use crate::registry::{close, Session};

/// First reconnect delay after a failed dial or closed session.
const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Reconnect delay ceiling.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Base keepalive interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Uniform jitter applied to each keepalive interval, in milliseconds.
const KEEPALIVE_JITTER_MS: i64 = 1000;

/// Keepalive failure backoff ceiling.
const KEEPALIVE_MAX_BACKOFF: Duration = Duration::from_secs(120);

fn generate_nonce() -> u64 {
    OsRng.next_u64()
}

/// Spawn one dialer task per configured peer.
pub fn spawn_dialers(ctx: &Arc<Context>, endpoint: &quinn::Endpoint) {
    for peer in ctx.peers.clone() {
        info!(peer = %peer.name, address = %peer.address, "starting dialer");
        tokio::spawn(run_dialer(ctx.clone(), endpoint.clone(), peer));
    }
}

/// Dial a peer forever: connect, run the session, reconnect with backoff.
async fn run_dialer(ctx: Arc<Context>, endpoint: quinn::Endpoint, peer: PeerConfig) {
    let config = match client_config(
        &ctx.identity,
        &peer.name,
        peer.fingerprint.as_deref(),
        ctx.trust.clone(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(peer = %peer.name, error = %e, "failed to build TLS config");
            return;
        }
    };

    let mut backoff = INITIAL_RECONNECT_BACKOFF;

    loop {
        let addr = match tokio::net::lookup_host(&peer.address)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(addr) => addr,
            None => {
                retry_wait(&peer.name, "address resolution failed", &mut backoff).await;
                continue;
            }
        };

        let connection = match transport::dial(&endpoint, addr, config.clone(), SERVER_NAME).await {
            Ok(connection) => connection,
            Err(e) => {
                retry_wait(&peer.name, &e.to_string(), &mut backoff).await;
                continue;
            }
        };
        info!(peer = %peer.name, %addr, "session established");

        let (mut send, recv) = match transport::open_bi(&connection).await {
            Ok(streams) => streams,
            Err(e) => {
                connection.close(close::PROTOCOL, b"failed to open control stream");
                retry_wait(&peer.name, &e.to_string(), &mut backoff).await;
                continue;
            }
        };

        let Some(peer_id) = peer_id_from_connection(&connection) else {
            connection.close(close::PROTOCOL, b"no peer certificate");
            retry_wait(&peer.name, "no peer certificate", &mut backoff).await;
            continue;
        };

        let local_nonce = generate_nonce();
        if let Err(e) = (ControlMessage::Hello { nonce: local_nonce }).write(&mut send).await {
            connection.close(close::PROTOCOL, b"failed to send hello");
            retry_wait(&peer.name, &e.to_string(), &mut backoff).await;
            continue;
        }
        debug!(peer = %peer.name, nonce = local_nonce, "sent hello");
        ctx.registry.store_nonce(&peer_id, local_nonce);

        let session = Session::new(connection.clone(), local_nonce);
        *session.control.lock().await = Some(send);
        ctx.registry.add(peer_id.clone(), session.clone());
        ctx.liveness.mark_alive(&peer_id);

        announce_exported(&ctx, &session).await;
        spawn_keepalive(ctx.clone(), session.clone());
        spawn_data_acceptor(ctx.clone(), connection.clone());
        tokio::spawn(run_control_reader(
            ctx.clone(),
            peer_id.clone(),
            connection.clone(),
            recv,
        ));

        backoff = INITIAL_RECONNECT_BACKOFF;

        let reason = connection.closed().await;
        warn!(peer = %peer.name, %reason, reconnect_in = ?backoff, "session closed");
        tokio::time::sleep(backoff).await;
    }
}

/// Log the failure, sleep the current backoff, and double it (capped).
async fn retry_wait(peer_name: &str, reason: &str, backoff: &mut Duration) {
    warn!(peer = %peer_name, reason, retry_in = ?*backoff, "dial attempt failed");
    let delay = *backoff;
    *backoff = (*backoff * 2).min(MAX_RECONNECT_BACKOFF);
    tokio::time::sleep(delay).await;
}

/// Accept inbound sessions for the life of the endpoint.
pub async fn accept_loop(ctx: Arc<Context>, endpoint: quinn::Endpoint) {
    while let Some(incoming) = endpoint.accept().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => handle_incoming(ctx, connection).await,
                Err(e) => debug!(error = %e, "inbound handshake failed"),
            }
        });
    }
    debug!("accept loop finished");
}

/// Drive one accepted session.
async fn handle_incoming(ctx: Arc<Context>, connection: quinn::Connection) {
    let Some(peer_id) = peer_id_from_connection(&connection) else {
        connection.close(close::PROTOCOL, b"no peer certificate");
        return;
    };
    info!(peer = %peer_id, remote = %connection.remote_address(), "accepted session");

    let local_nonce = generate_nonce();
    let session = Session::new(connection.clone(), local_nonce);
    ctx.registry.add(peer_id.clone(), session.clone());
    ctx.liveness.mark_alive(&peer_id);

    spawn_data_acceptor(ctx.clone(), connection.clone());

    // The first incoming bidirectional stream is the control stream.
    let (mut send, recv) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            debug!(peer = %peer_id, error = %e, "session ended before control stream");
            return;
        }
    };

    if let Err(e) = (ControlMessage::Hello { nonce: local_nonce }).write(&mut send).await {
        warn!(peer = %peer_id, error = %e, "failed to send hello");
        connection.close(close::PROTOCOL, b"failed to send hello");
        return;
    }
    *session.control.lock().await = Some(send);

    announce_exported(&ctx, &session).await;
    spawn_keepalive(ctx.clone(), session.clone());
    run_control_reader(ctx, peer_id, connection, recv).await;
}

/// Announce every exported network's prefix (metric 1) on the session's
/// control stream.
pub async fn announce_exported(ctx: &Context, session: &Session) {
    for (network, config) in ctx.networks() {
        if !config.export {
            continue;
        }
        let message = ControlMessage::Announce {
            network: network.clone(),
            routes: vec![AnnouncedRoute {
                prefix: config.prefix.clone(),
                metric: 1,
            }],
        };
        if let Err(e) = session.send_control(&message).await {
            warn!(network = %network, error = %e, "failed to announce route");
        }
    }
}

/// Periodic keepalives on the control stream, with jitter and failure
/// backoff. Exits when the session closes.
pub fn spawn_keepalive(ctx: Arc<Context>, session: Session) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            let interval = jittered_interval();
            tokio::select! {
                _ = session.connection.closed() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let unix_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            match session
                .send_control(&ControlMessage::Keepalive { unix_secs })
                .await
            {
                Ok(()) => {
                    failures = 0;
                    ctx.counters.incr(counters::KEEPALIVES_SENT);
                    debug!(remote = %session.remote_address(), "sent keepalive");
                }
                Err(e) => {
                    failures += 1;
                    let backoff = keepalive_backoff(failures);
                    warn!(error = %e, failures, backoff = ?backoff, "keepalive failed");
                    tokio::select! {
                        _ = session.connection.closed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    })
}

fn jittered_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(-KEEPALIVE_JITTER_MS..=KEEPALIVE_JITTER_MS);
    Duration::from_millis((KEEPALIVE_INTERVAL.as_millis() as i64 + jitter) as u64)
}

fn keepalive_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.min(4);
    (KEEPALIVE_INTERVAL * factor).min(KEEPALIVE_MAX_BACKOFF)
}

/// Accept unidirectional data streams for the life of the session.
pub fn spawn_data_acceptor(
    ctx: Arc<Context>,
    connection: quinn::Connection,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match connection.accept_uni().await {
                Ok(stream) => {
                    tokio::spawn(forward::handle_data_stream(ctx.clone(), stream));
                }
                Err(e) => {
                    debug!(error = %e, "data acceptor finished");
                    return;
                }
            }
        }
    })
}

/// Read control frames until the session ends. Every received frame marks
/// the peer alive; any framing violation closes the session.
pub async fn run_control_reader(
    ctx: Arc<Context>,
    peer: PeerId,
    connection: quinn::Connection,
    mut recv: quinn::RecvStream,
) {
    loop {
        match ControlMessage::read(&mut recv).await {
            Ok(Some(message)) => {
                ctx.liveness.mark_alive(&peer);
                ctx.counters.incr(counters::CONTROL_FRAMES_RECEIVED);
                match control::handle(&ctx.registry, &ctx.routes, &peer, message) {
                    Flow::Continue => {}
                    Flow::Goodbye => {
                        connection.close(close::GOODBYE, b"peer sent goodbye");
                        return;
                    }
                }
            }
            Ok(None) => {
                debug!(peer = %peer, "control stream closed");
                connection.close(quinn::VarInt::from_u32(0), b"control stream closed");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "protocol error on control stream");
                connection.close(close::PROTOCOL, b"protocol error");
                return;
            }
        }
    }
}
