//! End-to-end scenarios: two in-process nodes over loopback QUIC with
//! in-memory packet interfaces.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use vibepn_core::config::{Config, DaemonConfig, IdentityConfig, NetworkConfig, PeerConfig};
use vibepn_core::{Context, Engine, EngineBuilder};
use vibepn_crypto::TrustStore;
use vibepn_net::iface::MemoryHandle;
use vibepn_net::{ControlMessage, MemoryInterface};

const CORP_PREFIX: &str = "10.42.0.0/24";

struct TestNode {
    engine: Engine,
    ctx: Arc<Context>,
    corp: MemoryHandle,
    addr: SocketAddr,
    fingerprint: String,
    #[allow(dead_code)]
    dir: TempDir,
}

/// A peer entry for the node under construction.
struct TestPeer {
    name: &'static str,
    addr: SocketAddr,
}

fn write_identity(dir: &std::path::Path) -> (PathBuf, PathBuf) {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["vibepn".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();

    let cert_path = dir.join("node.crt");
    let key_path = dir.join("node.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();
    (cert_path, key_path)
}

fn node_config(
    dir: &std::path::Path,
    corp_address: &str,
    listen: SocketAddr,
    peers: &[TestPeer],
) -> Config {
    let (cert, key) = write_identity(dir);
    Config {
        identity: IdentityConfig {
            cert,
            key,
            fingerprint: None,
        },
        peers: peers
            .iter()
            .map(|p| PeerConfig {
                name: p.name.to_string(),
                address: p.addr.to_string(),
                fingerprint: None,
                networks: vec!["corp".to_string()],
            })
            .collect(),
        networks: [(
            "corp".to_string(),
            NetworkConfig {
                address: corp_address.to_string(),
                prefix: CORP_PREFIX.to_string(),
                export: true,
            },
        )]
        .into(),
        daemon: DaemonConfig {
            listen,
            admin_socket: dir.join("vibepn.sock"),
        },
    }
}

async fn start_node(corp_address: &str, listen: SocketAddr, peers: &[TestPeer]) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), corp_address, listen, peers);

    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, toml::to_string(&config).unwrap()).unwrap();

    let (iface, handle) = MemoryInterface::pair("corp");
    let engine = EngineBuilder::new(config, config_path)
        .interface("corp", Arc::new(iface))
        .trust_store(Arc::new(TrustStore::at(dir.path().join("known_peers.json"))))
        .start()
        .await
        .unwrap();

    let ctx = engine.context();
    let addr = {
        let bound = engine.local_addr().unwrap();
        SocketAddr::new("127.0.0.1".parse().unwrap(), bound.port())
    };
    let fingerprint = ctx.identity.peer_id().as_str().to_string();

    TestNode {
        engine,
        ctx,
        corp: handle,
        addr,
        fingerprint,
        dir,
    }
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Reserve a loopback port by binding and releasing it.
fn reserve_port() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

async fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 20 + payload.len()];
    pkt[0] = 0x45;
    let total = (20 + payload.len()) as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[20..].copy_from_slice(payload);
    pkt
}

/// Dial from A to B and wait until both directions have learned routes.
async fn connected_pair() -> (TestNode, TestNode) {
    let b = start_node("10.42.0.2", any_port(), &[]).await;
    let a = start_node(
        "10.42.0.1",
        any_port(),
        &[TestPeer { name: "b", addr: b.addr }],
    )
    .await;

    let (a_ctx, b_ctx) = (a.ctx.clone(), b.ctx.clone());
    wait_until("route exchange", Duration::from_secs(5), move || {
        !a_ctx.routes.routes_for("corp", None).is_empty()
            && !b_ctx.routes.routes_for("corp", None).is_empty()
    })
    .await;

    (a, b)
}

#[tokio::test]
async fn test_basic_forwarding() {
    let (a, b) = connected_pair().await;

    let packet = ipv4_packet([10, 42, 0, 1], [10, 42, 0, 2], b"ping from a");
    assert!(a.corp.inject(&packet).await);

    let delivered = b
        .corp
        .next_timeout(Duration::from_secs(1))
        .await
        .expect("packet should arrive at B within 1s");
    assert_eq!(delivered.as_ref(), packet.as_slice());

    // And the reverse direction, over the same session.
    let reply = ipv4_packet([10, 42, 0, 2], [10, 42, 0, 1], b"pong from b");
    assert!(b.corp.inject(&reply).await);
    let delivered = a
        .corp
        .next_timeout(Duration::from_secs(1))
        .await
        .expect("reply should arrive at A within 1s");
    assert_eq!(delivered.as_ref(), reply.as_slice());
}

#[tokio::test]
async fn test_route_withdrawal() {
    let (a, b) = connected_pair().await;

    // A withdraws its corp prefix from B.
    let (_, session) = a.ctx.registry.all().pop().expect("A has a session");
    session
        .send_control(&ControlMessage::Withdraw {
            network: "corp".to_string(),
            prefix: CORP_PREFIX.to_string(),
        })
        .await
        .unwrap();

    let b_ctx = b.ctx.clone();
    wait_until("withdrawal to apply", Duration::from_millis(500), move || {
        b_ctx
            .routes
            .routes_for("corp", None)
            .iter()
            .all(|r| r.prefix != CORP_PREFIX)
    })
    .await;

    // Admin `routes` on B no longer lists the prefix.
    let (response, _) = vibepn_core::admin::handle_command(&b.ctx, "routes").await;
    let routes = response.output.unwrap();
    assert!(routes
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["prefix"] != CORP_PREFIX));

    // Packets from B toward A now have no route and are dropped.
    let packet = ipv4_packet([10, 42, 0, 2], [10, 42, 0, 1], b"into the void");
    assert!(b.corp.inject(&packet).await);
    assert!(a.corp.next_timeout(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_simultaneous_dial_tie_break() {
    let a_addr = reserve_port();
    let b_addr = reserve_port();

    let a = start_node(
        "10.42.0.1",
        a_addr,
        &[TestPeer { name: "b", addr: b_addr }],
    )
    .await;
    let b = start_node(
        "10.42.0.2",
        b_addr,
        &[TestPeer { name: "a", addr: a_addr }],
    )
    .await;

    let (a_ctx, b_ctx) = (a.ctx.clone(), b.ctx.clone());
    wait_until("both registries settled", Duration::from_secs(5), move || {
        a_ctx.registry.len() == 1 && b_ctx.registry.len() == 1
    })
    .await;

    // Each side sees the other exactly once: no split-brain.
    assert_eq!(a.ctx.registry.all()[0].0.as_str(), b.fingerprint);
    assert_eq!(b.ctx.registry.all()[0].0.as_str(), a.fingerprint);

    // The surviving sessions carry traffic.
    let (a_ctx, b_ctx) = (a.ctx.clone(), b.ctx.clone());
    wait_until("routes on both sides", Duration::from_secs(5), move || {
        !a_ctx.routes.routes_for("corp", None).is_empty()
            && !b_ctx.routes.routes_for("corp", None).is_empty()
    })
    .await;

    let packet = ipv4_packet([10, 42, 0, 1], [10, 42, 0, 2], b"after tie-break");
    assert!(a.corp.inject(&packet).await);
    assert!(b.corp.next_timeout(Duration::from_secs(2)).await.is_some());
}

#[tokio::test]
async fn test_trust_on_first_use_rejection() {
    let b_addr = reserve_port();

    let b1 = start_node("10.42.0.2", b_addr, &[]).await;
    let first_fingerprint = b1.fingerprint.clone();

    let a = start_node(
        "10.42.0.1",
        any_port(),
        &[TestPeer { name: "b", addr: b_addr }],
    )
    .await;

    let a_ctx = a.ctx.clone();
    wait_until("first session", Duration::from_secs(5), move || {
        a_ctx.registry.len() == 1
    })
    .await;

    // B is replaced by a node with a fresh certificate on the same port.
    b1.engine.shutdown().await;
    drop(b1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let b2 = start_node("10.42.0.2", b_addr, &[]).await;
    assert_ne!(b2.fingerprint, first_fingerprint);

    // A's dials now fail the pin check: no session forms against B2.
    let a_ctx = a.ctx.clone();
    wait_until("old session to drop", Duration::from_secs(5), move || {
        a_ctx.registry.is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(a.ctx.registry.is_empty());
    assert!(b2.ctx.registry.is_empty());

    // The stored pin is still the first fingerprint.
    assert_eq!(
        a.ctx.trust.get("b").unwrap().unwrap(),
        first_fingerprint
    );
}

#[tokio::test]
async fn test_reload_announces_new_network() {
    let (a, b) = connected_pair().await;

    // A's config grows an exported `edge` network on disk.
    let mut config = Config::load(&a.ctx.config_path).unwrap();
    config.networks.insert(
        "edge".to_string(),
        NetworkConfig {
            address: "10.43.0.1".to_string(),
            prefix: "10.43.0.0/24".to_string(),
            export: true,
        },
    );
    std::fs::write(&a.ctx.config_path, toml::to_string(&config).unwrap()).unwrap();

    let session_before = a.ctx.registry.all()[0].1.connection.stable_id();

    let (response, shutdown) = vibepn_core::admin::handle_command(&a.ctx, "reload").await;
    assert_eq!(response.status, "ok", "{:?}", response.error);
    assert!(!shutdown);

    // B learns the new prefix within a second, over the existing session.
    let b_ctx = b.ctx.clone();
    wait_until("edge announcement", Duration::from_secs(1), move || {
        !b_ctx.routes.routes_for("edge", None).is_empty()
    })
    .await;

    let edge = b.ctx.routes.routes_for("edge", None);
    assert_eq!(edge[0].prefix, "10.43.0.0/24");
    assert_eq!(edge[0].peer.as_str(), a.fingerprint);

    // No session churn.
    assert_eq!(
        a.ctx.registry.all()[0].1.connection.stable_id(),
        session_before
    );
}

#[tokio::test]
async fn test_shutdown_drops_peer_and_routes() {
    let (a, b) = connected_pair().await;

    a.engine.shutdown().await;

    let b_ctx = b.ctx.clone();
    wait_until("B to notice the disconnect", Duration::from_secs(3), move || {
        b_ctx.registry.is_empty() && b_ctx.routes.all().is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_non_ipv4_packets_dropped_dispatcher_survives() {
    let (a, b) = connected_pair().await;

    // An IPv6-looking packet is dropped at A.
    let mut bogus = ipv4_packet([10, 42, 0, 1], [10, 42, 0, 2], b"v6?");
    bogus[0] = 0x60;
    assert!(a.corp.inject(&bogus).await);
    assert!(b.corp.next_timeout(Duration::from_millis(300)).await.is_none());

    // The dispatcher keeps running: a valid packet still goes through.
    let packet = ipv4_packet([10, 42, 0, 1], [10, 42, 0, 2], b"still alive");
    assert!(a.corp.inject(&packet).await);
    assert_eq!(
        b.corp
            .next_timeout(Duration::from_secs(1))
            .await
            .unwrap()
            .as_ref(),
        packet.as_slice()
    );
}

#[tokio::test]
async fn test_unknown_network_frame_does_not_kill_session() {
    let (a, b) = connected_pair().await;

    // Hand-feed B a data frame for a network it does not carry.
    let (_, session) = a.ctx.registry.all().pop().unwrap();
    let mut stream = session.connection.open_uni().await.unwrap();
    let frame = vibepn_net::DataFrame::encode("phantom", &[0x45, 1, 2, 3]).unwrap();
    stream.write_all(&frame).await.unwrap();
    stream.finish().unwrap();

    // The session stays up and corp traffic still flows.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.ctx.registry.len(), 1);

    let packet = ipv4_packet([10, 42, 0, 1], [10, 42, 0, 2], b"unaffected");
    assert!(a.corp.inject(&packet).await);
    assert!(b.corp.next_timeout(Duration::from_secs(1)).await.is_some());
}

#[tokio::test]
async fn test_admin_socket_roundtrip() {
    let (a, _b) = connected_pair().await;

    let mut stream = tokio::net::UnixStream::connect(&a.ctx.admin_socket)
        .await
        .unwrap();
    stream.write_all(br#"{"cmd": "status"}"#).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response: serde_json::Value = serde_json::from_slice(&raw).unwrap();

    assert_eq!(response["status"], "ok");
    assert_eq!(response["output"]["peers"], 1);

    // Malformed requests get an error response.
    let mut stream = tokio::net::UnixStream::connect(&a.ctx.admin_socket)
        .await
        .unwrap();
    stream.write_all(b"not json").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(response["status"], "error");
}
