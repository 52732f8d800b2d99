//! Control-protocol handlers
//!
//! Stateless with respect to transport: the session's control reader
//! decodes one frame at a time and hands it here. Liveness is marked by
//! the reader for every frame; this module applies the message to the
//! route table and nonce map.

use tracing::{debug, info};
use vibepn_crypto::PeerId;
use vibepn_net::ControlMessage;

use crate::registry::Registry;
use crate::routes::{Route, RouteTable};

/// What the control reader should do after a message.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading frames
    Continue,
    /// The peer said Goodbye; close the session gracefully
    Goodbye,
}

/// Apply one control message from `peer`.
pub fn handle(registry: &Registry, routes: &RouteTable, peer: &PeerId, message: ControlMessage) -> Flow {
    match message {
        ControlMessage::Hello { nonce } => {
            info!(peer = %peer, nonce, "received hello");
            registry.store_nonce(peer, nonce);
            Flow::Continue
        }
        ControlMessage::Announce { network, routes: announced } => {
            info!(peer = %peer, network, count = announced.len(), "received route-announce");
            for entry in announced {
                routes.add(Route {
                    network: network.clone(),
                    prefix: entry.prefix,
                    peer: peer.clone(),
                    metric: entry.metric,
                    expires_at: None,
                });
            }
            Flow::Continue
        }
        ControlMessage::Withdraw { network, prefix } => {
            info!(peer = %peer, network, prefix, "received route-withdraw");
            routes.remove(&network, &prefix);
            Flow::Continue
        }
        ControlMessage::Keepalive { unix_secs } => {
            debug!(peer = %peer, unix_secs, "received keepalive");
            Flow::Continue
        }
        ControlMessage::Goodbye => {
            info!(peer = %peer, "received goodbye");
            Flow::Goodbye
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use vibepn_net::AnnouncedRoute;

    fn peer(hex: &str) -> PeerId {
        PeerId::from_hex(hex)
    }

    #[test]
    fn test_hello_records_nonce() {
        let registry = Registry::new();
        let routes = RouteTable::new();

        let flow = handle(
            &registry,
            &routes,
            &peer("aa"),
            ControlMessage::Hello { nonce: 77 },
        );
        assert_eq!(flow, Flow::Continue);
        assert_eq!(registry.peer_nonce(&peer("aa")), Some(77));
    }

    #[test]
    fn test_announce_adds_routes_for_peer() {
        let registry = Registry::new();
        let routes = RouteTable::new();

        handle(
            &registry,
            &routes,
            &peer("aa"),
            ControlMessage::Announce {
                network: "corp".to_string(),
                routes: vec![
                    AnnouncedRoute { prefix: "10.42.0.0/24".to_string(), metric: 1 },
                    AnnouncedRoute { prefix: "10.43.0.0/24".to_string(), metric: 2 },
                ],
            },
        );

        assert_eq!(routes.all().len(), 2);
        let hit = routes.lookup("corp", Ipv4Addr::new(10, 42, 0, 9)).unwrap();
        assert_eq!(hit.peer, peer("aa"));
        assert_eq!(hit.metric, 1);
    }

    #[test]
    fn test_withdraw_removes_prefix() {
        let registry = Registry::new();
        let routes = RouteTable::new();

        handle(
            &registry,
            &routes,
            &peer("aa"),
            ControlMessage::Announce {
                network: "corp".to_string(),
                routes: vec![AnnouncedRoute { prefix: "10.42.0.0/24".to_string(), metric: 1 }],
            },
        );
        handle(
            &registry,
            &routes,
            &peer("aa"),
            ControlMessage::Withdraw {
                network: "corp".to_string(),
                prefix: "10.42.0.0/24".to_string(),
            },
        );

        assert!(routes.all().is_empty());
    }

    #[test]
    fn test_goodbye_signals_close() {
        let registry = Registry::new();
        let routes = RouteTable::new();

        let flow = handle(&registry, &routes, &peer("aa"), ControlMessage::Goodbye);
        assert_eq!(flow, Flow::Goodbye);
    }

    #[test]
    fn test_keepalive_is_continue() {
        let registry = Registry::new();
        let routes = RouteTable::new();

        let flow = handle(
            &registry,
            &routes,
            &peer("aa"),
            ControlMessage::Keepalive { unix_secs: 1_700_000_000 },
        );
        assert_eq!(flow, Flow::Continue);
    }
}
