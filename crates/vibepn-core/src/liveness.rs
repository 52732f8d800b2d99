//! Peer liveness tracking
//!
//! Last-seen timestamps per peer, updated on every observed control-plane
//! frame. A background sweeper removes peers that have been silent longer
//! than the timeout and purges their routes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::warn;
use vibepn_crypto::PeerId;

use crate::routes::RouteTable;

/// How often the sweeper checks for silent peers.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence tolerance before a peer is declared dead.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One peer's liveness, as reported by the admin surface.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub id: PeerId,
    pub last_seen: DateTime<Utc>,
}

struct Seen {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Tracks when each peer was last heard from.
pub struct LivenessTracker {
    timeout: Duration,
    peers: Mutex<HashMap<PeerId, Seen>>,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record control-plane activity from a peer.
    pub fn mark_alive(&self, peer: &PeerId) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(
            peer.clone(),
            Seen {
                at: Instant::now(),
                wall: Utc::now(),
            },
        );
    }

    /// Snapshot of every tracked peer.
    pub fn list(&self) -> Vec<PeerStatus> {
        let peers = self.peers.lock().unwrap();
        peers
            .iter()
            .map(|(id, seen)| PeerStatus {
                id: id.clone(),
                last_seen: seen.wall,
            })
            .collect()
    }

    /// Remove peers silent for longer than the timeout and purge their
    /// routes. Returns the expired identities.
    pub fn expire_stale(&self, routes: &RouteTable) -> Vec<PeerId> {
        let now = Instant::now();
        let expired: Vec<PeerId> = {
            let mut peers = self.peers.lock().unwrap();
            let dead: Vec<PeerId> = peers
                .iter()
                .filter(|(_, seen)| now.duration_since(seen.at) > self.timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                peers.remove(id);
            }
            dead
        };

        for peer in &expired {
            warn!(peer = %peer, "peer considered dead, dropping its routes");
            routes.remove_by_peer(peer);
        }
        expired
    }

    /// Start the background sweeper.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        routes: Arc<RouteTable>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracker.expire_stale(&routes);
            }
        })
    }
}
