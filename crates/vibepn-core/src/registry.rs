//! Peer registry
//!
//! The authoritative map of peer identity → active session. At most one
//! session exists per peer; simultaneous dials are resolved with the
//! tie-break nonces exchanged in Hello. The registry spawns a watcher per
//! installed session that removes the mapping when that exact session
//! closes, and notifies the supervisor through [`ConnectionHooks`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vibepn_crypto::PeerId;
use vibepn_net::transport::STREAM_OPEN_TIMEOUT;
use vibepn_net::ControlMessage;

use crate::error::{CoreError, CoreResult};

/// Application close codes.
pub mod close {
    use quinn::VarInt;

    /// Framing violation or malformed control message
    pub const PROTOCOL: VarInt = VarInt::from_u32(1);
    /// Lost the duplicate-session tie-break
    pub const DUPLICATE: VarInt = VarInt::from_u32(2);
    /// Peer sent Goodbye
    pub const GOODBYE: VarInt = VarInt::from_u32(3);
    /// Local shutdown
    pub const SHUTDOWN: VarInt = VarInt::from_u32(4);
}

/// Shared handle to a session's control-stream send half. Installed once
/// the control stream is established; `None` before that.
pub type ControlHandle = Arc<AsyncMutex<Option<quinn::SendStream>>>;

/// An active authenticated session to one peer.
#[derive(Clone)]
pub struct Session {
    /// The underlying QUIC connection; closing it cancels every child
    /// stream and task.
    pub connection: quinn::Connection,
    /// Local tie-break nonce sent in our Hello
    pub local_nonce: u64,
    /// When the session was opened
    pub opened_at: Instant,
    /// Send half of the control stream
    pub control: ControlHandle,
}

impl Session {
    pub fn new(connection: quinn::Connection, local_nonce: u64) -> Self {
        Self {
            connection,
            local_nonce,
            opened_at: Instant::now(),
            control: Arc::new(AsyncMutex::new(None)),
        }
    }

    /// Remote transport address.
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Write one control message on the session's control stream.
    pub async fn send_control(&self, message: &ControlMessage) -> CoreResult<()> {
        let mut guard = self.control.lock().await;
        let stream = guard.as_mut().ok_or(CoreError::ControlUnavailable)?;
        message.write(stream).await?;
        Ok(())
    }
}

/// Supervisor-side notifications for session lifecycle.
pub trait ConnectionHooks: Send + Sync {
    /// A session was installed for a peer.
    fn on_connect(&self, peer: &PeerId, session: &Session);
    /// A peer's last session closed and was removed.
    fn on_disconnect(&self, peer: &PeerId);
}

/// Outcome of the duplicate-session duel.
#[derive(Debug, PartialEq, Eq)]
enum Duel {
    /// Keep the existing session; close the incoming one
    KeepExisting(&'static str),
    /// The incoming session wins; close the existing one
    ReplaceExisting,
}

/// Decide a duplicate-session duel. `local_nonce` belongs to the incoming
/// session, `peer_nonce` is the last nonce observed from the peer. The
/// lower nonce wins; with no peer nonce yet, or on equality, the incoming
/// session loses. Both sides evaluate the same pair and converge.
fn duel(local_nonce: u64, peer_nonce: Option<u64>) -> Duel {
    match peer_nonce {
        None => Duel::KeepExisting("duplicate connection (no peer nonce)"),
        Some(peer) if local_nonce < peer => Duel::ReplaceExisting,
        Some(_) => Duel::KeepExisting("duplicate connection (lost tie-break)"),
    }
}

/// Peer identity → active session.
pub struct Registry {
    sessions: RwLock<HashMap<PeerId, Session>>,
    /// Last observed nonce per peer, used only for tie-break.
    nonces: Mutex<HashMap<PeerId, u64>>,
    hooks: RwLock<Option<Arc<dyn ConnectionHooks>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
            hooks: RwLock::new(None),
        }
    }

    /// Install the supervisor's lifecycle hooks.
    pub fn set_hooks(&self, hooks: Arc<dyn ConnectionHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    /// Record the last observed tie-break nonce for a peer.
    pub fn store_nonce(&self, peer: &PeerId, nonce: u64) {
        self.nonces.lock().unwrap().insert(peer.clone(), nonce);
    }

    /// The last observed tie-break nonce for a peer.
    pub fn peer_nonce(&self, peer: &PeerId) -> Option<u64> {
        self.nonces.lock().unwrap().get(peer).copied()
    }

    /// Install a session for a peer, resolving duplicates by tie-break.
    ///
    /// The losing session is closed with [`close::DUPLICATE`]. A watcher
    /// is spawned for every installed session; it removes the mapping
    /// when that exact session terminates.
    pub fn add(self: &Arc<Self>, peer: PeerId, session: Session) {
        {
            let mut sessions = self.sessions.write().unwrap();

            if let Some(existing) = sessions.get(&peer) {
                match duel(session.local_nonce, self.peer_nonce(&peer)) {
                    Duel::KeepExisting(reason) => {
                        warn!(peer = %peer, reason, "closing duplicate session");
                        session.connection.close(close::DUPLICATE, reason.as_bytes());
                        return;
                    }
                    Duel::ReplaceExisting => {
                        warn!(peer = %peer, "duplicate session, replacing loser of tie-break");
                        existing
                            .connection
                            .close(close::DUPLICATE, b"duplicate connection (lost tie-break)");
                    }
                }
            }

            sessions.insert(peer.clone(), session.clone());
            info!(peer = %peer, remote = %session.remote_address(), "registered session");
        }

        if let Some(hooks) = self.hooks.read().unwrap().clone() {
            hooks.on_connect(&peer, &session);
        }

        let registry = Arc::clone(self);
        let connection = session.connection.clone();
        tokio::spawn(async move {
            let reason = connection.closed().await;
            debug!(peer = %peer, %reason, "session ended");
            registry.remove_if_same(&peer, connection.stable_id());
        });
    }

    /// Remove the mapping for `peer` only if the stored session is the
    /// one that closed. Protects a fast reconnect from being removed by
    /// its predecessor's watcher.
    fn remove_if_same(&self, peer: &PeerId, stable_id: usize) {
        let removed = {
            let mut sessions = self.sessions.write().unwrap();
            match sessions.get(peer) {
                Some(current) if current.connection.stable_id() == stable_id => {
                    sessions.remove(peer);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!(peer = %peer, "removed session");
            if let Some(hooks) = self.hooks.read().unwrap().clone() {
                hooks.on_disconnect(peer);
            }
        } else {
            debug!(peer = %peer, "closed session was already superseded");
        }
    }

    /// The active session for a peer.
    pub fn get(&self, peer: &PeerId) -> Option<Session> {
        self.sessions.read().unwrap().get(peer).cloned()
    }

    /// Snapshot of every active session.
    pub fn all(&self) -> Vec<(PeerId, Session)> {
        self.sessions
            .read()
            .unwrap()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Say Goodbye to every peer and tear the sessions down.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(PeerId, Session)> = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.drain().collect()
        };

        for (peer, session) in drained {
            match timeout(STREAM_OPEN_TIMEOUT, session.connection.open_uni()).await {
                Ok(Ok(mut stream)) => {
                    if let Err(e) = ControlMessage::Goodbye.write(&mut stream).await {
                        warn!(peer = %peer, error = %e, "failed to send goodbye");
                    }
                    let _ = stream.finish();
                }
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "failed to open goodbye stream");
                }
                Err(_) => {
                    warn!(peer = %peer, "goodbye stream open timed out");
                }
            }

            session.connection.close(close::SHUTDOWN, b"shutdown");
            info!(peer = %peer, "disconnected");
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
