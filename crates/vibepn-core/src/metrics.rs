//! Counter sink
//!
//! The core emits named counters through this seam; what serves them (a
//! metrics endpoint, logs, nothing) is the embedder's business.

use tracing::trace;

/// Receives counter increments from the core.
pub trait CounterSink: Send + Sync {
    /// Add one to the named counter.
    fn incr(&self, counter: &'static str);
}

/// Discards every counter.
pub struct NoopSink;

impl CounterSink for NoopSink {
    fn incr(&self, _counter: &'static str) {}
}

/// Emits counters as trace events.
pub struct TracingSink;

impl CounterSink for TracingSink {
    fn incr(&self, counter: &'static str) {
        trace!(counter, "counter");
    }
}

/// Counter names used by the core.
pub mod counters {
    pub const PACKETS_FORWARDED: &str = "packets_forwarded";
    pub const PACKETS_RECEIVED: &str = "packets_received";
    pub const PACKETS_DROPPED_NO_ROUTE: &str = "packets_dropped_no_route";
    pub const PACKETS_DROPPED_NO_SESSION: &str = "packets_dropped_no_session";
    pub const PACKETS_DROPPED_NOT_IPV4: &str = "packets_dropped_not_ipv4";
    pub const PACKETS_DROPPED_UNKNOWN_NETWORK: &str = "packets_dropped_unknown_network";
    pub const CONTROL_FRAMES_RECEIVED: &str = "control_frames_received";
    pub const KEEPALIVES_SENT: &str = "keepalives_sent";
    pub const SESSIONS_OPENED: &str = "sessions_opened";
    pub const SESSIONS_CLOSED: &str = "sessions_closed";
}
