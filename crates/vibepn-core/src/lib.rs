//! VibePN core runtime
//!
//! Implements the networked heart of the overlay VPN daemon:
//! - Per-peer session lifecycle (dial/accept, TOFU pinning, tie-break,
//!   keepalive, liveness, reconnect)
//! - The binary control protocol on a dedicated per-session stream
//! - The data plane: per-interface outbound dispatch and per-stream
//!   inbound demultiplexing
//! - The route table coupled to peer connectivity
//! - The local admin socket (status/peers/routes/reload/goodbye)

pub mod admin;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod forward;
pub mod liveness;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod session;

pub use config::Config;
pub use engine::{Context, Engine, EngineBuilder};
pub use error::{CoreError, CoreResult};
pub use liveness::LivenessTracker;
pub use metrics::{CounterSink, NoopSink, TracingSink};
pub use registry::{ConnectionHooks, Registry, Session};
pub use routes::{Route, RouteTable};
