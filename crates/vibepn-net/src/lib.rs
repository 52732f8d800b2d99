//! VibePN networking primitives
//!
//! - Control-message and data-frame wire codec
//! - QUIC transport helpers (listen, dial, stream opens with deadlines)
//! - Packet-interface abstraction over local layer-3 devices

pub mod error;
pub mod iface;
pub mod transport;
pub mod wire;

#[cfg(target_os = "linux")]
pub mod tun;

pub use error::{NetError, NetResult};
pub use iface::{MemoryHandle, MemoryInterface, PacketInterface};
pub use wire::{AnnouncedRoute, ControlMessage, DataFrame};
