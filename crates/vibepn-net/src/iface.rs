//! Packet interface abstraction
//!
//! A packet interface is an opaque full-duplex device bound to one overlay
//! network: `recv` yields one IP datagram per call, `send` accepts one.
//! The core never parses packets beyond the IPv4 destination field.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetError, NetResult};

/// A full-duplex layer-3 device yielding and accepting IP datagrams.
#[async_trait]
pub trait PacketInterface: Send + Sync {
    /// Read one IP datagram.
    async fn recv(&self) -> NetResult<Bytes>;

    /// Write one IP datagram.
    async fn send(&self, packet: &[u8]) -> NetResult<()>;

    /// Device name, for logging.
    fn name(&self) -> &str;
}

/// An in-memory packet interface backed by channel pairs.
///
/// What the handle injects, the interface `recv`s; what the interface
/// `send`s, the handle collects. Used by the test suites and available to
/// embedders that source packets from somewhere other than a TUN device.
pub struct MemoryInterface {
    name: String,
    incoming: Mutex<mpsc::Receiver<Bytes>>,
    outgoing: mpsc::Sender<Bytes>,
}

/// The host side of a [`MemoryInterface`].
pub struct MemoryHandle {
    inject: mpsc::Sender<Bytes>,
    collect: Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryInterface {
    /// Create an interface and its host-side handle.
    pub fn pair(name: impl Into<String>) -> (Self, MemoryHandle) {
        let (inject, incoming) = mpsc::channel(64);
        let (outgoing, collect) = mpsc::channel(64);

        let iface = Self {
            name: name.into(),
            incoming: Mutex::new(incoming),
            outgoing,
        };
        let handle = MemoryHandle {
            inject,
            collect: Mutex::new(collect),
        };
        (iface, handle)
    }
}

#[async_trait]
impl PacketInterface for MemoryInterface {
    async fn recv(&self) -> NetResult<Bytes> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| NetError::InterfaceClosed(self.name.clone()))
    }

    async fn send(&self, packet: &[u8]) -> NetResult<()> {
        self.outgoing
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| NetError::InterfaceClosed(self.name.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MemoryHandle {
    /// Feed a datagram into the interface, as the host network stack would.
    pub async fn inject(&self, packet: &[u8]) -> bool {
        self.inject.send(Bytes::copy_from_slice(packet)).await.is_ok()
    }

    /// Take the next datagram the core wrote to the interface.
    pub async fn next(&self) -> Option<Bytes> {
        self.collect.lock().await.recv().await
    }

    /// Take the next datagram, giving up after `timeout`.
    pub async fn next_timeout(&self, timeout: std::time::Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }
}

/// IP packet parsing helpers.
pub mod ip {
    use std::net::Ipv4Addr;

    /// Whether the packet's version nibble says IPv4.
    pub fn is_ipv4(packet: &[u8]) -> bool {
        !packet.is_empty() && packet[0] >> 4 == 4
    }

    /// Destination address of an IPv4 packet.
    pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < 20 || !is_ipv4(packet) {
            return None;
        }
        Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
    }

    /// Source address of an IPv4 packet.
    pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
        if packet.len() < 20 || !is_ipv4(packet) {
            return None;
        }
        Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
    }
}
