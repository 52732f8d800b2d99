//! Linux TUN device
//!
//! Backs a [`PacketInterface`] with a kernel TUN device. Device names are
//! `vibepn-` plus a short identity-derived suffix so several nodes on one
//! host stay distinguishable.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{NetError, NetResult};
use crate::iface::PacketInterface;
use crate::wire::MAX_PACKET_SIZE;

/// A TUN-backed packet interface.
pub struct TunInterface {
    device: Mutex<tun::AsyncDevice>,
    name: String,
}

/// Derive the device name for a node: `vibepn-` + first 6 hex chars of the
/// node fingerprint.
pub fn device_name(node_fingerprint: &str) -> String {
    let suffix: String = node_fingerprint.chars().take(6).collect();
    format!("vibepn-{suffix}")
}

impl TunInterface {
    /// Create and bring up a TUN device with the given address.
    pub fn open(name: &str, address: Ipv4Addr, netmask: Ipv4Addr, mtu: u16) -> NetResult<Self> {
        let mut config = tun::Configuration::default();
        config
            .name(name)
            .address(address)
            .netmask(netmask)
            .mtu(mtu as i32)
            .up();

        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| NetError::Tun(format!("create {name}: {e}")))?;

        info!(device = name, %address, %netmask, "TUN device up");

        Ok(Self {
            device: Mutex::new(device),
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl PacketInterface for TunInterface {
    async fn recv(&self) -> NetResult<Bytes> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut device = self.device.lock().await;
        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetError::Tun(format!("read {}: {e}", self.name)))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn send(&self, packet: &[u8]) -> NetResult<()> {
        let mut device = self.device.lock().await;
        device
            .write_all(packet)
            .await
            .map_err(|e| NetError::Tun(format!("write {}: {e}", self.name)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_suffix() {
        let fp = "ab12cd34ef567890";
        assert_eq!(device_name(fp), "vibepn-ab12cd");
    }
}
