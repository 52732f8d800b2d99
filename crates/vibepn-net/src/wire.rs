//! Wire format
//!
//! Control frames (on the per-session control stream):
//! `u16 length (BE) | tag | body`, with `length` in `[1, 4096]`.
//!
//! | tag | message        | body |
//! |-----|----------------|------|
//! | `H` | Hello          | `u64 nonce (BE)` |
//! | `A` | Route-Announce | `u8 netLen | netName | (u8 prefixLen | prefix | u16 metric)+` |
//! | `W` | Route-Withdraw | `u8 netLen | netName | u8 prefixLen | prefix` |
//! | `K` | Keepalive      | `u64 unix-seconds (BE)` |
//! | `G` | Goodbye        | empty |
//!
//! Data frames (on data streams, repeatable until stream close):
//! `u8 netLen | netName | u16 pktLen (BE) | pkt`, `netLen >= 1`,
//! `pktLen >= 1`. Embedding the network name per frame lets the receiver
//! demultiplex to the right interface without per-stream negotiation.
//!
//! Prefixes travel as opaque CIDR text; the codec does not interpret them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, NetResult};

/// Maximum control frame payload length.
pub const MAX_CONTROL_FRAME: usize = 4096;

/// Maximum IP datagram read from a local interface.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Control type tags.
const TAG_HELLO: u8 = b'H';
const TAG_ANNOUNCE: u8 = b'A';
const TAG_WITHDRAW: u8 = b'W';
const TAG_KEEPALIVE: u8 = b'K';
const TAG_GOODBYE: u8 = b'G';

/// One announced route tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedRoute {
    /// CIDR prefix as text, e.g. `10.42.0.0/24`
    pub prefix: String,
    /// Route metric
    pub metric: u16,
}

/// A control-stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Session greeting carrying the tie-break nonce
    Hello { nonce: u64 },
    /// One or more route announcements for a network
    Announce {
        network: String,
        routes: Vec<AnnouncedRoute>,
    },
    /// Withdraw a single prefix from a network
    Withdraw { network: String, prefix: String },
    /// Liveness beacon with the sender's unix timestamp
    Keepalive { unix_secs: u64 },
    /// Graceful session teardown
    Goodbye,
}

fn put_name(buf: &mut BytesMut, name: &str) -> NetResult<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(NetError::InvalidNameLength(name.len()));
    }
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn put_prefix(buf: &mut BytesMut, prefix: &str) -> NetResult<()> {
    if prefix.is_empty() || prefix.len() > 255 {
        return Err(NetError::InvalidPrefixLength(prefix.len()));
    }
    buf.put_u8(prefix.len() as u8);
    buf.put_slice(prefix.as_bytes());
    Ok(())
}

fn take_name(buf: &mut Bytes, what: &'static str) -> NetResult<String> {
    if buf.remaining() < 1 {
        return Err(NetError::Truncated(what));
    }
    let len = buf.get_u8() as usize;
    if len == 0 {
        return Err(NetError::InvalidNameLength(0));
    }
    if buf.remaining() < len {
        return Err(NetError::Truncated(what));
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| NetError::InvalidName)
}

impl ControlMessage {
    /// Encode the message as a length-prefixed frame.
    pub fn encode(&self) -> NetResult<Bytes> {
        let mut payload = BytesMut::with_capacity(64);

        match self {
            ControlMessage::Hello { nonce } => {
                payload.put_u8(TAG_HELLO);
                payload.put_u64(*nonce);
            }
            ControlMessage::Announce { network, routes } => {
                if routes.is_empty() {
                    return Err(NetError::EmptyAnnounce);
                }
                payload.put_u8(TAG_ANNOUNCE);
                put_name(&mut payload, network)?;
                for route in routes {
                    put_prefix(&mut payload, &route.prefix)?;
                    payload.put_u16(route.metric);
                }
            }
            ControlMessage::Withdraw { network, prefix } => {
                payload.put_u8(TAG_WITHDRAW);
                put_name(&mut payload, network)?;
                put_prefix(&mut payload, prefix)?;
            }
            ControlMessage::Keepalive { unix_secs } => {
                payload.put_u8(TAG_KEEPALIVE);
                payload.put_u64(*unix_secs);
            }
            ControlMessage::Goodbye => {
                payload.put_u8(TAG_GOODBYE);
            }
        }

        if payload.len() > MAX_CONTROL_FRAME {
            return Err(NetError::InvalidFrameLength(payload.len()));
        }

        let mut frame = BytesMut::with_capacity(2 + payload.len());
        frame.put_u16(payload.len() as u16);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode a control frame payload (the bytes after the length prefix).
    pub fn decode_payload(payload: Bytes) -> NetResult<Self> {
        let mut buf = payload;
        if buf.is_empty() {
            return Err(NetError::InvalidFrameLength(0));
        }

        let tag = buf.get_u8();
        match tag {
            TAG_HELLO => {
                if buf.remaining() != 8 {
                    return Err(NetError::Truncated("hello"));
                }
                Ok(ControlMessage::Hello { nonce: buf.get_u64() })
            }
            TAG_ANNOUNCE => {
                let network = take_name(&mut buf, "route-announce")?;
                let mut routes = Vec::new();
                while buf.has_remaining() {
                    let prefix = take_name(&mut buf, "route-announce")?;
                    if buf.remaining() < 2 {
                        return Err(NetError::Truncated("route-announce"));
                    }
                    let metric = buf.get_u16();
                    routes.push(AnnouncedRoute { prefix, metric });
                }
                if routes.is_empty() {
                    return Err(NetError::EmptyAnnounce);
                }
                Ok(ControlMessage::Announce { network, routes })
            }
            TAG_WITHDRAW => {
                let network = take_name(&mut buf, "route-withdraw")?;
                let prefix = take_name(&mut buf, "route-withdraw")?;
                if buf.has_remaining() {
                    return Err(NetError::Truncated("route-withdraw"));
                }
                Ok(ControlMessage::Withdraw { network, prefix })
            }
            TAG_KEEPALIVE => {
                if buf.remaining() != 8 {
                    return Err(NetError::Truncated("keepalive"));
                }
                Ok(ControlMessage::Keepalive { unix_secs: buf.get_u64() })
            }
            TAG_GOODBYE => {
                if buf.has_remaining() {
                    return Err(NetError::Truncated("goodbye"));
                }
                Ok(ControlMessage::Goodbye)
            }
            other => Err(NetError::UnknownControlType(other)),
        }
    }

    /// Read one control frame from the stream.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before a frame
    /// starts. An EOF inside a frame is an error.
    pub async fn read<R>(reader: &mut R) -> NetResult<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 2];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = u16::from_be_bytes(len_buf) as usize;
        if length == 0 || length > MAX_CONTROL_FRAME {
            return Err(NetError::InvalidFrameLength(length));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Self::decode_payload(Bytes::from(payload)).map(Some)
    }

    /// Write the message as one frame.
    pub async fn write<W>(&self, writer: &mut W) -> NetResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode()?;
        writer.write_all(&frame).await?;
        Ok(())
    }
}

/// A data-plane frame: one IP packet bound to a named overlay network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Overlay network the packet belongs to
    pub network: String,
    /// The IP datagram, verbatim
    pub packet: Bytes,
}

impl DataFrame {
    /// Encode one data frame.
    pub fn encode(network: &str, packet: &[u8]) -> NetResult<Bytes> {
        if network.is_empty() || network.len() > 255 {
            return Err(NetError::InvalidNameLength(network.len()));
        }
        if packet.is_empty() || packet.len() > 0xFFFF {
            return Err(NetError::InvalidPacketLength(packet.len()));
        }

        let mut buf = BytesMut::with_capacity(1 + network.len() + 2 + packet.len());
        buf.put_u8(network.len() as u8);
        buf.put_slice(network.as_bytes());
        buf.put_u16(packet.len() as u16);
        buf.put_slice(packet);
        Ok(buf.freeze())
    }

    /// Read one data frame from the stream.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. An EOF
    /// mid-frame is an error; the caller abandons the stream and drops
    /// the partial frame.
    pub async fn read<R>(reader: &mut R) -> NetResult<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let net_len = match reader.read_u8().await {
            Ok(n) => n as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if net_len == 0 {
            return Err(NetError::InvalidNameLength(0));
        }

        let mut name = vec![0u8; net_len];
        reader.read_exact(&mut name).await?;
        let network = String::from_utf8(name).map_err(|_| NetError::InvalidName)?;

        let pkt_len = reader.read_u16().await? as usize;
        if pkt_len == 0 {
            return Err(NetError::InvalidPacketLength(0));
        }

        let mut packet = vec![0u8; pkt_len];
        reader.read_exact(&mut packet).await?;

        Ok(Some(Self {
            network,
            packet: Bytes::from(packet),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(msg: ControlMessage) -> ControlMessage {
        let frame = msg.encode().unwrap();
        let mut reader = frame.as_ref();
        ControlMessage::read(&mut reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_hello_roundtrip() {
        let msg = ControlMessage::Hello { nonce: 0xDEAD_BEEF_CAFE_F00D };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_announce_roundtrip() {
        let msg = ControlMessage::Announce {
            network: "corp".to_string(),
            routes: vec![
                AnnouncedRoute { prefix: "10.42.0.0/24".to_string(), metric: 1 },
                AnnouncedRoute { prefix: "10.43.0.0/16".to_string(), metric: 5 },
            ],
        };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_withdraw_roundtrip() {
        let msg = ControlMessage::Withdraw {
            network: "corp".to_string(),
            prefix: "10.42.0.0/24".to_string(),
        };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_keepalive_roundtrip() {
        let msg = ControlMessage::Keepalive { unix_secs: 1_700_000_000 };
        assert_eq!(roundtrip(msg.clone()).await, msg);
    }

    #[tokio::test]
    async fn test_goodbye_roundtrip() {
        assert_eq!(roundtrip(ControlMessage::Goodbye).await, ControlMessage::Goodbye);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let bytes: &[u8] = &[0x00, 0x00];
        let mut reader = bytes;
        let err = ControlMessage::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidFrameLength(0)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        // Length prefix claims 4097 bytes.
        let bytes: &[u8] = &[0x10, 0x01];
        let mut reader = bytes;
        let err = ControlMessage::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidFrameLength(4097)));
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let bytes: &[u8] = &[];
        let mut reader = bytes;
        assert!(ControlMessage::read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_error() {
        // Claims 10 payload bytes, delivers 3.
        let bytes: &[u8] = &[0x00, 0x0A, b'H', 0x01, 0x02];
        let mut reader = bytes;
        assert!(ControlMessage::read(&mut reader).await.is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = ControlMessage::decode_payload(Bytes::from_static(b"Zjunk")).unwrap_err();
        assert!(matches!(err, NetError::UnknownControlType(b'Z')));
    }

    #[test]
    fn test_short_hello_rejected() {
        let err = ControlMessage::decode_payload(Bytes::from_static(b"H\x01\x02")).unwrap_err();
        assert!(matches!(err, NetError::Truncated("hello")));
    }

    #[test]
    fn test_truncated_announce_tuple_rejected() {
        // network "a", then prefix "10.0.0.0/8" but only one metric byte.
        let mut payload = vec![b'A', 1, b'a'];
        let prefix = b"10.0.0.0/8";
        payload.push(prefix.len() as u8);
        payload.extend_from_slice(prefix);
        payload.push(0x00);
        let err = ControlMessage::decode_payload(Bytes::from(payload)).unwrap_err();
        assert!(matches!(err, NetError::Truncated("route-announce")));
    }

    #[test]
    fn test_announce_without_routes_rejected() {
        let payload = vec![b'A', 4, b'c', b'o', b'r', b'p'];
        let err = ControlMessage::decode_payload(Bytes::from(payload)).unwrap_err();
        assert!(matches!(err, NetError::EmptyAnnounce));
    }

    #[tokio::test]
    async fn test_data_frame_roundtrip() {
        let packet = vec![0x45, 0x00, 0x00, 0x1c, 0xAB, 0xCD];
        let frame = DataFrame::encode("corp", &packet).unwrap();
        let mut reader = frame.as_ref();
        let decoded = DataFrame::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.network, "corp");
        assert_eq!(decoded.packet.as_ref(), packet.as_slice());
        // Stream ends cleanly after the frame.
        assert!(DataFrame::read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_frames_share_a_stream() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&DataFrame::encode("corp", &[1, 2, 3]).unwrap());
        buf.extend_from_slice(&DataFrame::encode("edge", &[4, 5]).unwrap());

        let mut reader = buf.as_slice();
        let first = DataFrame::read(&mut reader).await.unwrap().unwrap();
        let second = DataFrame::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.network, "corp");
        assert_eq!(second.network, "edge");
        assert!(DataFrame::read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_frame_boundaries() {
        // Longest name, longest packet.
        let name = "n".repeat(255);
        let packet = vec![0xAA; 0xFFFF];
        let frame = DataFrame::encode(&name, &packet).unwrap();
        let mut reader = frame.as_ref();
        let decoded = DataFrame::read(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.network, name);
        assert_eq!(decoded.packet.len(), 0xFFFF);

        assert!(DataFrame::encode("", &[1]).is_err());
        assert!(DataFrame::encode(&"n".repeat(256), &[1]).is_err());
        assert!(DataFrame::encode("corp", &[]).is_err());
        assert!(DataFrame::encode("corp", &vec![0u8; 0x10000]).is_err());
    }

    #[tokio::test]
    async fn test_data_frame_zero_packet_length_rejected() {
        // netLen=1, name "c", pktLen=0.
        let bytes: &[u8] = &[0x01, b'c', 0x00, 0x00];
        let mut reader = bytes;
        let err = DataFrame::read(&mut reader).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidPacketLength(0)));
    }

    #[tokio::test]
    async fn test_data_frame_eof_mid_frame_is_error() {
        let frame = DataFrame::encode("corp", &[1, 2, 3, 4]).unwrap();
        let truncated = &frame[..frame.len() - 2];
        let mut reader = truncated;
        assert!(DataFrame::read(&mut reader).await.is_err());
    }
}
