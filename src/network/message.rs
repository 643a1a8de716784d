//! Wire packets for the peer protocol
//!
//! Every packet travels as `header || body`. The header carries the network
//! identifier, a command code and the body length (see
//! [`crate::network::server::PacketCodec`]). Only the handshake, liveness,
//! peer-exchange and disconnect packets are understood here; every other
//! command is passed through as an opaque body for an external handler.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Size of the fixed packet header: network id (4) + command (4) + length (4)
pub const HEADER_SIZE: usize = 12;

/// Upper bound on endpoints carried by a single REQUESTPEERSRESP
pub const MAX_PEERS_PER_PACKET: usize = 1000;

/// Command codes of the core protocol
pub mod command {
    pub const VERSION: u32 = 0x01;
    pub const VERACK: u32 = 0x02;
    pub const NETPING: u32 = 0x03;
    pub const NETPONG: u32 = 0x04;
    pub const REQUESTPEERS: u32 = 0x05;
    pub const REQUESTPEERSRESP: u32 = 0x06;
    pub const DISCONNECT: u32 = 0x07;

    /// Commands below this value are reserved for the network layer
    pub const FIRST_OPAQUE: u32 = 0x100;

    /// Human readable name for logging
    pub fn name(code: u32) -> &'static str {
        match code {
            VERSION => "VERSION",
            VERACK => "VERACK",
            NETPING => "NETPING",
            NETPONG => "NETPONG",
            REQUESTPEERS => "REQUESTPEERS",
            REQUESTPEERSRESP => "REQUESTPEERSRESP",
            DISCONNECT => "DISCONNECT",
            _ => "OPAQUE",
        }
    }
}

/// Framing and body decoding errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Wrong network id: expected {expected:#010x}, got {got:#010x}")]
    WrongNetwork { expected: u32, got: u32 },
    #[error("Packet too large: {size} bytes (max: {max})")]
    Oversized { size: usize, max: usize },
    #[error("Malformed body for command {command:#x}: {reason}")]
    Malformed { command: u32, reason: String },
}

bitflags::bitflags! {
    /// Services a node advertises in VERSION
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceFlags: u64 {
        /// Serves full blocks and transactions
        const FULL_NODE = 1 << 0;
        /// Answers REQUESTPEERS
        const PEER_EXCHANGE = 1 << 1;
        /// Accepts inbound connections from the internet
        const PUBLIC = 1 << 2;
        /// Acts as a bootstrap node
        const BOOTSTRAP = 1 << 3;
    }
}

/// Reason codes carried by DISCONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    Requested = 0,
    InboundFull = 1,
    OutboundFull = 2,
    ConnectingFull = 3,
    FeelersFull = 4,
    HandshakeFailed = 5,
    ProtocolViolation = 6,
    Timeout = 7,
    Duplicate = 8,
    SelfConnection = 9,
    FeelerDone = 10,
    Shutdown = 11,
    Unresponsive = 12,
    BootstrapDone = 13,
}

impl DisconnectReason {
    pub fn from_code(code: u8) -> Option<Self> {
        use DisconnectReason::*;
        let reason = match code {
            0 => Requested,
            1 => InboundFull,
            2 => OutboundFull,
            3 => ConnectingFull,
            4 => FeelersFull,
            5 => HandshakeFailed,
            6 => ProtocolViolation,
            7 => Timeout,
            8 => Duplicate,
            9 => SelfConnection,
            10 => FeelerDone,
            11 => Shutdown,
            12 => Unresponsive,
            13 => BootstrapDone,
            _ => return None,
        };
        Some(reason)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the remote refused us for capacity rather than misbehaviour
    pub fn is_capacity(self) -> bool {
        matches!(
            self,
            DisconnectReason::InboundFull
                | DisconnectReason::OutboundFull
                | DisconnectReason::ConnectingFull
                | DisconnectReason::FeelersFull
        )
    }
}

/// First packet of the handshake, sent by both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPacket {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    /// Sender's wall clock, unix seconds
    pub timestamp: i64,
    pub chain_height: u64,
    /// Endpoint the sender accepts connections on
    pub listen_endpoint: SocketAddr,
    /// Random per-process identity, used to detect self connections
    pub node_id: u64,
    pub syncing: bool,
}

/// Handshake acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerAckPacket {
    /// Positive when the sender accepts the session
    pub counter: i32,
    /// Endpoint the sender observed for us
    pub reflected_endpoint: SocketAddr,
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Version(VersionPacket),
    VerAck(VerAckPacket),
    NetPing(u64),
    NetPong(u64),
    RequestPeers {
        /// Listening endpoint of the requester
        endpoint: SocketAddr,
        max_peers: u32,
    },
    RequestPeersResp(Vec<SocketAddr>),
    Disconnect(DisconnectReason),
    /// Ledger-level payload, opaque to the network layer
    Opaque { command: u32, body: Bytes },
}

impl Packet {
    /// Command code for the header
    pub fn command(&self) -> u32 {
        match self {
            Packet::Version(_) => command::VERSION,
            Packet::VerAck(_) => command::VERACK,
            Packet::NetPing(_) => command::NETPING,
            Packet::NetPong(_) => command::NETPONG,
            Packet::RequestPeers { .. } => command::REQUESTPEERS,
            Packet::RequestPeersResp(_) => command::REQUESTPEERSRESP,
            Packet::Disconnect(_) => command::DISCONNECT,
            Packet::Opaque { command, .. } => *command,
        }
    }

    /// Get packet type name for logging
    pub fn type_name(&self) -> &'static str {
        command::name(self.command())
    }

    /// Serialize the body (header excluded)
    pub fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Packet::Version(v) => {
                dst.put_u32(v.protocol_version);
                dst.put_u64(v.services.bits());
                dst.put_i64(v.timestamp);
                dst.put_u64(v.chain_height);
                put_endpoint(dst, &v.listen_endpoint);
                dst.put_u64(v.node_id);
                dst.put_u8(v.syncing as u8);
            }
            Packet::VerAck(ack) => {
                dst.put_i32(ack.counter);
                put_endpoint(dst, &ack.reflected_endpoint);
            }
            Packet::NetPing(nonce) | Packet::NetPong(nonce) => dst.put_u64(*nonce),
            Packet::RequestPeers {
                endpoint,
                max_peers,
            } => {
                put_endpoint(dst, endpoint);
                dst.put_u32(*max_peers);
            }
            Packet::RequestPeersResp(peers) => {
                dst.put_u32(peers.len() as u32);
                for peer in peers {
                    put_endpoint(dst, peer);
                }
            }
            Packet::Disconnect(reason) => dst.put_u8(reason.code()),
            Packet::Opaque { body, .. } => dst.put_slice(body),
        }
    }

    /// Encoded body length
    pub fn body_len(&self) -> usize {
        match self {
            Packet::Opaque { body, .. } => body.len(),
            _ => {
                let mut buf = BytesMut::new();
                self.encode_body(&mut buf);
                buf.len()
            }
        }
    }

    /// Decode a body for the given command
    pub fn decode(command: u32, mut body: Bytes) -> Result<Packet, CodecError> {
        let packet = match command {
            command::VERSION => {
                let mut r = Reader::new(command, &mut body);
                let protocol_version = r.u32()?;
                let services = ServiceFlags::from_bits_truncate(r.u64()?);
                let timestamp = r.i64()?;
                let chain_height = r.u64()?;
                let listen_endpoint = r.endpoint()?;
                let node_id = r.u64()?;
                let syncing = r.u8()? != 0;
                Packet::Version(VersionPacket {
                    protocol_version,
                    services,
                    timestamp,
                    chain_height,
                    listen_endpoint,
                    node_id,
                    syncing,
                })
            }
            command::VERACK => {
                let mut r = Reader::new(command, &mut body);
                let counter = r.i32()?;
                let reflected_endpoint = r.endpoint()?;
                Packet::VerAck(VerAckPacket {
                    counter,
                    reflected_endpoint,
                })
            }
            command::NETPING => Packet::NetPing(Reader::new(command, &mut body).u64()?),
            command::NETPONG => Packet::NetPong(Reader::new(command, &mut body).u64()?),
            command::REQUESTPEERS => {
                let mut r = Reader::new(command, &mut body);
                let endpoint = r.endpoint()?;
                let max_peers = r.u32()?;
                Packet::RequestPeers {
                    endpoint,
                    max_peers,
                }
            }
            command::REQUESTPEERSRESP => {
                let mut r = Reader::new(command, &mut body);
                let count = r.u32()? as usize;
                if count > MAX_PEERS_PER_PACKET {
                    return Err(r.malformed(format!("{} peers exceeds limit", count)));
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    peers.push(r.endpoint()?);
                }
                Packet::RequestPeersResp(peers)
            }
            command::DISCONNECT => {
                let mut r = Reader::new(command, &mut body);
                let code = r.u8()?;
                let reason = DisconnectReason::from_code(code)
                    .ok_or_else(|| r.malformed(format!("unknown reason {}", code)))?;
                Packet::Disconnect(reason)
            }
            _ if command < command::FIRST_OPAQUE => {
                return Err(CodecError::Malformed {
                    command,
                    reason: "reserved command".to_string(),
                })
            }
            _ => Packet::Opaque { command, body },
        };
        Ok(packet)
    }
}

// =============================================================================
// Endpoint encoding
// =============================================================================

/// Append an endpoint as `family (1) || ip (4 or 16) || port (2)`
pub fn put_endpoint(dst: &mut impl BufMut, endpoint: &SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(6);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_u16(endpoint.port());
}

/// Read an endpoint written by [`put_endpoint`]
pub fn get_endpoint(src: &mut impl Buf) -> Option<SocketAddr> {
    if src.remaining() < 1 {
        return None;
    }
    let ip = match src.get_u8() {
        4 => {
            if src.remaining() < 4 + 2 {
                return None;
            }
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            if src.remaining() < 16 + 2 {
                return None;
            }
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, src.get_u16()))
}

/// Bounds-checked body reader
struct Reader<'a> {
    command: u32,
    buf: &'a mut Bytes,
}

impl<'a> Reader<'a> {
    fn new(command: u32, buf: &'a mut Bytes) -> Self {
        Self { command, buf }
    }

    fn malformed(&self, reason: String) -> CodecError {
        CodecError::Malformed {
            command: self.command,
            reason,
        }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(self.malformed(format!(
                "truncated: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn endpoint(&mut self) -> Result<SocketAddr, CodecError> {
        get_endpoint(&mut *self.buf).ok_or_else(|| self.malformed("bad endpoint".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet) -> Bytes {
        let mut buf = BytesMut::new();
        packet.encode_body(&mut buf);
        buf.freeze()
    }

    fn sample_version() -> VersionPacket {
        VersionPacket {
            protocol_version: 7,
            services: ServiceFlags::FULL_NODE | ServiceFlags::PEER_EXCHANGE,
            timestamp: 1_700_000_000,
            chain_height: 42,
            listen_endpoint: "203.0.113.5:18750".parse().unwrap(),
            node_id: 0xDEAD_BEEF,
            syncing: true,
        }
    }

    #[test]
    fn test_version_body() {
        let packet = Packet::Version(sample_version());
        let body = encode(&packet);
        assert_eq!(body.len(), packet.body_len());

        let decoded = Packet::decode(command::VERSION, body).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_ipv6_peers_response() {
        let peers: Vec<SocketAddr> = vec![
            "[2001:db8::1]:18750".parse().unwrap(),
            "198.51.100.7:9000".parse().unwrap(),
        ];
        let packet = Packet::RequestPeersResp(peers.clone());
        let decoded = Packet::decode(command::REQUESTPEERSRESP, encode(&packet)).unwrap();
        assert_eq!(decoded, Packet::RequestPeersResp(peers));
    }

    #[test]
    fn test_truncated_version_rejected() {
        let body = encode(&Packet::Version(sample_version()));
        let truncated = body.slice(..body.len() - 3);
        let err = Packet::decode(command::VERSION, truncated).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { command: command::VERSION, .. }));
    }

    #[test]
    fn test_peer_count_limit() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_PEERS_PER_PACKET as u32 + 1);
        let err = Packet::decode(command::REQUESTPEERSRESP, buf.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_opaque_and_reserved_commands() {
        let body = Bytes::from_static(b"block bytes");
        let decoded = Packet::decode(0x200, body.clone()).unwrap();
        assert_eq!(decoded, Packet::Opaque { command: 0x200, body });

        assert!(Packet::decode(0x42, Bytes::new()).is_err());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        let packet = Packet::Disconnect(DisconnectReason::InboundFull);
        assert_eq!(
            Packet::decode(command::DISCONNECT, encode(&packet)).unwrap(),
            packet
        );
        assert!(DisconnectReason::InboundFull.is_capacity());
        assert!(!DisconnectReason::Timeout.is_capacity());
        assert!(Packet::decode(command::DISCONNECT, Bytes::from_static(&[200])).is_err());
    }
}
