//! TCP listener, outbound dialing and packet framing
//!
//! Frames are `network id (4) || command (4) || length (4) || body`, all
//! big endian. Size and network checks happen on the header, before any body
//! bytes are buffered.

use crate::network::message::{CodecError, Packet, HEADER_SIZE};
use crate::network::peer::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder};

/// A framed packet whose body has not been decoded yet
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: u32,
    pub body: Bytes,
}

impl Frame {
    /// Decode the body according to the command
    pub fn into_packet(self) -> Result<Packet, CodecError> {
        Packet::decode(self.command, self.body)
    }
}

/// Packet codec for length-prefixed framing
#[derive(Debug, Clone)]
pub struct PacketCodec {
    network_id: u32,
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(network_id: u32, max_packet_size: usize) -> Self {
        Self {
            network_id,
            max_packet_size,
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode_body(&mut body);

        let size = HEADER_SIZE + body.len();
        if size > self.max_packet_size {
            return Err(CodecError::Oversized {
                size,
                max: self.max_packet_size,
            });
        }

        dst.reserve(size);
        dst.put_u32(self.network_id);
        dst.put_u32(item.command());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);

        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let network_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if network_id != self.network_id {
            return Err(CodecError::WrongNetwork {
                expected: self.network_id,
                got: network_id,
            });
        }

        let command = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        let size = HEADER_SIZE.saturating_add(len);
        if size > self.max_packet_size {
            return Err(CodecError::Oversized {
                size,
                max: self.max_packet_size,
            });
        }

        // Check if we have full packet
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(len).freeze();

        Ok(Some(Frame { command, body }))
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer, giving up after `timeout`
pub async fn connect_to_peer(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout("connect"))?
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::command;

    const NET: u32 = 0x5042_4C4D;

    #[test]
    fn test_packet_codec() {
        let mut codec = PacketCodec::new(NET, 1024);
        let mut buf = BytesMut::new();
        codec.encode(Packet::NetPing(12345), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 8);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, command::NETPING);
        assert_eq!(frame.into_packet().unwrap(), Packet::NetPing(12345));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = PacketCodec::new(NET, 1024);
        let mut full = BytesMut::new();
        codec.encode(Packet::NetPong(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[HEADER_SIZE + 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_wrong_network_rejected() {
        let mut sender = PacketCodec::new(NET + 1, 1024);
        let mut receiver = PacketCodec::new(NET, 1024);
        let mut buf = BytesMut::new();
        sender.encode(Packet::NetPing(1), &mut buf).unwrap();

        assert!(matches!(
            receiver.decode(&mut buf),
            Err(CodecError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn test_oversized_rejected_from_header() {
        let mut codec = PacketCodec::new(NET, 64);
        let mut buf = BytesMut::new();
        buf.put_u32(NET);
        buf.put_u32(0x200);
        buf.put_u32(1_000_000);

        // Rejected before any body byte arrives
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Oversized { size: 1_000_012, max: 64 })
        ));

        let big = Packet::Opaque {
            command: 0x200,
            body: Bytes::from(vec![0u8; 100]),
        };
        assert!(codec.encode(big, &mut BytesMut::new()).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_to_peer(addr, Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
