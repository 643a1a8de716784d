//! A single peer session
//!
//! Handshake (VERSION/VERACK both ways), then a persistent read loop feeding
//! the node's dispatch queue and a write loop draining a bounded send queue.
//! Reads and writes are each serialized by their own mutex.

use crate::network::config::NetworkConfig;
use crate::network::message::{
    command, CodecError, DisconnectReason, Packet, VerAckPacket, VersionPacket,
};
use crate::network::peer::{Direction, HandshakeError, PeerError};
use crate::network::server::{connect_to_peer, PacketCodec};
use crate::network::{unix_now, unix_now_millis};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// What the local side brings to a handshake
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub local: VersionPacket,
    /// VERACK counter we send; zero announces a rejection
    pub counter: i32,
    pub max_clock_skew: i64,
    /// Deadline for each handshake step
    pub timeout: Duration,
}

/// One TCP session with a peer
pub struct Connection {
    receiver: SocketAddr,
    direction: Direction,
    acknowledged: AtomicBool,
    persistent: AtomicBool,
    last_valid_receive: AtomicI64,
    last_valid_send: AtomicI64,
    ping_nonce: AtomicU64,
    /// Millis when the outstanding ping was sent, 0 when none
    ping_start: AtomicI64,
    ping_latency: AtomicU64,
    remote: OnceLock<VersionPacket>,
    reflected: OnceLock<SocketAddr>,
    reader: Mutex<FramedRead<OwnedReadHalf, PacketCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, PacketCodec>>,
    queue_tx: mpsc::Sender<Packet>,
    queue_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    token: CancellationToken,
    write_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("receiver", &self.receiver)
            .field("direction", &self.direction)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected socket. The session is cancelled with `parent`.
    pub fn new(
        stream: TcpStream,
        receiver: SocketAddr,
        direction: Direction,
        config: &NetworkConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let codec = PacketCodec::new(config.network_id, config.max_packet_size);
        let (queue_tx, queue_rx) = mpsc::channel(config.send_queue_capacity);

        Arc::new(Self {
            receiver,
            direction,
            acknowledged: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            last_valid_receive: AtomicI64::new(0),
            last_valid_send: AtomicI64::new(0),
            ping_nonce: AtomicU64::new(0),
            ping_start: AtomicI64::new(0),
            ping_latency: AtomicU64::new(0),
            remote: OnceLock::new(),
            reflected: OnceLock::new(),
            reader: Mutex::new(FramedRead::new(read_half, codec.clone())),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            token: parent.child_token(),
            write_timeout: config.write_timeout(),
        })
    }

    pub fn receiver(&self) -> SocketAddr {
        self.receiver
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Whether the read/write loops are running
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The remote's VERSION, once the handshake succeeded
    pub fn remote_version(&self) -> Option<&VersionPacket> {
        self.remote.get()
    }

    pub fn remote_node_id(&self) -> Option<u64> {
        self.remote.get().map(|v| v.node_id)
    }

    /// Endpoint the remote says it listens on
    pub fn remote_listen_endpoint(&self) -> Option<SocketAddr> {
        self.remote.get().map(|v| v.listen_endpoint)
    }

    /// Our endpoint as observed by the remote
    pub fn reflected_endpoint(&self) -> Option<SocketAddr> {
        self.reflected.get().copied()
    }

    pub fn last_valid_receive(&self) -> i64 {
        self.last_valid_receive.load(Ordering::Relaxed)
    }

    pub fn last_valid_send(&self) -> i64 {
        self.last_valid_send.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Heartbeat state
    // =========================================================================

    /// Remember an outgoing ping
    pub fn start_ping(&self, nonce: u64) {
        self.ping_nonce.store(nonce, Ordering::Release);
        self.ping_start.store(unix_now_millis(), Ordering::Release);
    }

    /// Match a pong; returns the round trip when the nonce is ours
    pub fn complete_ping(&self, nonce: u64) -> Option<Duration> {
        let start = self.ping_start.load(Ordering::Acquire);
        if start == 0 || self.ping_nonce.load(Ordering::Acquire) != nonce {
            return None;
        }
        self.ping_start.store(0, Ordering::Release);

        let elapsed = (unix_now_millis() - start).max(0) as u64;
        self.ping_latency.store(elapsed, Ordering::Relaxed);
        Some(Duration::from_millis(elapsed))
    }

    /// Millis timestamp of the unanswered ping, if any
    pub fn ping_outstanding_since(&self) -> Option<i64> {
        match self.ping_start.load(Ordering::Acquire) {
            0 => None,
            start => Some(start),
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.ping_latency.load(Ordering::Relaxed))
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Exchange VERSION and VERACK. The dialing side speaks first.
    pub async fn handshake(&self, params: &HandshakeParams) -> Result<VersionPacket, PeerError> {
        let remote = if self.direction.is_outbound() {
            self.send_within(Packet::Version(params.local.clone()), params.timeout)
                .await?;
            self.expect_version(params).await?
        } else {
            let remote = self.expect_version(params).await?;
            self.send_within(Packet::Version(params.local.clone()), params.timeout)
                .await?;
            remote
        };
        log::debug!(
            "Got VERSION from {} (protocol {}, height {})",
            self.receiver,
            remote.protocol_version,
            remote.chain_height
        );

        self.send_within(
            Packet::VerAck(VerAckPacket {
                counter: params.counter,
                reflected_endpoint: self.receiver,
            }),
            params.timeout,
        )
        .await?;

        let ack = match self.receive(params.timeout, "handshake").await? {
            Packet::VerAck(ack) => ack,
            Packet::Disconnect(reason) => return Err(refused(reason)),
            other => return Err(HandshakeError::UnexpectedPacket(other.type_name()).into()),
        };
        if ack.counter <= 0 {
            return Err(HandshakeError::Rejected(ack.counter).into());
        }

        let _ = self.reflected.set(ack.reflected_endpoint);
        let _ = self.remote.set(remote.clone());
        self.acknowledged.store(true, Ordering::Release);
        Ok(remote)
    }

    async fn expect_version(&self, params: &HandshakeParams) -> Result<VersionPacket, PeerError> {
        let packet = match self.receive(params.timeout, "handshake").await {
            Err(PeerError::Codec(CodecError::WrongNetwork { .. })) => {
                return Err(HandshakeError::NetworkMismatch.into())
            }
            other => other?,
        };

        let remote = match packet {
            Packet::Version(version) => version,
            Packet::Disconnect(reason) => return Err(refused(reason)),
            other => return Err(HandshakeError::UnexpectedPacket(other.type_name()).into()),
        };

        validate_version(&params.local, &remote, params.max_clock_skew)?;
        Ok(remote)
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Read one packet, holding the receive gate
    pub async fn receive(&self, timeout: Duration, phase: &'static str) -> Result<Packet, PeerError> {
        let mut reader = self.reader.lock().await;

        let next = tokio::select! {
            _ = self.token.cancelled() => return Err(PeerError::Disconnected),
            next = tokio::time::timeout(timeout, reader.next()) => {
                next.map_err(|_| PeerError::Timeout(phase))?
            }
        };

        let frame = next.ok_or(PeerError::Disconnected)??;
        let packet = frame.into_packet()?;
        self.touch_receive();
        Ok(packet)
    }

    async fn send_within(&self, packet: Packet, timeout: Duration) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(timeout, writer.send(packet))
            .await
            .map_err(|_| PeerError::Timeout("handshake"))??;
        self.touch_send();
        Ok(())
    }

    /// Write one packet now, holding the send gate. A failed or timed out
    /// write ends the session.
    pub async fn send(&self, packet: Packet) -> Result<(), PeerError> {
        if self.token.is_cancelled() {
            return Err(PeerError::Disconnected);
        }

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.send(packet)).await {
            Ok(Ok(())) => {
                self.touch_send();
                Ok(())
            }
            Ok(Err(CodecError::Oversized { size, max })) => {
                Err(CodecError::Oversized { size, max }.into())
            }
            Ok(Err(e)) => {
                self.token.cancel();
                Err(e.into())
            }
            Err(_) => {
                self.token.cancel();
                Err(PeerError::Timeout("write"))
            }
        }
    }

    /// Queue a packet for the write loop
    pub fn send_async(&self, packet: Packet) -> Result<(), PeerError> {
        if self.token.is_cancelled() {
            return Err(PeerError::Disconnected);
        }
        self.queue_tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }

    /// Run the read and write loops until the session ends
    pub async fn run(
        self: Arc<Self>,
        dispatch: mpsc::Sender<(SocketAddr, Packet)>,
    ) -> Result<(), PeerError> {
        self.persistent.store(true, Ordering::Release);

        let queue = self.queue_rx.lock().await.take();
        let writer = {
            let conn = self.clone();
            tokio::spawn(async move {
                if let Some(queue) = queue {
                    conn.write_loop(queue).await;
                }
            })
        };

        let result = self.read_loop(&dispatch).await;
        if let Err(e) = &result {
            self.close(e.disconnect_reason()).await;
        }

        self.token.cancel();
        self.persistent.store(false, Ordering::Release);
        let _ = writer.await;
        result
    }

    async fn read_loop(&self, dispatch: &mpsc::Sender<(SocketAddr, Packet)>) -> Result<(), PeerError> {
        let mut reader = self.reader.lock().await;

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                next = reader.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(CodecError::IoError(e))) => return Err(PeerError::IoError(e)),
                Some(Err(e)) => return Err(PeerError::Codec(e)),
                None => {
                    log::debug!("Peer {} closed the connection", self.receiver);
                    return Ok(());
                }
            };

            let code = frame.command;
            match frame.into_packet() {
                Ok(packet) => {
                    self.touch_receive();
                    if dispatch.send((self.receiver, packet)).await.is_err() {
                        return Err(PeerError::Shutdown);
                    }
                }
                // Session control packets must decode
                Err(e)
                    if !self.is_acknowledged()
                        || matches!(
                            code,
                            command::VERSION | command::VERACK | command::DISCONNECT
                        ) =>
                {
                    log::warn!(
                        "Malformed {} from {}, disconnecting: {}",
                        command::name(code),
                        self.receiver,
                        e
                    );
                    return Err(PeerError::Codec(e));
                }
                Err(e) => {
                    log::warn!(
                        "Dropping malformed {} from {}: {}",
                        command::name(code),
                        self.receiver,
                        e
                    );
                }
            }
        }
    }

    async fn write_loop(&self, mut queue: mpsc::Receiver<Packet>) {
        loop {
            let packet = tokio::select! {
                _ = self.token.cancelled() => break,
                packet = queue.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            if let Err(e) = self.send(packet).await {
                log::warn!("Write to {} failed: {}", self.receiver, e);
                if self.token.is_cancelled() {
                    break;
                }
            }
        }
    }

    /// Tell the remote why, then close the socket
    pub async fn close(&self, reason: DisconnectReason) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        log::info!(
            "Disconnecting {} ({:?}): {:?}",
            self.receiver,
            self.direction,
            reason
        );

        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(self.write_timeout, async {
            let _ = writer.send(Packet::Disconnect(reason)).await;
            writer.get_mut().shutdown().await
        })
        .await;
    }

    fn touch_receive(&self) {
        self.last_valid_receive.store(unix_now(), Ordering::Relaxed);
    }

    fn touch_send(&self) {
        self.last_valid_send.store(unix_now(), Ordering::Relaxed);
    }
}

/// Error for a DISCONNECT received before the handshake completed
fn refused(reason: DisconnectReason) -> PeerError {
    match reason {
        DisconnectReason::SelfConnection => PeerError::SelfConnection,
        DisconnectReason::Duplicate => PeerError::AlreadyConnected,
        reason if reason.is_capacity() => PeerError::PoolFull(reason),
        _ => HandshakeError::UnexpectedPacket("DISCONNECT").into(),
    }
}

/// Check a remote VERSION against our own
pub fn validate_version(
    local: &VersionPacket,
    remote: &VersionPacket,
    max_clock_skew: i64,
) -> Result<(), PeerError> {
    if remote.protocol_version != local.protocol_version {
        return Err(HandshakeError::VersionMismatch {
            local: local.protocol_version,
            remote: remote.protocol_version,
        }
        .into());
    }

    if remote.node_id == local.node_id {
        return Err(PeerError::SelfConnection);
    }

    let skew = remote.timestamp - unix_now();
    if skew.abs() > max_clock_skew {
        return Err(HandshakeError::ClockSkew(skew).into());
    }

    Ok(())
}

/// Dial and handshake, retrying up to the configured attempt cap
pub async fn connect_outbound(
    endpoint: SocketAddr,
    direction: Direction,
    config: &NetworkConfig,
    params: &HandshakeParams,
    parent: &CancellationToken,
) -> Result<Arc<Connection>, PeerError> {
    let attempts = config.max_connect_attempts;

    for attempt in 1..=attempts {
        if parent.is_cancelled() {
            return Err(PeerError::Shutdown);
        }

        match try_connect(endpoint, direction, config, params, parent).await {
            Ok(conn) => return Ok(conn),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                log::warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt,
                    attempts,
                    endpoint,
                    e
                );
            }
        }
    }

    log::warn!("Giving up on {} after {} attempts", endpoint, attempts);
    Err(PeerError::MaxAttemptsExceeded(attempts))
}

async fn try_connect(
    endpoint: SocketAddr,
    direction: Direction,
    config: &NetworkConfig,
    params: &HandshakeParams,
    parent: &CancellationToken,
) -> Result<Arc<Connection>, PeerError> {
    let stream = connect_to_peer(endpoint, config.connect_timeout()).await?;
    let conn = Connection::new(stream, endpoint, direction, config, parent);

    match conn.handshake(params).await {
        Ok(_) => Ok(conn),
        Err(e) => {
            log::warn!("Handshake with {} failed: {}", endpoint, e);
            conn.close(e.disconnect_reason()).await;
            Err(e)
        }
    }
}
