//! Peer management for P2P networking
//!
//! Tracks the four connection pools (inbound, outbound, connecting, feelers)
//! and enforces their capacity limits at admission time.

use crate::network::config::NetworkConfig;
use crate::network::connection::Connection;
use crate::network::message::{CodecError, DisconnectReason};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Timed out during {0}")]
    Timeout(&'static str),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Pool full: {0:?}")]
    PoolFull(DisconnectReason),
    #[error("Send queue full")]
    QueueFull,
    #[error("Gave up after {0} connection attempts")]
    MaxAttemptsExceeded(u32),
    #[error("Refusing to connect to self")]
    SelfConnection,
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Shutting down")]
    Shutdown,
    #[error("Discovery failed: {0}")]
    Discovery(String),
}

impl PeerError {
    /// Whether another connection attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PeerError::PoolFull(_)
                | PeerError::SelfConnection
                | PeerError::AlreadyConnected
                | PeerError::Shutdown
                | PeerError::Handshake(HandshakeError::Rejected(_))
        )
    }

    /// The remote answered and turned us away. It is alive, so the attempt
    /// does not count as a failure.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            PeerError::Handshake(HandshakeError::Rejected(_))
                | PeerError::PoolFull(
                    DisconnectReason::InboundFull
                        | DisconnectReason::OutboundFull
                        | DisconnectReason::FeelersFull
                )
        )
    }

    /// Reason code sent to the remote when this error ends a session
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            PeerError::PoolFull(reason) => *reason,
            PeerError::Timeout(_) => DisconnectReason::Timeout,
            PeerError::Handshake(_) => DisconnectReason::HandshakeFailed,
            PeerError::Codec(_) | PeerError::ProtocolViolation(_) => {
                DisconnectReason::ProtocolViolation
            }
            PeerError::SelfConnection => DisconnectReason::SelfConnection,
            PeerError::AlreadyConnected => DisconnectReason::Duplicate,
            PeerError::Shutdown => DisconnectReason::Shutdown,
            _ => DisconnectReason::Requested,
        }
    }
}

/// Reasons a VERSION/VERACK exchange is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Remote is on a different network")]
    NetworkMismatch,
    #[error("Clock skew of {0}s exceeds limit")]
    ClockSkew(i64),
    #[error("Remote rejected us (counter {0})")]
    Rejected(i32),
    #[error("Unexpected {0} during handshake")]
    UnexpectedPacket(&'static str),
}

/// Which side opened a session and what it is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    /// Short-lived outbound probe
    Feeler,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        !matches!(self, Direction::Inbound)
    }
}

/// Capacity of each pool
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub max_connecting: usize,
    pub max_feelers: usize,
}

impl From<&NetworkConfig> for PoolLimits {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_inbound: config.max_inbound,
            max_outbound: config.max_outbound,
            max_connecting: config.max_connecting,
            max_feelers: config.max_feelers,
        }
    }
}

/// A session that has not finished its handshake yet
#[derive(Debug, Clone)]
pub struct Pending {
    pub direction: Direction,
    pub started: Instant,
    /// Cancelling aborts the connect/handshake in progress
    pub token: CancellationToken,
}

#[derive(Default)]
struct Pools {
    inbound: HashMap<SocketAddr, Arc<Connection>>,
    outbound: HashMap<SocketAddr, Arc<Connection>>,
    feelers: HashMap<SocketAddr, Arc<Connection>>,
    connecting: HashMap<SocketAddr, Pending>,
}

impl Pools {
    fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.inbound.contains_key(endpoint)
            || self.outbound.contains_key(endpoint)
            || self.feelers.contains_key(endpoint)
            || self.connecting.contains_key(endpoint)
    }

    fn established(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.feelers.values())
    }

    fn set_for(&mut self, direction: Direction) -> &mut HashMap<SocketAddr, Arc<Connection>> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
            Direction::Feeler => &mut self.feelers,
        }
    }
}

/// Pool sizes for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerManagerStats {
    pub inbound: usize,
    pub outbound: usize,
    pub connecting: usize,
    pub feelers: usize,
}

/// Manages all peer connections
pub struct PeerManager {
    limits: PoolLimits,
    pools: RwLock<Pools>,
}

impl PeerManager {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            pools: RwLock::new(Pools::default()),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Reserve a connecting slot before dialing or handshaking
    pub async fn begin_connecting(
        &self,
        endpoint: SocketAddr,
        direction: Direction,
        token: CancellationToken,
    ) -> Result<(), PeerError> {
        let mut pools = self.pools.write().await;

        if pools.contains(&endpoint) {
            return Err(PeerError::AlreadyConnected);
        }
        if pools.connecting.len() >= self.limits.max_connecting {
            log::debug!("Connecting pool full, refusing {}", endpoint);
            return Err(PeerError::PoolFull(DisconnectReason::ConnectingFull));
        }
        if direction == Direction::Feeler {
            let probing = pools
                .connecting
                .values()
                .filter(|p| p.direction == Direction::Feeler)
                .count();
            if pools.feelers.len() + probing >= self.limits.max_feelers {
                return Err(PeerError::PoolFull(DisconnectReason::FeelersFull));
            }
        }

        pools.connecting.insert(
            endpoint,
            Pending {
                direction,
                started: Instant::now(),
                token,
            },
        );
        Ok(())
    }

    /// Release a connecting slot without admitting anything
    pub async fn abort_connecting(&self, endpoint: &SocketAddr) {
        self.pools.write().await.connecting.remove(endpoint);
    }

    /// Move a handshaken session out of connecting and into its pool
    pub async fn admit(&self, connection: Arc<Connection>) -> Result<(), PeerError> {
        let endpoint = connection.receiver();
        let direction = connection.direction();
        let mut pools = self.pools.write().await;
        pools.connecting.remove(&endpoint);

        if let Some(node_id) = connection.remote_node_id() {
            if pools
                .established()
                .any(|c| c.remote_node_id() == Some(node_id))
            {
                return Err(PeerError::AlreadyConnected);
            }
        }

        let (len, max, reason) = match direction {
            Direction::Inbound => (
                pools.inbound.len(),
                self.limits.max_inbound,
                DisconnectReason::InboundFull,
            ),
            Direction::Outbound => (
                pools.outbound.len(),
                self.limits.max_outbound,
                DisconnectReason::OutboundFull,
            ),
            Direction::Feeler => (
                pools.feelers.len(),
                self.limits.max_feelers,
                DisconnectReason::FeelersFull,
            ),
        };
        if len >= max {
            log::info!("Rejecting {} ({:?}): pool full", endpoint, direction);
            return Err(PeerError::PoolFull(reason));
        }

        pools.set_for(direction).insert(endpoint, connection);
        log::info!("Added peer: {} ({:?})", endpoint, direction);
        Ok(())
    }

    /// Remove a session from every pool
    pub async fn remove(&self, endpoint: &SocketAddr) -> Option<Arc<Connection>> {
        let mut pools = self.pools.write().await;
        pools.connecting.remove(endpoint);
        let removed = pools
            .inbound
            .remove(endpoint)
            .or_else(|| pools.outbound.remove(endpoint))
            .or_else(|| pools.feelers.remove(endpoint));
        if removed.is_some() {
            log::debug!("Removed peer: {}", endpoint);
        }
        removed
    }

    /// Remove only if the pooled session is this exact one
    pub async fn remove_session(&self, connection: &Arc<Connection>) -> bool {
        let mut pools = self.pools.write().await;
        let endpoint = connection.receiver();
        let set = pools.set_for(connection.direction());
        let same = set
            .get(&endpoint)
            .map(|current| Arc::ptr_eq(current, connection))
            .unwrap_or(false);
        if same {
            set.remove(&endpoint);
        }
        same
    }

    pub async fn get(&self, endpoint: &SocketAddr) -> Option<Arc<Connection>> {
        let pools = self.pools.read().await;
        pools
            .inbound
            .get(endpoint)
            .or_else(|| pools.outbound.get(endpoint))
            .or_else(|| pools.feelers.get(endpoint))
            .cloned()
    }

    /// Is this endpoint connected or being connected in any pool?
    pub async fn is_known(&self, endpoint: &SocketAddr) -> bool {
        self.pools.read().await.contains(endpoint)
    }

    /// Is any established session advertising this listen endpoint?
    pub async fn is_listening_peer(&self, endpoint: &SocketAddr) -> bool {
        let pools = self.pools.read().await;
        let found = pools
            .established()
            .any(|c| c.remote_listen_endpoint() == Some(*endpoint));
        found
    }

    pub async fn inbound(&self) -> Vec<Arc<Connection>> {
        self.pools.read().await.inbound.values().cloned().collect()
    }

    pub async fn outbound(&self) -> Vec<Arc<Connection>> {
        self.pools.read().await.outbound.values().cloned().collect()
    }

    pub async fn feelers(&self) -> Vec<Arc<Connection>> {
        self.pools.read().await.feelers.values().cloned().collect()
    }

    /// Acknowledged inbound and outbound sessions
    pub async fn acknowledged(&self) -> Vec<Arc<Connection>> {
        let pools = self.pools.read().await;
        pools
            .inbound
            .values()
            .chain(pools.outbound.values())
            .filter(|c| c.is_acknowledged())
            .cloned()
            .collect()
    }

    /// Every established session, feelers included
    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.pools.read().await.established().cloned().collect()
    }

    pub async fn outbound_count(&self) -> usize {
        self.pools.read().await.outbound.len()
    }

    pub async fn inbound_count(&self) -> usize {
        self.pools.read().await.inbound.len()
    }

    pub async fn connecting_count(&self) -> usize {
        self.pools.read().await.connecting.len()
    }

    pub async fn has_inbound_capacity(&self) -> bool {
        self.pools.read().await.inbound.len() < self.limits.max_inbound
    }

    /// Connecting entries older than `timeout`
    pub async fn stale_connecting(&self, timeout: Duration) -> Vec<(SocketAddr, CancellationToken)> {
        let pools = self.pools.read().await;
        pools
            .connecting
            .iter()
            .filter(|(_, p)| p.started.elapsed() > timeout)
            .map(|(ep, p)| (*ep, p.token.clone()))
            .collect()
    }

    /// Cancel every pending connect
    pub async fn cancel_connecting(&self) {
        let mut pools = self.pools.write().await;
        for (_, pending) in pools.connecting.drain() {
            pending.token.cancel();
        }
    }

    pub async fn stats(&self) -> PeerManagerStats {
        let pools = self.pools.read().await;
        PeerManagerStats {
            inbound: pools.inbound.len(),
            outbound: pools.outbound.len(),
            connecting: pools.connecting.len(),
            feelers: pools.feelers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    fn limits(max_inbound: usize) -> PoolLimits {
        PoolLimits {
            max_inbound,
            max_outbound: 2,
            max_connecting: 2,
            max_feelers: 1,
        }
    }

    /// A connection over a real loopback socket
    async fn loopback(direction: Direction) -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, remote) = match direction {
            Direction::Inbound => server.unwrap(),
            _ => (client.unwrap(), addr),
        };
        Connection::new(
            stream,
            remote,
            direction,
            &NetworkConfig::default(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_inbound_capacity() {
        let max = 3;
        let manager = PeerManager::new(limits(max));

        for _ in 0..max {
            manager.admit(loopback(Direction::Inbound).await).await.unwrap();
        }

        let extra = loopback(Direction::Inbound).await;
        let result = manager.admit(extra).await;
        assert!(matches!(
            result,
            Err(PeerError::PoolFull(DisconnectReason::InboundFull))
        ));
        assert_eq!(manager.inbound_count().await, max);
    }

    #[tokio::test]
    async fn test_connecting_limit_and_duplicates() {
        let manager = PeerManager::new(limits(4));
        let a: SocketAddr = "10.0.0.1:18750".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:18750".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:18750".parse().unwrap();

        manager
            .begin_connecting(a, Direction::Outbound, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            manager
                .begin_connecting(a, Direction::Outbound, CancellationToken::new())
                .await,
            Err(PeerError::AlreadyConnected)
        ));
        manager
            .begin_connecting(b, Direction::Outbound, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            manager
                .begin_connecting(c, Direction::Outbound, CancellationToken::new())
                .await,
            Err(PeerError::PoolFull(DisconnectReason::ConnectingFull))
        ));

        manager.abort_connecting(&a).await;
        assert_eq!(manager.connecting_count().await, 1);
    }

    #[tokio::test]
    async fn test_pools_are_disjoint() {
        let manager = PeerManager::new(limits(4));
        let conn = loopback(Direction::Outbound).await;
        let endpoint = conn.receiver();

        manager
            .begin_connecting(endpoint, Direction::Outbound, CancellationToken::new())
            .await
            .unwrap();
        manager.admit(conn.clone()).await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.connecting, 0);
        assert_eq!(stats.outbound, 1);
        assert!(manager.is_known(&endpoint).await);

        assert!(manager.remove_session(&conn).await);
        assert!(!manager.is_known(&endpoint).await);
        assert!(manager.remove(&endpoint).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_connecting() {
        let manager = PeerManager::new(limits(4));
        let a: SocketAddr = "10.0.0.1:18750".parse().unwrap();
        let token = CancellationToken::new();
        manager
            .begin_connecting(a, Direction::Outbound, token.clone())
            .await
            .unwrap();

        assert!(manager.stale_connecting(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stale = manager.stale_connecting(Duration::ZERO).await;
        assert_eq!(stale.len(), 1);

        manager.cancel_connecting().await;
        assert!(token.is_cancelled());
        assert_eq!(manager.connecting_count().await, 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(!PeerError::PoolFull(DisconnectReason::InboundFull).is_retryable());
        assert!(!PeerError::Handshake(HandshakeError::Rejected(0)).is_retryable());
        assert!(PeerError::Handshake(HandshakeError::VersionMismatch { local: 7, remote: 6 })
            .is_retryable());
        assert!(PeerError::Timeout("connect").is_retryable());
        assert_eq!(
            PeerError::Timeout("handshake").disconnect_reason(),
            DisconnectReason::Timeout
        );
    }
}
