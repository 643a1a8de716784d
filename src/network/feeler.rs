//! Feeler connections
//!
//! Short-lived probes that test addresses without keeping a session. They
//! resolve tried-table collisions and move reachable New addresses into
//! Tried.

use crate::network::message::DisconnectReason;
use crate::network::node::Node;
use crate::network::peer::{Direction, PeerError};
use std::net::SocketAddr;
use std::sync::Arc;

/// Result of one feeler round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeelerOutcome {
    /// A collision occupant was probed
    Collision { occupant: SocketAddr, alive: bool },
    /// A candidate address was probed
    Probed { endpoint: SocketAddr, alive: bool },
}

/// Run feelers until the node shuts down
pub async fn run(node: Arc<Node>) {
    let mut ticker = tokio::time::interval(node.config().feeler_interval());
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = node.token().cancelled() => break,
            _ = ticker.tick() => {
                let node = node.clone();
                tokio::spawn(async move {
                    if let Some(outcome) = feeler_round(&node).await {
                        log::debug!("Feeler: {:?}", outcome);
                    }
                });
            }
        }
    }
}

/// Open a feeler session and close it right after the handshake
pub async fn probe(node: &Arc<Node>, endpoint: SocketAddr) -> Result<(), PeerError> {
    let conn = node.connect_to(endpoint, Direction::Feeler).await?;
    node.peer_manager().remove_session(&conn).await;
    conn.close(DisconnectReason::FeelerDone).await;
    Ok(())
}

/// Test one address. Pending collisions take precedence over candidates.
pub async fn feeler_round(node: &Arc<Node>) -> Option<FeelerOutcome> {
    let addrman = node.addrman();

    let collision = addrman.write().await.select_tried_collision();
    if let Some((collider, occupant)) = collision {
        let alive = if node.peer_manager().is_listening_peer(&occupant).await {
            true
        } else {
            match probe(node, occupant).await {
                Ok(()) => true,
                Err(e) if is_local_limit(&e) => return None,
                Err(e) => e.is_refusal(),
            }
        };
        addrman.write().await.resolve_collision(&collider, alive);
        log::info!(
            "Collision for {}: occupant {} {}",
            collider,
            occupant,
            if alive { "kept" } else { "evicted" }
        );
        return Some(FeelerOutcome::Collision { occupant, alive });
    }

    let endpoint = match node.next_feeler_candidate().await {
        Some(endpoint) => endpoint,
        None => node.select_candidate(true).await?,
    };

    let alive = match probe(node, endpoint).await {
        Ok(()) => true,
        Err(e) if is_local_limit(&e) => return None,
        Err(e) => {
            log::debug!("Feeler to {} failed: {}", endpoint, e);
            e.is_refusal()
        }
    };

    let mut addrman = addrman.write().await;
    if alive {
        addrman.good(&endpoint, true);
    } else if addrman.find(&endpoint).is_some_and(|r| r.in_tried) {
        addrman.record_tried_failure(&endpoint);
    } else {
        addrman.remove_from_new(&endpoint);
    }
    Some(FeelerOutcome::Probed { endpoint, alive })
}

/// Failures caused by our own state rather than the remote
fn is_local_limit(e: &PeerError) -> bool {
    matches!(
        e,
        PeerError::PoolFull(DisconnectReason::FeelersFull | DisconnectReason::ConnectingFull)
            | PeerError::AlreadyConnected
            | PeerError::Shutdown
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetworkConfig;
    use crate::network::handler::NullHandler;
    use crate::network::peer::HandshakeError;

    fn test_config(dir: &std::path::Path) -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            allow_local_addresses: true,
            min_outbound: 0,
            max_connect_attempts: 1,
            handshake_timeout_ms: 2_000,
            read_timeout_ms: 2_000,
            heartbeat_interval_secs: 3600,
            feeler_interval_secs: 3600,
            exchange_interval_secs: 3600,
            rebalance_interval_secs: 3600,
            save_interval_secs: 3600,
            ..Default::default()
        }
    }

    async fn started(dir: &std::path::Path) -> Arc<Node> {
        let node = Node::new(test_config(dir), Arc::new(NullHandler)).unwrap();
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_reachable_address_promoted() {
        let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = started(da.path()).await;
        let b = started(db.path()).await;
        let a_addr = a.local_addr().unwrap();
        b.addrman().write().await.add_new(a_addr, a_addr, 0);

        let outcome = feeler_round(&b).await;
        assert_eq!(
            outcome,
            Some(FeelerOutcome::Probed {
                endpoint: a_addr,
                alive: true
            })
        );
        assert!(b.addrman().read().await.find(&a_addr).unwrap().in_tried);
        // Feelers never linger in the pools
        assert!(b.peer_manager().feelers().await.is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_address_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(dir.path()).await;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        node.addrman().write().await.add_new(dead, dead, 0);

        let outcome = feeler_round(&node).await;
        assert_eq!(
            outcome,
            Some(FeelerOutcome::Probed {
                endpoint: dead,
                alive: false
            })
        );
        assert!(!node.addrman().read().await.contains(&dead));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_nothing_to_probe() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(dir.path()).await;
        assert_eq!(feeler_round(&node).await, None);
        node.shutdown().await;
    }

    #[test]
    fn test_error_classification() {
        assert!(is_local_limit(&PeerError::PoolFull(DisconnectReason::FeelersFull)));
        assert!(!is_local_limit(&PeerError::Disconnected));
        assert!(PeerError::Handshake(HandshakeError::Rejected(0)).is_refusal());
        assert!(!PeerError::MaxAttemptsExceeded(3).is_refusal());
        assert!(!PeerError::SelfConnection.is_refusal());
    }
}
