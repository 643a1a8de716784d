//! Peer discovery services
//!
//! - Periodic address exchange with a random fanout of connected peers
//! - Reachability testing of the endpoints inbound peers claim to listen on

use crate::network::connection::connect_outbound;
use crate::network::message::{DisconnectReason, Packet};
use crate::network::node::Node;
use crate::network::peer::Direction;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;

/// Run the exchanger until the node shuts down
pub async fn run_exchanger(node: Arc<Node>) {
    let mut ticker = tokio::time::interval(node.config().exchange_interval());
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = node.token().cancelled() => break,
            _ = ticker.tick() => {
                exchange_round(&node).await;
            }
        }
    }
}

/// Ask a random sample of peers for addresses and merge the answers.
/// Returns how many addresses were accepted.
pub async fn exchange_round(node: &Arc<Node>) -> usize {
    let mut peers: Vec<_> = node
        .peer_manager()
        .acknowledged()
        .await
        .into_iter()
        .filter(|c| c.direction() != Direction::Feeler)
        .collect();
    if peers.is_empty() {
        return 0;
    }
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(node.config().exchange_fanout);

    let request = Packet::RequestPeers {
        endpoint: node.listen_endpoint(),
        max_peers: node.config().max_peers_per_request,
    };

    let exchanges = peers.iter().map(|conn| {
        let request = request.clone();
        async move {
            let endpoint = conn.receiver();
            match node.request(&endpoint, request).await {
                Ok(Packet::RequestPeersResp(addrs)) => {
                    node.merge_peers(node.address_of(conn), addrs).await
                }
                Ok(other) => {
                    log::warn!("{} answered peer request with {}", endpoint, other.type_name());
                    0
                }
                Err(e) => {
                    log::debug!("Peer exchange with {} failed: {}", endpoint, e);
                    0
                }
            }
        }
    });

    let merged: usize = futures::future::join_all(exchanges).await.into_iter().sum();
    log::info!(
        "Peer exchange with {} peers merged {} addresses",
        peers.len(),
        merged
    );
    merged
}

/// Probe the endpoint an inbound peer claims to listen on. Only reachable
/// endpoints enter the address manager.
pub async fn test_incoming(node: Arc<Node>, claimed: SocketAddr) -> bool {
    if node.is_self(&claimed).await {
        return false;
    }
    {
        let addrman = node.addrman();
        let addrman = addrman.read().await;
        if !addrman.is_acceptable(&claimed) {
            log::debug!("Inbound peer claims unusable endpoint {}", claimed);
            return false;
        }
        if addrman.contains(&claimed) {
            return true;
        }
    }

    let params = node.handshake_params(1);
    let token = node.token().child_token();
    match connect_outbound(claimed, Direction::Feeler, node.config(), &params, &token).await {
        Ok(conn) => {
            conn.close(DisconnectReason::FeelerDone).await;
            node.addrman().write().await.add_new(claimed, claimed, 0);
            log::debug!("Verified inbound peer endpoint {}", claimed);
            true
        }
        Err(e) => {
            log::debug!("Inbound peer endpoint {} unreachable: {}", claimed, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetworkConfig;
    use crate::network::handler::NullHandler;

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
    async fn test_exchange_merges_addresses() {
        let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = Node::new(
            NetworkConfig {
                max_getaddr_percent: 100,
                ..test_config(da.path())
            },
            Arc::new(NullHandler),
        )
        .unwrap();
        a.start().await.unwrap();
        let b = started(db.path()).await;

        let known: Vec<SocketAddr> = (1..=5u8)
            .map(|i| SocketAddr::from(([20 + i, 1, 2, 3], 18750)))
            .collect();
        {
            let addrman = a.addrman();
            let mut addrman = addrman.write().await;
            for ep in &known {
                addrman.add_new(*ep, *ep, 0);
            }
        }

        b.connect_to(a.local_addr().unwrap(), Direction::Outbound)
            .await
            .unwrap();
        assert!(exchange_round(&b).await > 0);

        {
            let addrman = b.addrman();
            let addrman = addrman.read().await;
            assert!(known.iter().any(|ep| addrman.contains(ep)));
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_exchange_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(dir.path()).await;
        assert_eq!(exchange_round(&node).await, 0);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_incoming_endpoint_verified() {
        let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = started(da.path()).await;
        let b = started(db.path()).await;
        let b_addr = b.local_addr().unwrap();

        assert!(test_incoming(a.clone(), b_addr).await);
        assert!(a.addrman().read().await.contains(&b_addr));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_incoming_unreachable_endpoint_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let node = started(dir.path()).await;

        // A port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        assert!(!test_incoming(node.clone(), dead).await);
        assert!(!node.addrman().read().await.contains(&dead));
        node.shutdown().await;
    }
}
