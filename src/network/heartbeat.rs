//! Liveness pings
//!
//! Every acknowledged session gets a NETPING each round. A session whose
//! ping stays unanswered past the pong timeout is dropped.

use crate::network::message::{DisconnectReason, Packet};
use crate::network::node::Node;
use crate::network::peer::Direction;
use crate::network::unix_now_millis;
use std::sync::Arc;

/// What one heartbeat round did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub dropped: usize,
}

/// Run heartbeats until the node shuts down
pub async fn run(node: Arc<Node>) {
    let mut ticker = tokio::time::interval(node.config().heartbeat_interval());
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = node.token().cancelled() => break,
            _ = ticker.tick() => {
                let report = heartbeat_round(&node).await;
                if report.dropped > 0 {
                    log::info!("Heartbeat dropped {} unresponsive peers", report.dropped);
                }
            }
        }
    }
}

pub async fn heartbeat_round(node: &Arc<Node>) -> HeartbeatReport {
    let timeout = node.config().pong_timeout().as_millis() as i64;
    let now = unix_now_millis();
    let mut report = HeartbeatReport::default();

    for conn in node.peer_manager().acknowledged().await {
        if conn.direction() == Direction::Feeler {
            continue;
        }

        if let Some(since) = conn.ping_outstanding_since() {
            if now - since >= timeout {
                log::warn!(
                    "{} did not answer ping within {}ms",
                    conn.receiver(),
                    timeout
                );
                let endpoint = node.address_of(&conn);
                node.addrman().write().await.attempt(&endpoint, true);
                node.disconnect(&conn.receiver(), DisconnectReason::Unresponsive)
                    .await;
                report.dropped += 1;
            }
            continue;
        }

        let nonce: u64 = rand::random();
        conn.start_ping(nonce);
        match conn.send_async(Packet::NetPing(nonce)) {
            Ok(()) => report.pinged += 1,
            Err(e) => log::debug!("Could not ping {}: {}", conn.receiver(), e),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::NetworkConfig;
    use crate::network::handler::NullHandler;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            allow_local_addresses: true,
            min_outbound: 0,
            handshake_timeout_ms: 2_000,
            heartbeat_interval_secs: 3600,
            feeler_interval_secs: 3600,
            exchange_interval_secs: 3600,
            rebalance_interval_secs: 3600,
            save_interval_secs: 3600,
            ..Default::default()
        }
    }

    async fn pair(pong_timeout_secs: u64) -> (Arc<Node>, Arc<Node>, tempfile::TempDir, tempfile::TempDir) {
        let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = Node::new(test_config(da.path()), Arc::new(NullHandler)).unwrap();
        a.start().await.unwrap();
        let b = Node::new(
            NetworkConfig {
                pong_timeout_secs,
                ..test_config(db.path())
            },
            Arc::new(NullHandler),
        )
        .unwrap();
        b.start().await.unwrap();
        b.connect_to(a.local_addr().unwrap(), Direction::Outbound)
            .await
            .unwrap();
        (a, b, da, db)
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (a, b, _da, _db) = pair(60).await;

        let report = heartbeat_round(&b).await;
        assert_eq!(report.pinged, 1);

        let conn = b.peer_manager().outbound().await.remove(0);
        for _ in 0..100 {
            if conn.ping_outstanding_since().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(conn.ping_outstanding_since().is_none());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_unanswered_ping_drops_peer() {
        let (a, b, _da, _db) = pair(0).await;

        // A ping that never went out can never be answered
        let conn = b.peer_manager().outbound().await.remove(0);
        conn.start_ping(42);

        let report = heartbeat_round(&b).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(b.peer_manager().outbound_count().await, 0);
        assert!(conn.token().is_cancelled());

        a.shutdown().await;
        b.shutdown().await;
    }
}
