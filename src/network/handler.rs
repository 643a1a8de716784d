//! Packet handler seam and request/response bookkeeping
//!
//! Ledger packets (blocks, transactions, inventory) are opaque here. They are
//! handed to a [`PacketHandler`] supplied by the embedding daemon.

use crate::network::message::{command, Packet, ServiceFlags};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

/// Receives packets the network layer does not interpret
pub trait PacketHandler: Send + Sync {
    /// Height announced in VERSION
    fn chain_height(&self) -> u64 {
        0
    }

    /// Whether the local chain is still catching up
    fn syncing(&self) -> bool {
        false
    }

    fn services(&self) -> ServiceFlags {
        ServiceFlags::FULL_NODE | ServiceFlags::PEER_EXCHANGE
    }

    /// Handle an opaque packet, optionally returning a reply
    fn handle(&self, from: SocketAddr, command: u32, body: Bytes) -> Option<Packet>;

    /// Response command for a request command, if it has one
    fn expected_response(&self, _command: u32) -> Option<u32> {
        None
    }
}

/// Handler that ignores every ledger packet
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl PacketHandler for NullHandler {
    fn handle(&self, from: SocketAddr, command: u32, body: Bytes) -> Option<Packet> {
        log::debug!(
            "Ignoring {:#x} ({} bytes) from {}",
            command,
            body.len(),
            from
        );
        None
    }
}

/// Response command for a request, built-in ones first
pub fn response_command(handler: &dyn PacketHandler, request: u32) -> Option<u32> {
    match request {
        command::REQUESTPEERS => Some(command::REQUESTPEERSRESP),
        other if other >= command::FIRST_OPAQUE => handler.expected_response(other),
        _ => None,
    }
}

struct Waiter {
    registered: Instant,
    tx: oneshot::Sender<Packet>,
}

/// Outstanding requests keyed by (peer, expected response command)
#[derive(Default)]
pub struct RequestTracker {
    waiters: Mutex<HashMap<(SocketAddr, u32), Vec<Waiter>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `response` from `endpoint`
    pub async fn register(&self, endpoint: SocketAddr, response: u32) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry((endpoint, response))
            .or_default()
            .push(Waiter {
                registered: Instant::now(),
                tx,
            });
        rx
    }

    /// Hand a packet to the oldest matching waiter. Returns the packet back
    /// when nobody was waiting for it.
    pub async fn complete(&self, endpoint: SocketAddr, packet: Packet) -> Option<Packet> {
        let mut waiters = self.waiters.lock().await;
        let key = (endpoint, packet.command());

        let mut packet = packet;
        while let Some(list) = waiters.get_mut(&key) {
            if list.is_empty() {
                waiters.remove(&key);
                break;
            }
            let waiter = list.remove(0);
            match waiter.tx.send(packet) {
                Ok(()) => {
                    if list.is_empty() {
                        waiters.remove(&key);
                    }
                    return None;
                }
                // Requester gave up; try the next one
                Err(returned) => packet = returned,
            }
        }
        Some(packet)
    }

    /// Drop waiters older than `max_age`
    pub async fn expire(&self, max_age: Duration) -> usize {
        let mut waiters = self.waiters.lock().await;
        let mut expired = 0;
        for list in waiters.values_mut() {
            let before = list.len();
            list.retain(|w| w.registered.elapsed() <= max_age && !w.tx.is_closed());
            expired += before - list.len();
        }
        waiters.retain(|_, list| !list.is_empty());
        expired
    }

    /// Forget everything pending for a peer
    pub async fn remove_peer(&self, endpoint: &SocketAddr) {
        self.waiters.lock().await.retain(|(ep, _), _| ep != endpoint);
    }

    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:18750".parse().unwrap()
    }

    #[tokio::test]
    async fn test_response_completes_waiter() {
        let tracker = RequestTracker::new();
        let rx = tracker.register(peer(), command::REQUESTPEERSRESP).await;

        let resp = Packet::RequestPeersResp(vec!["10.0.0.2:18750".parse().unwrap()]);
        assert!(tracker.complete(peer(), resp.clone()).await.is_none());
        assert_eq!(rx.await.unwrap(), resp);
        assert_eq!(tracker.pending().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_passes_through() {
        let tracker = RequestTracker::new();
        let _rx = tracker.register(peer(), command::REQUESTPEERSRESP).await;

        let other: SocketAddr = "10.0.0.9:18750".parse().unwrap();
        let resp = Packet::RequestPeersResp(vec![]);
        assert_eq!(tracker.complete(other, resp.clone()).await, Some(resp));
        assert_eq!(tracker.pending().await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_skipped_and_expired() {
        let tracker = RequestTracker::new();
        drop(tracker.register(peer(), command::REQUESTPEERSRESP).await);
        let resp = Packet::RequestPeersResp(vec![]);
        assert_eq!(tracker.complete(peer(), resp.clone()).await, Some(resp));

        let _rx = tracker.register(peer(), command::REQUESTPEERSRESP).await;
        assert_eq!(tracker.expire(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tracker.expire(Duration::ZERO).await, 1);
    }

    #[test]
    fn test_response_command() {
        assert_eq!(
            response_command(&NullHandler, command::REQUESTPEERS),
            Some(command::REQUESTPEERSRESP)
        );
        assert_eq!(response_command(&NullHandler, command::NETPING), None);
        assert_eq!(response_command(&NullHandler, 0x200), None);
    }
}
