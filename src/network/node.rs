//! P2P Node implementation
//!
//! The main node that orchestrates all networking components: the listener,
//! the connection pools, the address manager, bootstrap, rebalancing,
//! persistence and the maintenance services.

use crate::network::addrman::{AddrManConfig, AddrManager};
use crate::network::config::NetworkConfig;
use crate::network::connection::{connect_outbound, Connection, HandshakeParams};
use crate::network::handler::{response_command, PacketHandler, RequestTracker};
use crate::network::message::{DisconnectReason, Packet, ServiceFlags, VersionPacket};
use crate::network::peer::{Direction, PeerError, PeerManager, PeerManagerStats, PoolLimits};
use crate::network::server::Server;
use crate::network::{discovery, feeler, heartbeat, unix_now};
use crate::storage::{PeerStore, StorageError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Age penalty for addresses relayed by third parties (seconds)
const RELAY_PENALTY: i64 = 2 * 60 * 60;

/// Outbound peers needed before the bootstrap link is dropped
const BOOTSTRAP_MIN_PEERS: usize = 2;

/// Bound on the feeler priority queue
const MAX_FEELER_QUEUE: usize = 64;

/// Draws from the address manager per outbound slot being filled
const SELECT_TRIES: usize = 20;

const DISPATCH_QUEUE: usize = 1000;

/// The main P2P node
pub struct Node {
    config: NetworkConfig,
    node_id: u64,
    peer_manager: Arc<PeerManager>,
    addrman: Arc<RwLock<AddrManager>>,
    store: Arc<PeerStore>,
    handler: Arc<dyn PacketHandler>,
    requests: RequestTracker,
    token: CancellationToken,
    dispatch_tx: mpsc::Sender<(SocketAddr, Packet)>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<(SocketAddr, Packet)>>>,
    local_addr: OnceLock<SocketAddr>,
    /// Endpoints that turned out to be us
    self_endpoints: RwLock<HashSet<SocketAddr>>,
    public_reachable: AtomicBool,
    /// Bootstrap discovery failed and the bootstrap node is kept as a peer
    bootstrap_fallback: AtomicBool,
    feeler_queue: Mutex<VecDeque<SocketAddr>>,
}

impl Node {
    /// Create a node, loading any saved peer addresses
    pub fn new(
        config: NetworkConfig,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        config.validate()?;

        let store = PeerStore::in_dir(&config.data_dir)?;
        let addrman_config = AddrManConfig::from(&config);
        let addrman = match store.load(addrman_config) {
            Ok(Some(addrman)) => {
                let stats = addrman.stats();
                log::info!(
                    "Loaded {} peer addresses ({} tried, {} new)",
                    stats.total,
                    stats.tried,
                    stats.new
                );
                addrman
            }
            Ok(None) => AddrManager::new(addrman_config),
            Err(e) => {
                log::warn!("Could not load peer addresses, starting empty: {}", e);
                AddrManager::new(addrman_config)
            }
        };

        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE);

        Ok(Arc::new(Self {
            node_id: rand::thread_rng().gen(),
            peer_manager: Arc::new(PeerManager::new(PoolLimits::from(&config))),
            addrman: Arc::new(RwLock::new(addrman)),
            store: Arc::new(store),
            handler,
            requests: RequestTracker::new(),
            token: CancellationToken::new(),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            local_addr: OnceLock::new(),
            self_endpoints: RwLock::new(HashSet::new()),
            public_reachable: AtomicBool::new(config.public),
            bootstrap_fallback: AtomicBool::new(false),
            feeler_queue: Mutex::new(VecDeque::new()),
            config,
        }))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.peer_manager.clone()
    }

    pub fn addrman(&self) -> Arc<RwLock<AddrManager>> {
        self.addrman.clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether broadcasts also go to inbound peers
    pub fn is_public_reachable(&self) -> bool {
        self.public_reachable.load(Ordering::Acquire)
    }

    /// Bound listening address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Endpoint advertised in VERSION
    pub fn listen_endpoint(&self) -> SocketAddr {
        self.local_addr().unwrap_or(self.config.listen_addr)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind the listener and spawn every background task. Returns the bound
    /// address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
        let server = Server::bind(self.config.listen_addr).await?;
        let local = server.local_addr();
        let _ = self.local_addr.set(local);
        log::info!("Node {:016x} started on {}", self.node_id, local);

        let dispatch_rx = self
            .dispatch_rx
            .lock()
            .await
            .take()
            .ok_or("node already started")?;

        tokio::spawn(self.clone().accept_loop(server));
        tokio::spawn(self.clone().dispatch_loop(dispatch_rx));
        tokio::spawn(self.clone().persistence_loop());
        tokio::spawn(feeler::run(self.clone()));
        tokio::spawn(heartbeat::run(self.clone()));
        tokio::spawn(discovery::run_exchanger(self.clone()));
        tokio::spawn(self.clone().startup());

        Ok(local)
    }

    /// Wait until the node is shut down
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Save peers, disconnect everyone and stop all tasks
    pub async fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        log::info!("Node shutting down...");

        if let Err(e) = self.save_peers().await {
            log::error!("Failed to save peer addresses: {}", e);
        }

        self.peer_manager.cancel_connecting().await;
        for conn in self.peer_manager.all().await {
            conn.close(DisconnectReason::Shutdown).await;
            self.peer_manager.remove_session(&conn).await;
        }

        self.token.cancel();
    }

    async fn startup(self: Arc<Self>) {
        self.dial_seeds().await;
        self.bootstrap().await;
        self.rebalance_loop().await;
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn accept_loop(self: Arc<Self>, server: Server) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = server.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    log::debug!("Incoming connection from {}", addr);
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_inbound(stream, addr).await });
                }
                Err(e) => log::error!("Accept error: {}", e),
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let pending = self.token.child_token();
        if let Err(e) = self
            .peer_manager
            .begin_connecting(addr, Direction::Inbound, pending.clone())
            .await
        {
            log::info!("Refusing inbound {}: {}", addr, e);
            let conn = Connection::new(stream, addr, Direction::Inbound, &self.config, &self.token);
            conn.close(e.disconnect_reason()).await;
            return;
        }

        let conn = Connection::new(stream, addr, Direction::Inbound, &self.config, &pending);
        let full = !self.peer_manager.has_inbound_capacity().await;
        let counter = if full { 0 } else { self.ack_counter().await };
        let params = self.handshake_params(counter);

        let result = tokio::select! {
            result = conn.handshake(&params) => result,
            _ = pending.cancelled() => Err(PeerError::Timeout("connecting")),
        };

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Inbound handshake with {} failed: {}", addr, e);
                self.peer_manager.abort_connecting(&addr).await;
                conn.close(e.disconnect_reason()).await;
                return;
            }
        };
        let listen = advertised_endpoint(&remote, addr);

        let admitted = if full {
            self.peer_manager.abort_connecting(&addr).await;
            Err(PeerError::PoolFull(DisconnectReason::InboundFull))
        } else {
            self.peer_manager.admit(conn.clone()).await
        };
        if let Err(e) = admitted {
            log::info!("Rejecting inbound {}: {}", addr, e);
            if matches!(e, PeerError::PoolFull(_)) {
                self.retain_known(listen).await;
            }
            conn.close(e.disconnect_reason()).await;
            return;
        }

        if !self.public_reachable.swap(true, Ordering::AcqRel) {
            log::info!("Accepted first inbound peer; node is publicly reachable");
        }
        if let Some(reflected) = conn.reflected_endpoint() {
            self.note_reflected(reflected).await;
        }

        let tester = self.clone();
        tokio::spawn(async move { discovery::test_incoming(tester, listen).await });

        self.run_session(conn).await;
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Dial, handshake and admit a peer. Outbound sessions start their I/O
    /// loops; feelers are returned unstarted.
    pub async fn connect_to(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        direction: Direction,
    ) -> Result<Arc<Connection>, PeerError> {
        if self.token.is_cancelled() {
            return Err(PeerError::Shutdown);
        }
        if self.is_self(&endpoint).await {
            return Err(PeerError::SelfConnection);
        }
        if direction == Direction::Outbound && self.peer_manager.is_listening_peer(&endpoint).await {
            return Err(PeerError::AlreadyConnected);
        }

        let pending = self.token.child_token();
        self.peer_manager
            .begin_connecting(endpoint, direction, pending.clone())
            .await?;
        log::debug!("Connecting to {} ({:?})", endpoint, direction);

        let params = self.handshake_params(self.ack_counter().await);
        let result = tokio::select! {
            result = connect_outbound(endpoint, direction, &self.config, &params, &pending) => result,
            _ = pending.cancelled() => Err(if self.token.is_cancelled() {
                PeerError::Shutdown
            } else {
                PeerError::Timeout("connecting")
            }),
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                self.peer_manager.abort_connecting(&endpoint).await;
                match e {
                    PeerError::SelfConnection => self.note_self(endpoint).await,
                    PeerError::Shutdown | PeerError::AlreadyConnected => {}
                    // The remote answered, so it is alive
                    _ if e.is_refusal() => {
                        self.addrman.write().await.attempt(&endpoint, false)
                    }
                    _ => self.addrman.write().await.attempt(&endpoint, true),
                }
                return Err(e);
            }
        };

        if let Some(reflected) = conn.reflected_endpoint() {
            self.note_reflected(reflected).await;
        }

        if let Err(e) = self.peer_manager.admit(conn.clone()).await {
            log::info!("Not keeping {}: {}", endpoint, e);
            conn.close(e.disconnect_reason()).await;
            if matches!(e, PeerError::PoolFull(_)) {
                self.retain_known(endpoint).await;
            }
            return Err(e);
        }

        if direction == Direction::Outbound {
            self.mark_good(&[endpoint]).await;
            let node = self.clone();
            let session = conn.clone();
            tokio::spawn(async move { node.run_session(session).await });
        }

        Ok(conn)
    }

    async fn run_session(&self, conn: Arc<Connection>) {
        log::info!(
            "Session established with {} ({:?})",
            conn.receiver(),
            conn.direction()
        );

        match conn.clone().run(self.dispatch_tx.clone()).await {
            Ok(()) => log::info!("Session with {} closed", conn.receiver()),
            Err(e) => {
                log::warn!("Session with {} ended: {}", conn.receiver(), e);
                conn.close(e.disconnect_reason()).await;
            }
        }

        self.peer_manager.remove_session(&conn).await;
        self.requests.remove_peer(&conn.receiver()).await;
    }

    /// Close a session and drop it from the pools
    pub async fn disconnect(&self, endpoint: &SocketAddr, reason: DisconnectReason) {
        if let Some(conn) = self.peer_manager.remove(endpoint).await {
            conn.close(reason).await;
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send immediately. Request packets also register a response waiter.
    pub async fn send(
        &self,
        endpoint: &SocketAddr,
        packet: Packet,
    ) -> Result<Option<oneshot::Receiver<Packet>>, PeerError> {
        let conn = self.session(endpoint).await?;
        let waiter = self.track(endpoint, &packet).await;
        conn.send(packet).await?;
        Ok(waiter)
    }

    /// Queue for the session's write loop. Request packets also register a
    /// response waiter.
    pub async fn send_async(
        &self,
        endpoint: &SocketAddr,
        packet: Packet,
    ) -> Result<Option<oneshot::Receiver<Packet>>, PeerError> {
        let conn = self.session(endpoint).await?;
        let waiter = self.track(endpoint, &packet).await;
        conn.send_async(packet)?;
        Ok(waiter)
    }

    /// Send a request and wait for its response
    pub async fn request(&self, endpoint: &SocketAddr, packet: Packet) -> Result<Packet, PeerError> {
        let name = packet.type_name();
        let waiter = self
            .send_async(endpoint, packet)
            .await?
            .ok_or_else(|| PeerError::ProtocolViolation(format!("{} has no response", name)))?;

        tokio::select! {
            _ = self.token.cancelled() => Err(PeerError::Shutdown),
            response = tokio::time::timeout(self.config.read_timeout(), waiter) => {
                response
                    .map_err(|_| PeerError::Timeout("request"))?
                    .map_err(|_| PeerError::Disconnected)
            }
        }
    }

    /// Queue a packet on every acknowledged session. Inbound sessions are
    /// included only once the node is publicly reachable.
    pub async fn broadcast(&self, packet: Packet) -> usize {
        let mut targets = self.peer_manager.outbound().await;
        if self.is_public_reachable() {
            targets.extend(self.peer_manager.inbound().await);
        }

        let mut sent = 0;
        for conn in targets.iter().filter(|c| c.is_acknowledged()) {
            match conn.send_async(packet.clone()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast to {} failed: {}", conn.receiver(), e),
            }
        }
        log::debug!("Broadcast {} to {} peers", packet.type_name(), sent);
        sent
    }

    async fn session(&self, endpoint: &SocketAddr) -> Result<Arc<Connection>, PeerError> {
        let conn = self
            .peer_manager
            .get(endpoint)
            .await
            .ok_or(PeerError::Disconnected)?;
        if !conn.is_acknowledged() {
            return Err(PeerError::Disconnected);
        }
        Ok(conn)
    }

    async fn track(&self, endpoint: &SocketAddr, packet: &Packet) -> Option<oneshot::Receiver<Packet>> {
        let response = response_command(self.handler.as_ref(), packet.command())?;
        Some(self.requests.register(*endpoint, response).await)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(SocketAddr, Packet)>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some((from, packet)) => self.handle_packet(from, packet).await,
                None => break,
            }
        }
    }

    async fn handle_packet(&self, from: SocketAddr, packet: Packet) {
        log::debug!("Received {} from {}", packet.type_name(), from);

        let Some(packet) = self.requests.complete(from, packet).await else {
            return;
        };
        let Some(conn) = self.peer_manager.get(&from).await else {
            return;
        };

        match packet {
            Packet::NetPing(nonce) => {
                if let Err(e) = conn.send_async(Packet::NetPong(nonce)) {
                    log::debug!("Could not answer ping from {}: {}", from, e);
                }
            }
            Packet::NetPong(nonce) => match conn.complete_ping(nonce) {
                Some(rtt) => log::debug!("Ping to {}: {}ms", from, rtt.as_millis()),
                None => log::debug!("Unexpected pong from {}", from),
            },
            Packet::RequestPeers { endpoint, max_peers } => {
                let max = max_peers.min(self.config.max_peers_per_request) as usize;
                let peers: Vec<SocketAddr> = self
                    .addrman
                    .read()
                    .await
                    .get_addr(max, self.config.max_getaddr_percent)
                    .into_iter()
                    .filter(|ep| *ep != endpoint && *ep != from)
                    .collect();
                log::debug!("Sending {} addresses to {}", peers.len(), from);
                if let Err(e) = conn.send_async(Packet::RequestPeersResp(peers)) {
                    log::debug!("Could not answer peer request from {}: {}", from, e);
                }
            }
            Packet::RequestPeersResp(peers) => {
                let source = self.address_of(&conn);
                self.merge_peers(source, peers).await;
            }
            Packet::Disconnect(reason) => {
                log::info!("{} disconnected us: {:?}", from, reason);
                conn.token().cancel();
            }
            Packet::Version(_) | Packet::VerAck(_) => {
                log::warn!("{} repeated the handshake", from);
                self.disconnect(&from, DisconnectReason::ProtocolViolation)
                    .await;
            }
            Packet::Opaque { command, body } => {
                if let Some(reply) = self.handler.handle(from, command, body) {
                    if let Err(e) = conn.send_async(reply) {
                        log::warn!("Could not reply to {}: {}", from, e);
                    }
                }
            }
        }
    }

    /// Add relayed addresses to the address manager and queue the new ones
    /// for feeler testing
    pub async fn merge_peers(&self, source: SocketAddr, peers: Vec<SocketAddr>) -> usize {
        let mut fresh = Vec::new();
        let added = {
            let mut addrman = self.addrman.write().await;
            let mut added = 0;
            for ep in peers {
                let known = addrman.contains(&ep);
                if addrman.add_new(ep, source, RELAY_PENALTY) {
                    added += 1;
                    if !known {
                        fresh.push(ep);
                    }
                }
            }
            added
        };

        let mut queue = self.feeler_queue.lock().await;
        for ep in fresh {
            if queue.len() >= MAX_FEELER_QUEUE {
                break;
            }
            queue.push_back(ep);
        }

        log::debug!("Merged {} addresses from {}", added, source);
        added
    }

    /// Next address waiting for a priority feeler probe
    pub async fn next_feeler_candidate(&self) -> Option<SocketAddr> {
        self.feeler_queue.lock().await.pop_front()
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    async fn dial_seeds(self: &Arc<Self>) {
        let anchors = self.addrman.read().await.anchors().to_vec();
        let mut seeds = anchors;
        for ep in &self.config.static_peers {
            if !seeds.contains(ep) {
                seeds.push(*ep);
            }
        }
        if seeds.is_empty() {
            return;
        }

        log::info!("Dialing {} anchor and static peers", seeds.len());
        let attempts = seeds.iter().map(|ep| self.connect_to(*ep, Direction::Outbound));
        let results = futures::future::join_all(attempts).await;
        for (ep, result) in seeds.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("Could not connect to seed {}: {}", ep, e);
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>) {
        let Some(bootstrap) = self.config.bootstrap_endpoint else {
            return;
        };
        if self.is_self(&bootstrap).await {
            log::info!("This node is the bootstrap node, skipping discovery");
            return;
        }
        if self.peer_manager.outbound_count().await >= BOOTSTRAP_MIN_PEERS {
            log::info!("Already connected to enough peers, skipping bootstrap");
            return;
        }

        let rounds = self.config.bootstrap_rounds;
        for round in 1..=rounds {
            if self.token.is_cancelled() {
                return;
            }
            log::info!("Bootstrap round {}/{} via {}", round, rounds, bootstrap);

            match self.bootstrap_round(bootstrap).await {
                Ok(connected) if connected >= BOOTSTRAP_MIN_PEERS => {
                    log::info!("Bootstrap complete with {} peers", connected);
                    if !self.config.static_peers.contains(&bootstrap) {
                        self.disconnect(&bootstrap, DisconnectReason::BootstrapDone)
                            .await;
                    }
                    return;
                }
                Ok(connected) => {
                    log::warn!("Bootstrap round {} reached only {} peers", round, connected)
                }
                Err(PeerError::SelfConnection) => {
                    log::info!(
                        "Bootstrap endpoint {} is this node, skipping discovery",
                        bootstrap
                    );
                    return;
                }
                Err(e) => log::warn!("Bootstrap round {} failed: {}", round, e),
            }

            let backoff = self.config.bootstrap_backoff() * round;
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        log::warn!(
            "Bootstrap discovery failed, keeping {} as a permanent peer",
            bootstrap
        );
        self.bootstrap_fallback.store(true, Ordering::Release);
        if self.peer_manager.get(&bootstrap).await.is_none() {
            if let Err(e) = self.connect_to(bootstrap, Direction::Outbound).await {
                log::error!("Could not reach bootstrap node {}: {}", bootstrap, e);
            }
        }
    }

    /// One discovery round. Returns outbound peers other than the bootstrap.
    async fn bootstrap_round(self: &Arc<Self>, bootstrap: SocketAddr) -> Result<usize, PeerError> {
        if self.peer_manager.get(&bootstrap).await.is_none() {
            self.connect_to(bootstrap, Direction::Outbound).await?;
        }

        let response = self
            .request(
                &bootstrap,
                Packet::RequestPeers {
                    endpoint: self.listen_endpoint(),
                    max_peers: self.config.max_peers_per_request,
                },
            )
            .await?;
        let Packet::RequestPeersResp(mut peers) = response else {
            return Err(PeerError::ProtocolViolation(
                "unexpected bootstrap response".to_string(),
            ));
        };
        if peers.is_empty() {
            return Err(PeerError::Discovery("bootstrap returned no peers".to_string()));
        }

        self.addrman.write().await.add_many(&peers, bootstrap, 0);
        peers.shuffle(&mut rand::thread_rng());

        for ep in peers {
            if self.others_outbound(bootstrap).await >= BOOTSTRAP_MIN_PEERS {
                break;
            }
            if ep == bootstrap || self.is_self(&ep).await {
                continue;
            }
            if let Err(e) = self.connect_to(ep, Direction::Outbound).await {
                log::debug!("Bootstrap candidate {} failed: {}", ep, e);
            }
        }

        Ok(self.others_outbound(bootstrap).await)
    }

    async fn others_outbound(&self, except: SocketAddr) -> usize {
        self.peer_manager
            .outbound()
            .await
            .iter()
            .filter(|c| c.receiver() != except)
            .count()
    }

    // =========================================================================
    // Rebalance
    // =========================================================================

    async fn rebalance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.rebalance_interval());
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => self.rebalance().await,
            }
        }
    }

    /// Mark outbound peers good, drop stuck connects and top up outbound
    pub async fn rebalance(self: &Arc<Self>) {
        let outbound = self.peer_manager.outbound().await;
        let endpoints: Vec<SocketAddr> = outbound.iter().map(|c| c.receiver()).collect();
        self.mark_good(&endpoints).await;

        for (endpoint, token) in self
            .peer_manager
            .stale_connecting(self.config.connecting_force_timeout())
            .await
        {
            log::warn!("Connection to {} stuck, forcing disconnect", endpoint);
            token.cancel();
        }

        let expired = self.requests.expire(self.config.read_timeout()).await;
        if expired > 0 {
            log::debug!("Expired {} unanswered requests", expired);
        }

        let missing = self.config.min_outbound.saturating_sub(outbound.len());
        for _ in 0..missing {
            let Some(candidate) = self.select_candidate(false).await else {
                break;
            };
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.connect_to(candidate, Direction::Outbound).await {
                    log::debug!("Outbound top-up to {} failed: {}", candidate, e);
                }
            });
        }

        let pools = self.peer_manager.stats().await;
        let store = self.addrman.read().await.stats();
        log::info!(
            "Peers: {} out, {} in, {} connecting; addresses: {} tried, {} new",
            pools.outbound,
            pools.inbound,
            pools.connecting,
            store.tried,
            store.new
        );
    }

    /// Record working outbound peers as tried, adding any the store has
    /// never seen (static peers, bootstrap)
    async fn mark_good(&self, endpoints: &[SocketAddr]) {
        let mut addrman = self.addrman.write().await;
        for endpoint in endpoints {
            if !addrman.contains(endpoint) {
                addrman.add_new(*endpoint, *endpoint, 0);
            }
            addrman.good(endpoint, true);
        }
    }

    /// Draw an address that is neither us nor already connected
    pub async fn select_candidate(&self, new_only: bool) -> Option<SocketAddr> {
        for _ in 0..SELECT_TRIES {
            let (candidate, _) = self.addrman.read().await.select(new_only)?;
            if self.is_self(&candidate).await
                || self.peer_manager.is_known(&candidate).await
                || self.peer_manager.is_listening_peer(&candidate).await
            {
                continue;
            }
            return Some(candidate);
        }
        None
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    async fn persistence_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.save_interval());
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.save_peers().await {
                        log::error!("Failed to save peer addresses: {}", e);
                    }
                }
            }
        }
    }

    /// Write the address manager to disk, current outbound peers as anchors
    pub async fn save_peers(&self) -> Result<(), StorageError> {
        let anchors: Vec<SocketAddr> = self
            .peer_manager
            .outbound()
            .await
            .iter()
            .map(|c| c.receiver())
            .collect();

        let blob = {
            let mut addrman = self.addrman.write().await;
            addrman.set_anchors(anchors);
            addrman.serialize()
        };

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&blob))
            .await
            .map_err(|e| StorageError::InvalidData(e.to_string()))??;

        log::info!("Saved peer addresses to {}", self.store.peers_path().display());
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn handshake_params(&self, counter: i32) -> HandshakeParams {
        let mut services = self.handler.services();
        if self.is_public_reachable() {
            services |= ServiceFlags::PUBLIC;
        }

        HandshakeParams {
            local: VersionPacket {
                protocol_version: self.config.protocol_version,
                services,
                timestamp: unix_now(),
                chain_height: self.handler.chain_height(),
                listen_endpoint: self.listen_endpoint(),
                node_id: self.node_id,
                syncing: self.handler.syncing(),
            },
            counter,
            max_clock_skew: self.config.max_clock_skew_secs,
            timeout: self.config.handshake_timeout(),
        }
    }

    async fn ack_counter(&self) -> i32 {
        let acknowledged = self.peer_manager.acknowledged().await.len();
        i32::try_from(acknowledged + 1).unwrap_or(i32::MAX)
    }

    /// Address-manager key of a session's peer
    pub fn address_of(&self, conn: &Connection) -> SocketAddr {
        match (conn.direction(), conn.remote_version()) {
            (Direction::Inbound, Some(remote)) => advertised_endpoint(remote, conn.receiver()),
            _ => conn.receiver(),
        }
    }

    /// Whether dialing `endpoint` would reach this process
    pub async fn is_self(&self, endpoint: &SocketAddr) -> bool {
        if let Some(local) = self.local_addr.get() {
            if endpoint == local {
                return true;
            }
            if local.ip().is_unspecified()
                && endpoint.port() == local.port()
                && (endpoint.ip().is_loopback() || endpoint.ip().is_unspecified())
            {
                return true;
            }
        }
        self.self_endpoints.read().await.contains(endpoint)
    }

    async fn note_self(&self, endpoint: SocketAddr) {
        if self.self_endpoints.write().await.insert(endpoint) {
            log::info!("Detected self connection via {}", endpoint);
        }
    }

    async fn note_reflected(&self, reflected: SocketAddr) {
        let port = self.listen_endpoint().port();
        let ours = SocketAddr::new(reflected.ip(), port);
        if self.self_endpoints.write().await.insert(ours) {
            log::info!("Peers see us as {}", ours);
        }
    }

    /// Keep a handshaken peer we could not take as a future candidate
    async fn retain_known(&self, endpoint: SocketAddr) {
        self.addrman.write().await.add_new(endpoint, endpoint, 0);
    }

    pub fn bootstrap_fallback(&self) -> bool {
        self.bootstrap_fallback.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> NodeStats {
        let store = self.addrman.read().await.stats();
        NodeStats {
            pools: self.peer_manager.stats().await,
            tried: store.tried,
            new: store.new,
            collisions: store.collisions,
            pending_requests: self.requests.pending().await,
            public_reachable: self.is_public_reachable(),
        }
    }
}

/// Listening endpoint a peer claims, with an unspecified IP replaced by the
/// one we observed
pub fn advertised_endpoint(remote: &VersionPacket, observed: SocketAddr) -> SocketAddr {
    let claimed = remote.listen_endpoint;
    if claimed.ip().is_unspecified() {
        SocketAddr::new(observed.ip(), claimed.port())
    } else {
        claimed
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub pools: PeerManagerStats,
    pub tried: usize,
    pub new: usize,
    pub collisions: usize,
    pub pending_requests: usize,
    pub public_reachable: bool,
}
