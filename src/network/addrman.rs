//! Address Manager (AddrMan) for peer discovery
//!
//! Bitcoin-style address manager that maintains:
//! - New addresses: heard about but never successfully contacted
//! - Tried addresses: at least one confirmed connection
//!
//! Records live in an arena keyed by integer id. The two tables are flat
//! `bucket * bucket_size` arrays of ids (`-1` marks an empty slot). Bucket
//! and slot coordinates come from a salted double SHA-256 over the endpoint,
//! its network group and (for the new table) the group of the reporting
//! source, so a remote peer cannot predict where its addresses land.

use crate::crypto::cheap_hash;
use crate::network::config::NetworkConfig;
use crate::network::message::{get_endpoint, put_endpoint};
use crate::network::unix_now;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Tried buckets a single network group can spread over
const TRIED_BUCKETS_PER_GROUP: u64 = 8;

/// New buckets a single source group can spread over
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;

/// Maximum number of new-table slots referencing one record
pub const MAX_NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// Addresses not seen for this long are terrible
const HORIZON: i64 = 30 * DAY;

/// Failed attempts without any success before an address is terrible
const RETRIES: u32 = 3;

/// Failures within `MIN_FAIL` that make a once-good address terrible
const MAX_FAILURES: u32 = 10;

const MIN_FAIL: i64 = 7 * DAY;

/// Attempts within this window reduce the selection chance
const RECENT_TRY: i64 = 10 * 60;

/// Failures beyond this no longer reduce the selection chance
const MAX_CHANCE_FAILURES: u32 = 8;

/// How far in the future a last-seen timestamp may be
const FUTURE_SLACK: i64 = 10 * 60;

/// Never call an address terrible within this long of trying it
const GRACE: i64 = 60;

/// Maximum queued tried-table collisions
pub const MAX_COLLISIONS: usize = 10;

/// A tried occupant that succeeded this recently wins its collision
const REPLACEMENT: i64 = 4 * 60 * 60;

/// Unresolved collisions older than this promote the collider
const COLLISION_TEST_WINDOW: i64 = 40 * 60;

/// Ports at or above this are treated as ephemeral
const EPHEMERAL_PORT_START: u16 = 49152;

const DAY: i64 = 24 * 60 * 60;

/// Version byte of the persisted format
const FORMAT_VERSION: u8 = 1;

/// Empty table slot
const EMPTY: i32 = -1;

// =============================================================================
// Errors
// =============================================================================

/// Errors loading a persisted address manager
#[derive(Error, Debug)]
pub enum AddrManError {
    #[error("Persisted data truncated")]
    Truncated,
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("Table dimensions {found:?} do not match configured {expected:?}")]
    DimensionMismatch {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
    #[error("Invalid endpoint encoding")]
    BadEndpoint,
    #[error("Duplicate endpoint {0}")]
    DuplicateEndpoint(SocketAddr),
    #[error("Inconsistent tables: {0}")]
    Inconsistent(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Table dimensions and admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrManConfig {
    pub tried_bucket_count: usize,
    pub new_bucket_count: usize,
    pub bucket_size: usize,
    /// Accept loopback and private addresses
    pub allow_local: bool,
}

impl Default for AddrManConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for AddrManConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            tried_bucket_count: config.tried_bucket_count,
            new_bucket_count: config.new_bucket_count,
            bucket_size: config.bucket_size,
            allow_local: config.allow_local_addresses,
        }
    }
}

// =============================================================================
// Address Record
// =============================================================================

/// Metadata for one known peer endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrRecord {
    /// The peer's listening endpoint
    pub endpoint: SocketAddr,
    /// Endpoint that told us about this address
    pub source: SocketAddr,
    /// When the record was created (unix seconds)
    pub first_seen: i64,
    /// Last time the address was reported or seen online
    pub last_seen: i64,
    /// Last successful connection, 0 if never
    pub last_success: i64,
    /// Last connection attempt, 0 if never
    pub last_attempt: i64,
    /// Failed attempts since the last success
    pub num_failed: u32,
    /// Is this address in the tried table?
    pub in_tried: bool,
    /// Number of new-table slots pointing at this record
    pub ref_count: u32,
}

impl AddrRecord {
    pub fn new(endpoint: SocketAddr, source: SocketAddr, seen: i64, now: i64) -> Self {
        Self {
            endpoint,
            source,
            first_seen: now,
            last_seen: seen,
            last_success: 0,
            last_attempt: 0,
            num_failed: 0,
            in_tried: false,
            ref_count: 0,
        }
    }

    /// Whether this address is not worth keeping when something better
    /// wants its slot
    pub fn is_terrible(&self, now: i64) -> bool {
        // Ephemeral ports rarely point at a listening node
        if self.last_attempt > 0
            && self.num_failed > 0
            && self.endpoint.port() >= EPHEMERAL_PORT_START
        {
            return true;
        }

        if self.last_attempt > 0 && now - self.last_attempt < GRACE {
            return false;
        }

        if self.last_seen > now + FUTURE_SLACK {
            return true;
        }

        if self.last_seen == 0 || now - self.last_seen > HORIZON {
            return true;
        }

        if self.last_success == 0 && self.num_failed >= RETRIES {
            return true;
        }

        if now - self.last_success > MIN_FAIL && self.num_failed >= MAX_FAILURES {
            return true;
        }

        false
    }

    /// Relative selection weight
    pub fn chance(&self, now: i64) -> f64 {
        let mut chance = 1.0;

        if now - self.last_attempt < RECENT_TRY {
            chance *= 0.01;
        }

        chance * 0.66_f64.powi(self.num_failed.min(MAX_CHANCE_FAILURES) as i32)
    }
}

// =============================================================================
// Placement
// =============================================================================

/// Coarse prefix used to limit clustering: /16 for IPv4, /32 for IPv6
pub fn network_group(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            vec![4, o[0], o[1]]
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => network_group(&IpAddr::V4(v4)),
            None => {
                let o = v6.octets();
                vec![6, o[0], o[1], o[2], o[3]]
            }
        },
    }
}

/// Whether an address may be relayed and dialed on the public network
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_routable_v4(&v4),
            None => is_routable_v6(v6),
        },
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast())
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || unique_local || link_local)
}

fn endpoint_key(endpoint: &SocketAddr) -> Vec<u8> {
    let mut key = Vec::with_capacity(19);
    put_endpoint(&mut key, endpoint);
    key
}

fn salted(salt: &[u8; 32], parts: &[&[u8]]) -> u64 {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(salt);
    for part in parts {
        data.extend_from_slice(part);
    }
    cheap_hash(&data)
}

/// Tried bucket for an endpoint. Independent of who reported it.
pub fn tried_bucket(salt: &[u8; 32], endpoint: &SocketAddr, bucket_count: usize) -> usize {
    let group = network_group(&endpoint.ip());
    let h1 = salted(salt, &[&endpoint_key(endpoint)]) % TRIED_BUCKETS_PER_GROUP;
    let h2 = salted(salt, &[&group, &h1.to_le_bytes()]);
    (h2 % bucket_count as u64) as usize
}

/// New bucket for an endpoint as reported by `source`
pub fn new_bucket(
    salt: &[u8; 32],
    endpoint: &SocketAddr,
    source: &SocketAddr,
    bucket_count: usize,
) -> usize {
    let group = network_group(&endpoint.ip());
    let source_group = network_group(&source.ip());
    let h1 = salted(salt, &[&group, &source_group]) % NEW_BUCKETS_PER_SOURCE_GROUP;
    let h2 = salted(salt, &[&source_group, &h1.to_le_bytes()]);
    (h2 % bucket_count as u64) as usize
}

/// Slot within a bucket
pub fn bucket_position(
    salt: &[u8; 32],
    is_new: bool,
    bucket: usize,
    endpoint: &SocketAddr,
    bucket_size: usize,
) -> usize {
    let tag: &[u8] = if is_new { b"N" } else { b"K" };
    let h = salted(
        salt,
        &[tag, &(bucket as u32).to_le_bytes(), &endpoint_key(endpoint)],
    );
    (h % bucket_size as u64) as usize
}

// =============================================================================
// Address Manager
// =============================================================================

/// Counts for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrManStats {
    pub total: usize,
    pub tried: usize,
    pub new: usize,
    pub collisions: usize,
}

/// Salted, bucketed store of peer addresses
#[derive(Debug, Clone)]
pub struct AddrManager {
    config: AddrManConfig,
    /// Random key for bucket assignment
    salt: [u8; 32],
    /// Next record id
    id_count: u32,
    records: HashMap<u32, AddrRecord>,
    by_endpoint: HashMap<SocketAddr, u32>,
    tried: Vec<i32>,
    new: Vec<i32>,
    tried_count: u32,
    new_count: u32,
    /// Previously good outbound peers, dialed first after restart
    anchors: Vec<SocketAddr>,
    /// Records waiting for their tried slot's occupant to be re-tested
    collisions: VecDeque<u32>,
}

impl AddrManager {
    /// Create an empty address manager with a fresh random salt
    pub fn new(config: AddrManConfig) -> Self {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill(&mut salt);
        Self::with_salt(config, salt)
    }

    /// Create with a fixed salt
    pub fn with_salt(config: AddrManConfig, salt: [u8; 32]) -> Self {
        Self {
            config,
            salt,
            id_count: 0,
            records: HashMap::new(),
            by_endpoint: HashMap::new(),
            tried: vec![EMPTY; config.tried_bucket_count * config.bucket_size],
            new: vec![EMPTY; config.new_bucket_count * config.bucket_size],
            tried_count: 0,
            new_count: 0,
            anchors: Vec::new(),
            collisions: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &AddrManConfig {
        &self.config
    }

    pub fn salt(&self) -> &[u8; 32] {
        &self.salt
    }

    /// Get number of addresses
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get number of new addresses
    pub fn new_count(&self) -> usize {
        self.new_count as usize
    }

    /// Get number of tried addresses
    pub fn tried_count(&self) -> usize {
        self.tried_count as usize
    }

    pub fn stats(&self) -> AddrManStats {
        AddrManStats {
            total: self.size(),
            tried: self.tried_count(),
            new: self.new_count(),
            collisions: self.collisions.len(),
        }
    }

    /// Look up the record for an endpoint
    pub fn find(&self, endpoint: &SocketAddr) -> Option<&AddrRecord> {
        self.by_endpoint
            .get(endpoint)
            .and_then(|id| self.records.get(id))
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.by_endpoint.contains_key(endpoint)
    }

    pub fn anchors(&self) -> &[SocketAddr] {
        &self.anchors
    }

    pub fn set_anchors(&mut self, anchors: Vec<SocketAddr>) {
        self.anchors = anchors;
    }

    /// Endpoints queued in the collision list
    pub fn collisions(&self) -> Vec<SocketAddr> {
        self.collisions
            .iter()
            .filter_map(|id| self.records.get(id))
            .map(|r| r.endpoint)
            .collect()
    }

    pub fn get_tried_bucket(&self, endpoint: &SocketAddr) -> usize {
        tried_bucket(&self.salt, endpoint, self.config.tried_bucket_count)
    }

    pub fn get_new_bucket(&self, endpoint: &SocketAddr, source: &SocketAddr) -> usize {
        new_bucket(&self.salt, endpoint, source, self.config.new_bucket_count)
    }

    pub fn get_bucket_position(&self, is_new: bool, bucket: usize, endpoint: &SocketAddr) -> usize {
        bucket_position(&self.salt, is_new, bucket, endpoint, self.config.bucket_size)
    }

    /// Whether an endpoint may enter the tables at all
    pub fn is_acceptable(&self, endpoint: &SocketAddr) -> bool {
        if endpoint.port() == 0 || endpoint.ip().is_unspecified() {
            return false;
        }
        self.config.allow_local || is_routable(&endpoint.ip())
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Add or refresh a candidate address in the new table.
    ///
    /// `penalty` (seconds) is subtracted from the last-seen time of
    /// addresses relayed by a third party. Returns true when a new-table
    /// slot was taken.
    pub fn add_new(&mut self, endpoint: SocketAddr, source: SocketAddr, penalty: i64) -> bool {
        self.add_new_at(endpoint, source, penalty, unix_now())
    }

    /// Add several addresses from one source
    pub fn add_many(&mut self, endpoints: &[SocketAddr], source: SocketAddr, penalty: i64) -> usize {
        let now = unix_now();
        endpoints
            .iter()
            .filter(|ep| self.add_new_at(**ep, source, penalty, now))
            .count()
    }

    /// Mark a successful connection, promoting the address to tried.
    ///
    /// With `test_before_evict`, an occupied tried slot queues the address
    /// as a collision instead of evicting the occupant.
    pub fn good(&mut self, endpoint: &SocketAddr, test_before_evict: bool) -> bool {
        self.good_at(endpoint, test_before_evict, unix_now())
    }

    /// Record a connection attempt
    pub fn attempt(&mut self, endpoint: &SocketAddr, count_failure: bool) {
        self.attempt_at(endpoint, count_failure, unix_now())
    }

    /// Pick an address to connect to, weighted by each record's chance.
    /// Returns the endpoint and its last attempt time.
    pub fn select(&self, new_only: bool) -> Option<(SocketAddr, i64)> {
        self.select_at(new_only, unix_now())
    }

    /// Addresses to share in a peer-exchange response
    pub fn get_addr(&self, max_addresses: usize, max_percent: usize) -> Vec<SocketAddr> {
        self.get_addr_at(max_addresses, max_percent, unix_now())
    }

    /// Drop an address from the new table (failed feeler probe)
    pub fn remove_from_new(&mut self, endpoint: &SocketAddr) -> bool {
        let Some(&id) = self.by_endpoint.get(endpoint) else {
            return false;
        };
        if self.records[&id].in_tried {
            return false;
        }

        for bucket in 0..self.config.new_bucket_count {
            let pos = self.get_bucket_position(true, bucket, endpoint);
            let idx = self.new_index(bucket, pos);
            if self.new[idx] == id as i32 {
                self.clear_new(idx);
            }
        }
        // A record only reachable through collisions or never placed
        if self.records.get(&id).map(|r| r.ref_count == 0).unwrap_or(false) {
            self.delete(id);
        }
        true
    }

    /// Count a failed contact with a tried address; terrible ones are dropped
    pub fn record_tried_failure(&mut self, endpoint: &SocketAddr) -> bool {
        let now = unix_now();
        self.attempt_at(endpoint, true, now);

        let Some(&id) = self.by_endpoint.get(endpoint) else {
            return false;
        };
        let record = &self.records[&id];
        if !record.in_tried || !record.is_terrible(now) {
            return false;
        }

        let bucket = self.get_tried_bucket(endpoint);
        let pos = self.get_bucket_position(false, bucket, endpoint);
        let idx = self.tried_index(bucket, pos);
        if self.tried[idx] == id as i32 {
            self.tried[idx] = EMPTY;
        }
        self.tried_count = self.tried_count.saturating_sub(1);
        self.delete(id);
        log::debug!("Evicted terrible tried address {}", endpoint);
        true
    }

    /// Resolve collisions that need no probe and pick one that does.
    /// Returns `(collider, occupant)`; the occupant should be re-tested.
    pub fn select_tried_collision(&mut self) -> Option<(SocketAddr, SocketAddr)> {
        self.resolve_collisions_at(unix_now());

        let ids: Vec<u32> = self.collisions.iter().copied().collect();
        let id = *ids.choose(&mut rand::thread_rng())?;
        let collider = self.records.get(&id)?.endpoint;
        let occupant = self.tried_occupant(&collider)?;
        Some((collider, self.records.get(&occupant)?.endpoint))
    }

    /// Apply the outcome of re-testing a collision's occupant
    pub fn resolve_collision(&mut self, collider: &SocketAddr, occupant_alive: bool) {
        let now = unix_now();
        let Some(&id) = self.by_endpoint.get(collider) else {
            return;
        };
        self.collisions.retain(|c| *c != id);

        let Some(occupant_id) = self.tried_occupant(collider) else {
            self.promote(id, now);
            return;
        };
        let occupant = self.records[&occupant_id].endpoint;

        if occupant_alive {
            self.good_at(&occupant, false, now);
            log::debug!("Collision: {} keeps its slot over {}", occupant, collider);
        } else {
            self.attempt_at(&occupant, true, now);
            self.make_tried(id);
            log::debug!("Collision: {} replaced unreachable {}", collider, occupant);
        }
    }

    // =========================================================================
    // Time-explicit implementations
    // =========================================================================

    pub(crate) fn add_new_at(
        &mut self,
        endpoint: SocketAddr,
        source: SocketAddr,
        penalty: i64,
        now: i64,
    ) -> bool {
        if !self.is_acceptable(&endpoint) {
            return false;
        }

        // Self-announcements are not penalized
        let penalty = if endpoint == source { 0 } else { penalty.max(0) };
        let seen = now - penalty;

        let id = match self.by_endpoint.get(&endpoint).copied() {
            Some(id) => {
                let Some(record) = self.records.get_mut(&id) else {
                    return false;
                };

                let online = now - record.last_seen < DAY;
                let update_interval = if online { 60 * 60 } else { DAY };
                if record.last_seen < seen - update_interval {
                    record.last_seen = seen;
                }

                if record.in_tried || record.ref_count >= MAX_NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }

                // Each existing reference halves the odds of another one
                if record.ref_count > 0 {
                    let factor = 1u64 << record.ref_count;
                    if rand::thread_rng().gen_range(0..factor) != 0 {
                        return false;
                    }
                }
                id
            }
            None => self.create(endpoint, source, seen, now),
        };

        let bucket = self.get_new_bucket(&endpoint, &source);
        let pos = self.get_bucket_position(true, bucket, &endpoint);
        let idx = self.new_index(bucket, pos);
        let occupant = self.new[idx];
        if occupant == id as i32 {
            return false;
        }

        let ref_count = self.records[&id].ref_count;
        let mut insert = occupant == EMPTY;
        if !insert {
            let existing = &self.records[&(occupant as u32)];
            if existing.is_terrible(now) || (existing.ref_count > 1 && ref_count == 0) {
                log::debug!(
                    "Evicting {} from new table for {}",
                    existing.endpoint,
                    endpoint
                );
                insert = true;
            }
        }

        if insert {
            self.clear_new(idx);
            if let Some(record) = self.records.get_mut(&id) {
                if record.ref_count == 0 {
                    self.new_count += 1;
                }
                record.ref_count += 1;
            }
            self.new[idx] = id as i32;
        } else if ref_count == 0 {
            self.delete(id);
        }

        insert
    }

    pub(crate) fn good_at(&mut self, endpoint: &SocketAddr, test_before_evict: bool, now: i64) -> bool {
        let Some(&id) = self.by_endpoint.get(endpoint) else {
            return false;
        };
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };

        record.last_success = now;
        record.last_attempt = now;
        record.num_failed = 0;

        if record.in_tried || record.ref_count == 0 {
            return false;
        }

        if test_before_evict {
            if let Some(occupant) = self.tried_occupant(endpoint) {
                if occupant != id {
                    if !self.collisions.contains(&id) && self.collisions.len() < MAX_COLLISIONS {
                        self.collisions.push_back(id);
                        log::debug!(
                            "Tried collision for {} (occupied by {})",
                            endpoint,
                            self.records[&occupant].endpoint
                        );
                    }
                    return false;
                }
            }
        }

        self.make_tried(id);
        true
    }

    pub(crate) fn attempt_at(&mut self, endpoint: &SocketAddr, count_failure: bool, now: i64) {
        let Some(record) = self
            .by_endpoint
            .get(endpoint)
            .and_then(|id| self.records.get_mut(id))
        else {
            return;
        };

        record.last_attempt = now;
        if count_failure {
            record.num_failed = record.num_failed.saturating_add(1);
        }
    }

    pub(crate) fn select_at(&self, new_only: bool, now: i64) -> Option<(SocketAddr, i64)> {
        if self.records.is_empty() || (new_only && self.new_count == 0) {
            return None;
        }
        if self.tried_count == 0 && self.new_count == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        let use_tried =
            !new_only && self.tried_count > 0 && (self.new_count == 0 || rng.gen_bool(0.5));
        let (table, bucket_count) = if use_tried {
            (&self.tried, self.config.tried_bucket_count)
        } else {
            (&self.new, self.config.new_bucket_count)
        };
        let size = self.config.bucket_size;

        let mut chance_factor = 1.0;
        loop {
            let bucket = rng.gen_range(0..bucket_count);
            let start = rng.gen_range(0..size);
            let slot = (0..size)
                .map(|i| table[bucket * size + (start + i) % size])
                .find(|id| *id != EMPTY);
            let Some(id) = slot else {
                continue;
            };
            let record = self.records.get(&(id as u32))?;

            if rng.gen::<f64>() < chance_factor * record.chance(now) {
                return Some((record.endpoint, record.last_attempt));
            }
            chance_factor *= 1.2;
        }
    }

    pub(crate) fn get_addr_at(
        &self,
        max_addresses: usize,
        max_percent: usize,
        now: i64,
    ) -> Vec<SocketAddr> {
        let mut count = self.records.len();
        if max_percent > 0 {
            count = count * max_percent / 100;
        }
        count = count.min(max_addresses);

        let mut ids: Vec<u32> = self.records.keys().copied().collect();
        ids.shuffle(&mut rand::thread_rng());

        ids.iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| !r.is_terrible(now))
            .map(|r| r.endpoint)
            .take(count)
            .collect()
    }

    pub(crate) fn resolve_collisions_at(&mut self, now: i64) {
        let pending: Vec<u32> = self.collisions.iter().copied().collect();

        for id in pending {
            let Some(record) = self.records.get(&id) else {
                self.collisions.retain(|c| *c != id);
                continue;
            };
            if record.in_tried || record.ref_count == 0 {
                self.collisions.retain(|c| *c != id);
                continue;
            }
            let endpoint = record.endpoint;
            let queued_at = record.last_success;

            let Some(occupant_id) = self.tried_occupant(&endpoint) else {
                self.collisions.retain(|c| *c != id);
                self.promote(id, now);
                continue;
            };
            let occupant = &self.records[&occupant_id];

            if now - occupant.last_success < REPLACEMENT {
                // Occupant is demonstrably alive
                self.collisions.retain(|c| *c != id);
            } else if occupant.last_attempt > queued_at
                && occupant.num_failed > 0
                && occupant.last_success < occupant.last_attempt
            {
                // Occupant was probed after the collision and failed
                self.collisions.retain(|c| *c != id);
                self.make_tried(id);
            } else if now - queued_at > COLLISION_TEST_WINDOW {
                self.collisions.retain(|c| *c != id);
                self.make_tried(id);
            }
        }
    }

    // =========================================================================
    // Private helpers
    // =========================================================================

    fn tried_index(&self, bucket: usize, pos: usize) -> usize {
        bucket * self.config.bucket_size + pos
    }

    fn new_index(&self, bucket: usize, pos: usize) -> usize {
        bucket * self.config.bucket_size + pos
    }

    /// Id currently holding the tried slot an endpoint maps to
    fn tried_occupant(&self, endpoint: &SocketAddr) -> Option<u32> {
        let bucket = self.get_tried_bucket(endpoint);
        let pos = self.get_bucket_position(false, bucket, endpoint);
        let id = self.tried[self.tried_index(bucket, pos)];
        (id != EMPTY).then_some(id as u32)
    }

    fn create(&mut self, endpoint: SocketAddr, source: SocketAddr, seen: i64, now: i64) -> u32 {
        let id = self.id_count;
        self.id_count += 1;
        self.records
            .insert(id, AddrRecord::new(endpoint, source, seen, now));
        self.by_endpoint.insert(endpoint, id);
        id
    }

    fn delete(&mut self, id: u32) {
        if let Some(record) = self.records.remove(&id) {
            self.by_endpoint.remove(&record.endpoint);
        }
        self.collisions.retain(|c| *c != id);
    }

    /// Empty a new-table slot, dropping the record if nothing else holds it
    fn clear_new(&mut self, idx: usize) {
        let occupant = self.new[idx];
        if occupant == EMPTY {
            return;
        }
        self.new[idx] = EMPTY;

        let id = occupant as u32;
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count == 0 {
            self.new_count = self.new_count.saturating_sub(1);
            if !record.in_tried {
                self.delete(id);
            }
        }
    }

    fn promote(&mut self, id: u32, now: i64) {
        if let Some(endpoint) = self.records.get(&id).map(|r| r.endpoint) {
            self.good_at(&endpoint, false, now);
        }
    }

    /// Move a record from the new table into its tried slot, demoting any
    /// occupant back to the new table
    fn make_tried(&mut self, id: u32) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        if record.in_tried {
            return;
        }
        let endpoint = record.endpoint;
        let had_refs = record.ref_count > 0;

        // Remove from new table
        for bucket in 0..self.config.new_bucket_count {
            let pos = self.get_bucket_position(true, bucket, &endpoint);
            let idx = self.new_index(bucket, pos);
            if self.new[idx] == id as i32 {
                self.new[idx] = EMPTY;
            }
        }
        if had_refs {
            self.new_count = self.new_count.saturating_sub(1);
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.ref_count = 0;
        }

        let bucket = self.get_tried_bucket(&endpoint);
        let pos = self.get_bucket_position(false, bucket, &endpoint);
        let idx = self.tried_index(bucket, pos);

        // Demote the occupant
        if self.tried[idx] != EMPTY {
            let old_id = self.tried[idx] as u32;
            self.tried[idx] = EMPTY;
            self.tried_count = self.tried_count.saturating_sub(1);

            if let Some(old) = self.records.get_mut(&old_id) {
                old.in_tried = false;
                let (old_endpoint, old_source) = (old.endpoint, old.source);

                let new_bucket = self.get_new_bucket(&old_endpoint, &old_source);
                let new_pos = self.get_bucket_position(true, new_bucket, &old_endpoint);
                let new_idx = self.new_index(new_bucket, new_pos);
                self.clear_new(new_idx);

                if let Some(old) = self.records.get_mut(&old_id) {
                    old.ref_count = 1;
                }
                self.new_count += 1;
                self.new[new_idx] = old_id as i32;
                log::debug!("Moved {} from tried back to new", old_endpoint);
            }
        }

        self.tried[idx] = id as i32;
        self.tried_count += 1;
        if let Some(record) = self.records.get_mut(&id) {
            record.in_tried = true;
        }
        log::debug!("Promoted {} to tried", endpoint);
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Verify that tables, records and counters agree
    pub fn check(&self) -> Result<(), String> {
        let size = self.config.bucket_size;
        let mut refs: HashMap<u32, u32> = HashMap::new();
        let mut tried_seen = 0u32;

        for (idx, &slot) in self.tried.iter().enumerate() {
            if slot == EMPTY {
                continue;
            }
            let id = slot as u32;
            let record = self
                .records
                .get(&id)
                .ok_or_else(|| format!("tried slot {} references missing id {}", idx, id))?;
            if !record.in_tried {
                return Err(format!("{} in tried table but not marked tried", record.endpoint));
            }
            let bucket = self.get_tried_bucket(&record.endpoint);
            let pos = self.get_bucket_position(false, bucket, &record.endpoint);
            if idx != bucket * size + pos {
                return Err(format!("{} in wrong tried slot", record.endpoint));
            }
            tried_seen += 1;
        }

        for (idx, &slot) in self.new.iter().enumerate() {
            if slot == EMPTY {
                continue;
            }
            let id = slot as u32;
            let record = self
                .records
                .get(&id)
                .ok_or_else(|| format!("new slot {} references missing id {}", idx, id))?;
            let bucket = idx / size;
            if idx % size != self.get_bucket_position(true, bucket, &record.endpoint) {
                return Err(format!("{} in wrong new slot", record.endpoint));
            }
            *refs.entry(id).or_default() += 1;
        }

        let mut new_seen = 0u32;
        for (id, record) in &self.records {
            let counted = refs.get(id).copied().unwrap_or(0);
            if counted != record.ref_count {
                return Err(format!(
                    "{} has ref_count {} but {} new slots",
                    record.endpoint, record.ref_count, counted
                ));
            }
            if record.in_tried && record.ref_count != 0 {
                return Err(format!("{} is tried and referenced from new", record.endpoint));
            }
            if !record.in_tried && record.ref_count == 0 {
                return Err(format!("{} is orphaned", record.endpoint));
            }
            if record.ref_count > 0 {
                new_seen += 1;
            }
            if *id >= self.id_count {
                return Err(format!("id {} beyond id counter {}", id, self.id_count));
            }
            if self.by_endpoint.get(&record.endpoint) != Some(id) {
                return Err(format!("{} missing from endpoint index", record.endpoint));
            }
        }

        if self.by_endpoint.len() != self.records.len() {
            return Err("endpoint index size mismatch".to_string());
        }
        if tried_seen != self.tried_count {
            return Err(format!(
                "tried count {} but {} tried slots",
                self.tried_count, tried_seen
            ));
        }
        if new_seen != self.new_count {
            return Err(format!("new count {} but {} new records", self.new_count, new_seen));
        }
        if let Some(id) = self.collisions.iter().find(|id| !self.records.contains_key(id)) {
            return Err(format!("collision references missing id {}", id));
        }
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Encode the complete state
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            64 + 4 * (self.tried.len() + self.new.len()) + 64 * self.records.len(),
        );

        buf.put_u8(FORMAT_VERSION);
        buf.put_u32(self.config.tried_bucket_count as u32);
        buf.put_u32(self.config.new_bucket_count as u32);
        buf.put_u32(self.config.bucket_size as u32);

        buf.put_slice(&self.salt);
        buf.put_u32(self.id_count);
        buf.put_u32(self.tried_count);
        buf.put_u32(self.new_count);

        for slot in &self.tried {
            buf.put_i32(*slot);
        }
        for slot in &self.new {
            buf.put_i32(*slot);
        }

        let mut ids: Vec<&u32> = self.records.keys().collect();
        ids.sort();
        buf.put_u32(ids.len() as u32);
        for id in ids {
            let record = &self.records[id];
            buf.put_u32(*id);
            put_endpoint(&mut buf, &record.endpoint);
            put_endpoint(&mut buf, &record.source);
            buf.put_i64(record.first_seen);
            buf.put_i64(record.last_seen);
            buf.put_i64(record.last_success);
            buf.put_i64(record.last_attempt);
            buf.put_u32(record.num_failed);
            buf.put_u8(record.in_tried as u8);
            buf.put_u32(record.ref_count);
        }

        buf.put_u32(self.anchors.len() as u32);
        for anchor in &self.anchors {
            put_endpoint(&mut buf, anchor);
        }

        buf.put_u32(self.collisions.len() as u32);
        for id in &self.collisions {
            buf.put_u32(*id);
        }

        buf.freeze()
    }

    /// Decode state written by [`AddrManager::serialize`]
    pub fn deserialize(config: AddrManConfig, mut data: &[u8]) -> Result<Self, AddrManError> {
        let buf = &mut data;

        need(buf, 1 + 12)?;
        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(AddrManError::UnsupportedVersion(version));
        }
        let found = (
            buf.get_u32() as usize,
            buf.get_u32() as usize,
            buf.get_u32() as usize,
        );
        let expected = (
            config.tried_bucket_count,
            config.new_bucket_count,
            config.bucket_size,
        );
        if found != expected {
            return Err(AddrManError::DimensionMismatch { expected, found });
        }

        let mut store = Self::with_salt(config, [0u8; 32]);

        need(buf, 32 + 12)?;
        buf.copy_to_slice(&mut store.salt);
        store.id_count = buf.get_u32();
        store.tried_count = buf.get_u32();
        store.new_count = buf.get_u32();

        need(buf, 4 * (store.tried.len() + store.new.len()))?;
        for slot in store.tried.iter_mut() {
            *slot = buf.get_i32();
        }
        for slot in store.new.iter_mut() {
            *slot = buf.get_i32();
        }

        need(buf, 4)?;
        let count = buf.get_u32();
        for _ in 0..count {
            need(buf, 4)?;
            let id = buf.get_u32();
            let endpoint = get_endpoint(buf).ok_or(AddrManError::BadEndpoint)?;
            let source = get_endpoint(buf).ok_or(AddrManError::BadEndpoint)?;
            need(buf, 8 * 4 + 4 + 1 + 4)?;
            let record = AddrRecord {
                endpoint,
                source,
                first_seen: buf.get_i64(),
                last_seen: buf.get_i64(),
                last_success: buf.get_i64(),
                last_attempt: buf.get_i64(),
                num_failed: buf.get_u32(),
                in_tried: buf.get_u8() != 0,
                ref_count: buf.get_u32(),
            };
            if store.by_endpoint.insert(endpoint, id).is_some() {
                return Err(AddrManError::DuplicateEndpoint(endpoint));
            }
            store.records.insert(id, record);
        }

        need(buf, 4)?;
        let count = buf.get_u32();
        for _ in 0..count {
            let anchor = get_endpoint(buf).ok_or(AddrManError::BadEndpoint)?;
            store.anchors.push(anchor);
        }

        need(buf, 4)?;
        let count = buf.get_u32() as usize;
        need(buf, 4 * count)?;
        for _ in 0..count {
            store.collisions.push_back(buf.get_u32());
        }

        store.check().map_err(AddrManError::Inconsistent)?;
        Ok(store)
    }
}

impl Default for AddrManager {
    fn default() -> Self {
        Self::new(AddrManConfig::default())
    }
}

fn need(buf: &&[u8], n: usize) -> Result<(), AddrManError> {
    if buf.remaining() < n {
        return Err(AddrManError::Truncated);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn small_config() -> AddrManConfig {
        AddrManConfig {
            tried_bucket_count: 16,
            new_bucket_count: 64,
            bucket_size: 16,
            allow_local: false,
        }
    }

    fn mgr() -> AddrManager {
        AddrManager::with_salt(small_config(), [7u8; 32])
    }

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn candidates() -> impl Iterator<Item = SocketAddr> {
        (0..=u16::MAX).map(|i| SocketAddr::from(([10, (i >> 8) as u8, i as u8, 9], 18750)))
    }

    /// An endpoint in 10/8 sharing `target`'s new slot under `source`
    fn new_slot_twin(m: &AddrManager, target: &SocketAddr, source: &SocketAddr) -> SocketAddr {
        let bucket = m.get_new_bucket(target, source);
        let pos = m.get_bucket_position(true, bucket, target);
        candidates()
            .find(|c| {
                c != target
                    && m.get_new_bucket(c, source) == bucket
                    && m.get_bucket_position(true, bucket, c) == pos
            })
            .expect("no twin found")
    }

    /// An endpoint in 10/8 sharing `target`'s tried slot
    fn tried_slot_twin(m: &AddrManager, target: &SocketAddr) -> SocketAddr {
        let bucket = m.get_tried_bucket(target);
        let pos = m.get_bucket_position(false, bucket, target);
        candidates()
            .find(|c| {
                c != target
                    && m.get_tried_bucket(c) == bucket
                    && m.get_bucket_position(false, bucket, c) == pos
            })
            .expect("no twin found")
    }

    fn routable_config() -> AddrManConfig {
        // 10/8 is private; tests that place 10.1/16 twins allow local
        AddrManConfig {
            allow_local: true,
            ..small_config()
        }
    }

    #[test]
    fn test_add_address() {
        let mut m = mgr();
        let a = ep("8.8.8.8:8333");
        assert!(m.add_new_at(a, a, 0, NOW));

        // Adding the same address from the same source takes no new slot
        assert!(!m.add_new_at(a, a, 0, NOW));

        assert_eq!(m.size(), 1);
        assert_eq!(m.new_count(), 1);
        assert_eq!(m.tried_count(), 0);
        assert_eq!(m.find(&a).unwrap().ref_count, 1);
        m.check().unwrap();
    }

    #[test]
    fn test_unroutable_rejected() {
        let mut m = mgr();
        let local = ep("127.0.0.1:8333");
        assert!(!m.add_new_at(local, local, 0, NOW));
        assert!(!m.add_new_at(ep("192.168.1.4:8333"), local, 0, NOW));
        assert_eq!(m.size(), 0);

        let mut permissive = AddrManager::with_salt(routable_config(), [7u8; 32]);
        assert!(permissive.add_new_at(local, local, 0, NOW));
    }

    #[test]
    fn test_bucket_determinism() {
        let m = mgr();
        let target = ep("45.33.12.9:18750");
        let s1 = ep("1.2.3.4:18750");
        let s2 = ep("99.88.77.66:18750");

        assert_eq!(m.get_tried_bucket(&target), m.get_tried_bucket(&target));
        assert_eq!(m.get_new_bucket(&target, &s1), m.get_new_bucket(&target, &s1));

        // Some source in another group moves the new bucket
        let moved = (0..=255u8)
            .map(|b| SocketAddr::from(([b, 77, 1, 1], 18750)))
            .any(|src| m.get_new_bucket(&target, &src) != m.get_new_bucket(&target, &s1));
        assert!(moved);

        // The tried slot does not depend on who reported the address
        let mut via_s1 = AddrManager::with_salt(small_config(), [7u8; 32]);
        let mut via_s2 = AddrManager::with_salt(small_config(), [7u8; 32]);
        via_s1.add_new_at(target, s1, 0, NOW);
        via_s2.add_new_at(target, s2, 0, NOW);
        via_s1.good_at(&target, false, NOW);
        via_s2.good_at(&target, false, NOW);
        assert_eq!(via_s1.tried, via_s2.tried);

        // A different salt gives an independent layout
        let salted = AddrManager::with_salt(small_config(), [8u8; 32]);
        let differs = (0..=255u8)
            .map(|b| SocketAddr::from(([b, 1, 2, 3], 18750)))
            .any(|e| salted.get_tried_bucket(&e) != m.get_tried_bucket(&e));
        assert!(differs);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let mut m = mgr();
        let e = ep("8.8.8.8:8333");
        let s = ep("1.1.1.1:8333");

        assert!(m.add_new_at(e, s, 0, NOW));
        assert!(m.good_at(&e, false, NOW));

        let record = m.find(&e).unwrap();
        assert!(record.in_tried);
        assert_eq!(record.ref_count, 0);
        assert_eq!(record.last_success, NOW);
        assert_eq!(m.new_count(), 0);
        assert_eq!(m.tried_count(), 1);

        let id = m.by_endpoint[&e] as i32;
        assert!(!m.new.contains(&id));
        m.check().unwrap();

        // Already tried: no-op
        assert!(!m.good_at(&e, false, NOW + 5));
        assert_eq!(m.tried_count(), 1);
    }

    #[test]
    fn test_collision_keeps_occupant() {
        let mut m = AddrManager::with_salt(routable_config(), [7u8; 32]);
        let occupant = ep("10.1.0.1:18750");
        let source = ep("1.1.1.1:18750");
        m.add_new_at(occupant, source, 0, NOW);
        assert!(m.good_at(&occupant, false, NOW));

        let collider = tried_slot_twin(&m, &occupant);
        assert!(m.add_new_at(collider, source, 0, NOW));
        let before = m.find(&occupant).cloned().unwrap();

        assert!(!m.good_at(&collider, true, NOW + 10));

        assert_eq!(m.collisions(), vec![collider]);
        assert_eq!(m.find(&occupant), Some(&before));
        assert!(!m.find(&collider).unwrap().in_tried);
        m.check().unwrap();

        // Queued once only
        m.good_at(&collider, true, NOW + 20);
        assert_eq!(m.collisions().len(), 1);
    }

    #[test]
    fn test_collision_resolution_with_dead_occupant() {
        let mut m = AddrManager::with_salt(routable_config(), [7u8; 32]);
        let occupant = ep("10.1.0.1:18750");
        let source = ep("1.1.1.1:18750");
        m.add_new_at(occupant, source, 0, NOW);
        m.good_at(&occupant, false, NOW);
        let collider = tried_slot_twin(&m, &occupant);
        m.add_new_at(collider, source, 0, NOW);
        m.good_at(&collider, true, NOW);

        m.resolve_collision(&collider, false);

        assert!(m.collisions().is_empty());
        assert!(m.find(&collider).unwrap().in_tried);
        let demoted = m.find(&occupant).unwrap();
        assert!(!demoted.in_tried);
        assert_eq!(demoted.ref_count, 1);
        assert_eq!(demoted.num_failed, 1);
        m.check().unwrap();
    }

    #[test]
    fn test_stale_collision_promotes_collider() {
        let mut m = AddrManager::with_salt(routable_config(), [7u8; 32]);
        let occupant = ep("10.1.0.1:18750");
        let source = ep("1.1.1.1:18750");
        m.add_new_at(occupant, source, 0, NOW - REPLACEMENT - 100);
        m.good_at(&occupant, false, NOW - REPLACEMENT - 100);
        let collider = tried_slot_twin(&m, &occupant);
        m.add_new_at(collider, source, 0, NOW);
        m.good_at(&collider, true, NOW);

        // Inside the test window nothing changes
        m.resolve_collisions_at(NOW + 60);
        assert_eq!(m.collisions().len(), 1);

        m.resolve_collisions_at(NOW + COLLISION_TEST_WINDOW + 1);
        assert!(m.collisions().is_empty());
        assert!(m.find(&collider).unwrap().in_tried);
        m.check().unwrap();
    }

    #[test]
    fn test_terrible_eviction() {
        let mut m = AddrManager::with_salt(routable_config(), [7u8; 32]);
        let source = ep("1.1.1.1:18750");
        let ephemeral = ep("10.1.0.1:50000");
        assert!(m.add_new_at(ephemeral, source, 0, NOW));
        m.attempt_at(&ephemeral, true, NOW - 3600);

        let record = m.find(&ephemeral).unwrap();
        assert!(record.last_attempt > 0 && record.num_failed > 0);
        assert!(record.is_terrible(NOW));

        let newcomer = new_slot_twin(&m, &ephemeral, &source);
        assert!(m.add_new_at(newcomer, source, 0, NOW));

        assert!(m.find(&ephemeral).is_none());
        assert!(m.find(&newcomer).is_some());
        m.check().unwrap();
    }

    #[test]
    fn test_healthy_occupant_not_evicted() {
        let mut m = AddrManager::with_salt(routable_config(), [7u8; 32]);
        let source = ep("1.1.1.1:18750");
        let resident = ep("10.1.0.1:18750");
        m.add_new_at(resident, source, 0, NOW);

        let newcomer = new_slot_twin(&m, &resident, &source);
        assert!(!m.add_new_at(newcomer, source, 0, NOW));
        assert!(m.find(&newcomer).is_none());
        assert!(m.find(&resident).is_some());
        m.check().unwrap();
    }

    #[test]
    fn test_terrible_rules() {
        let e = ep("8.8.8.8:18750");
        let fresh = AddrRecord::new(e, e, NOW, NOW);
        assert!(!fresh.is_terrible(NOW));

        let future = AddrRecord::new(e, e, NOW + 3600, NOW);
        assert!(future.is_terrible(NOW));

        let stale = AddrRecord::new(e, e, NOW - HORIZON - 1, NOW);
        assert!(stale.is_terrible(NOW));

        let mut hopeless = AddrRecord::new(e, e, NOW, NOW);
        hopeless.num_failed = RETRIES;
        hopeless.last_attempt = NOW - 3600;
        assert!(hopeless.is_terrible(NOW));

        // Just tried: grace period
        hopeless.last_attempt = NOW - 10;
        assert!(!hopeless.is_terrible(NOW));

        let mut faded = AddrRecord::new(e, e, NOW, NOW);
        faded.last_success = NOW - MIN_FAIL - 1;
        faded.last_attempt = NOW - 3600;
        faded.num_failed = MAX_FAILURES;
        assert!(faded.is_terrible(NOW));
    }

    #[test]
    fn test_chance() {
        let e = ep("8.8.8.8:18750");
        let mut record = AddrRecord::new(e, e, NOW, NOW);
        assert!((record.chance(NOW) - 1.0).abs() < 1e-9);

        record.last_attempt = NOW - 60;
        assert!((record.chance(NOW) - 0.01).abs() < 1e-9);

        record.last_attempt = NOW - RECENT_TRY - 1;
        record.num_failed = 2;
        assert!((record.chance(NOW) - 0.66 * 0.66).abs() < 1e-9);

        // Capped at eight failures
        record.num_failed = 20;
        assert!((record.chance(NOW) - 0.66_f64.powi(8)).abs() < 1e-9);
    }

    #[test]
    fn test_select_address() {
        let mut m = mgr();
        assert!(m.select_at(false, NOW).is_none());

        let a = ep("1.1.1.1:8333");
        let b = ep("8.8.8.8:8333");
        m.add_new_at(a, a, 0, NOW);
        m.add_new_at(b, b, 0, NOW);

        for _ in 0..20 {
            let (picked, last_attempt) = m.select_at(false, NOW).unwrap();
            assert!(picked == a || picked == b);
            assert_eq!(last_attempt, 0);
        }

        m.good_at(&a, false, NOW);
        m.good_at(&b, false, NOW);
        assert!(m.select_at(true, NOW).is_none());
        assert!(m.select_at(false, NOW).is_some());
    }

    #[test]
    fn test_get_addr() {
        let mut m = mgr();
        for i in 1..10 {
            let a = SocketAddr::from(([8, i, 8, 8], 8333));
            m.add_new_at(a, a, 0, NOW);
        }
        let bad = ep("9.9.9.9:50001");
        m.add_new_at(bad, bad, 0, NOW);
        m.attempt_at(&bad, true, NOW);

        let addrs = m.get_addr_at(5, 100, NOW);
        assert_eq!(addrs.len(), 5);

        let everything = m.get_addr_at(1000, 100, NOW);
        assert_eq!(everything.len(), 9);
        assert!(!everything.contains(&bad));

        // 23% of 10 records
        assert_eq!(m.get_addr_at(1000, 23, NOW).len(), 2);
    }

    #[test]
    fn test_reference_cap() {
        let mut m = mgr();
        let e = ep("8.8.8.8:18750");
        for b in 1..=255u8 {
            let source = SocketAddr::from(([b, 20, 0, 1], 18750));
            m.add_new_at(e, source, 0, NOW);
        }
        let refs = m.find(&e).unwrap().ref_count;
        assert!(refs >= 1 && refs <= MAX_NEW_BUCKETS_PER_ADDRESS);
        assert_eq!(m.new_count(), 1);
        m.check().unwrap();

        // Promotion clears every reference
        m.good_at(&e, false, NOW);
        assert_eq!(m.find(&e).unwrap().ref_count, 0);
        m.check().unwrap();
    }

    #[test]
    fn test_remove_from_new_and_tried_failure() {
        let mut m = mgr();
        let a = ep("8.8.4.4:18750");
        m.add_new_at(a, a, 0, NOW);
        assert!(m.remove_from_new(&a));
        assert!(m.find(&a).is_none());
        assert_eq!(m.new_count(), 0);

        let b = ep("9.9.9.9:50010");
        m.add_new_at(b, b, 0, unix_now());
        m.good(&b, false);
        // First failure on an ephemeral port makes it terrible
        assert!(m.record_tried_failure(&b));
        assert!(m.find(&b).is_none());
        assert_eq!(m.tried_count(), 0);
        m.check().unwrap();
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut m = AddrManager::with_salt(routable_config(), [3u8; 32]);
        let source = ep("1.1.1.1:18750");
        for i in 0..40u8 {
            let a = SocketAddr::from(([10, i, 3, 7], 18750));
            m.add_new_at(a, source, 0, NOW);
        }
        for i in 0..10u8 {
            m.good_at(&SocketAddr::from(([10, i, 3, 7], 18750)), false, NOW);
        }
        m.attempt_at(&SocketAddr::from(([10, 20, 3, 7], 18750)), true, NOW);
        m.set_anchors(vec![SocketAddr::from(([10, 0, 3, 7], 18750))]);
        let collider = tried_slot_twin(&m, &SocketAddr::from(([10, 0, 3, 7], 18750)));
        m.add_new_at(collider, source, 0, NOW);
        m.good_at(&collider, true, NOW);

        let bytes = m.serialize();
        let restored = AddrManager::deserialize(routable_config(), &bytes).unwrap();

        assert_eq!(restored.salt, m.salt);
        assert_eq!(restored.id_count, m.id_count);
        assert_eq!(restored.tried_count, m.tried_count);
        assert_eq!(restored.new_count, m.new_count);
        assert_eq!(restored.tried, m.tried);
        assert_eq!(restored.new, m.new);
        assert_eq!(restored.records, m.records);
        assert_eq!(restored.anchors, m.anchors);
        assert_eq!(restored.collisions, m.collisions);
        assert_eq!(restored.serialize(), bytes);
    }

    #[test]
    fn test_deserialize_errors() {
        let m = mgr();
        let bytes = m.serialize();

        assert!(matches!(
            AddrManager::deserialize(small_config(), &bytes[..bytes.len() - 2]),
            Err(AddrManError::Truncated)
        ));

        let other = AddrManConfig {
            bucket_size: 32,
            ..small_config()
        };
        assert!(matches!(
            AddrManager::deserialize(other, &bytes),
            Err(AddrManError::DimensionMismatch { .. })
        ));

        let mut corrupt = bytes.to_vec();
        corrupt[0] = 99;
        assert!(matches!(
            AddrManager::deserialize(small_config(), &corrupt),
            Err(AddrManError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_network_group() {
        assert_eq!(
            network_group(&"10.1.2.3".parse().unwrap()),
            network_group(&"10.1.200.9".parse().unwrap())
        );
        assert_ne!(
            network_group(&"10.1.2.3".parse().unwrap()),
            network_group(&"10.2.2.3".parse().unwrap())
        );
        assert_eq!(
            network_group(&"::ffff:10.1.2.3".parse().unwrap()),
            network_group(&"10.1.9.9".parse().unwrap())
        );
        assert_eq!(
            network_group(&"2001:db8:1::1".parse().unwrap()),
            network_group(&"2001:db8:ffff::2".parse().unwrap())
        );
    }
}
