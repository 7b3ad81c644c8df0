//! # Swarm Directory
//!
//! Maps an info-hash to the peers that announced themselves for it.
//!
//! ## Bounds
//!
//! | Limit | On overflow |
//! |-------|-------------|
//! | swarms | the swarm with the fewest peers is dropped |
//! | peers per swarm | announces from new peers are ignored |
//! | peers per reply | a uniform random sample is returned |
//!
//! Peers are keyed by `(ip, port)`; re-announcing refreshes the `added` time
//! and seed flag in place. Stale peers are pruned on tick.
//!
//! ## Scrape
//!
//! A scrape reply does not list addresses. It carries two 256-byte bloom
//! filters over peer IPs (seeds and downloaders) from which the requester
//! estimates swarm sizes.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tracing::trace;

use crate::bloom::BloomFilter;
use crate::identity::{ID_LEN, NodeId};

/// Bytes in each scrape bloom filter.
pub const SCRAPE_FILTER_BYTES: usize = 256;

/// Longest swarm name kept.
pub const MAX_NAME_LEN: usize = 100;

pub type ScrapeFilter = BloomFilter<SCRAPE_FILTER_BYTES>;

#[derive(Clone, Copy, Debug)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub added: Instant,
    pub seed: bool,
}

impl PartialEq for PeerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerEntry {}

impl PartialOrd for PeerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .ip()
            .cmp(&other.addr.ip())
            .then_with(|| self.addr.port().cmp(&other.addr.port()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct SwarmEntry {
    name: Option<String>,
    peers: BTreeSet<PeerEntry>,
}

impl SwarmEntry {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Restricts get_peers replies to one slice of a large swarm.
///
/// A peer matches when the top `bits` bits of `BLAKE3(ip || port)` equal the
/// top `bits` bits of `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefixFilter {
    pub bits: u8,
    pub value: [u8; ID_LEN],
}

impl PrefixFilter {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        let mut hasher = blake3::Hasher::new();
        match addr.ip() {
            IpAddr::V4(v4) => hasher.update(&v4.octets()),
            IpAddr::V6(v6) => hasher.update(&v6.octets()),
        };
        hasher.update(&addr.port().to_be_bytes());
        let hash = hasher.finalize();
        let mut prefix = [0u8; ID_LEN];
        prefix.copy_from_slice(&hash.as_bytes()[..ID_LEN]);

        let bits = (self.bits as usize).min(ID_LEN * 8);
        NodeId::from_bytes(prefix).common_prefix_len(&NodeId::from_bytes(self.value)) >= bits
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeersReply {
    Peers(Vec<SocketAddr>),
    Scrape {
        seeds: ScrapeFilter,
        downloaders: ScrapeFilter,
    },
}

#[derive(Debug)]
pub struct SwarmDirectory {
    swarms: HashMap<NodeId, SwarmEntry>,
    max_swarms: usize,
    max_peers: usize,
}

impl SwarmDirectory {
    pub fn new(max_swarms: usize, max_peers: usize) -> Self {
        Self {
            swarms: HashMap::new(),
            max_swarms,
            max_peers,
        }
    }

    /// Insert or refresh `addr` in the swarm for `info_hash`.
    /// Returns false when the swarm is full and the peer was ignored.
    pub fn announce(&mut self, info_hash: NodeId, addr: SocketAddr, seed: bool, now: Instant) -> bool {
        if !self.swarms.contains_key(&info_hash) && self.swarms.len() >= self.max_swarms {
            self.drop_smallest();
        }
        let swarm = self.swarms.entry(info_hash).or_default();
        let entry = PeerEntry {
            addr,
            added: now,
            seed,
        };
        if swarm.peers.contains(&entry) {
            swarm.peers.replace(entry);
            return true;
        }
        if swarm.peers.len() >= self.max_peers {
            trace!(info_hash = %info_hash.short(), %addr, "swarm full, ignoring peer");
            return false;
        }
        swarm.peers.insert(entry);
        true
    }

    /// Give a swarm a display name if it has none yet.
    pub fn set_name(&mut self, info_hash: &NodeId, name: &str) {
        if let Some(swarm) = self.swarms.get_mut(info_hash)
            && swarm.name.is_none()
            && !name.is_empty()
        {
            let mut end = name.len().min(MAX_NAME_LEN);
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            swarm.name = Some(name[..end].to_string());
        }
    }

    pub fn get(&self, info_hash: &NodeId) -> Option<&SwarmEntry> {
        self.swarms.get(info_hash)
    }

    fn drop_smallest(&mut self) {
        let smallest = self
            .swarms
            .iter()
            .min_by_key(|(_, swarm)| swarm.peers.len())
            .map(|(key, _)| *key);
        if let Some(key) = smallest {
            trace!(info_hash = %key.short(), "swarm table full, dropping smallest swarm");
            self.swarms.remove(&key);
        }
    }

    /// Peers for `info_hash`, or `None` if the swarm is unknown.
    pub fn lookup_peers(
        &self,
        info_hash: &NodeId,
        prefix: Option<&PrefixFilter>,
        exclude_seeds: bool,
        scrape: bool,
        max_reply: usize,
    ) -> Option<PeersReply> {
        let swarm = self.swarms.get(info_hash)?;

        if scrape {
            let mut seeds = ScrapeFilter::new();
            let mut downloaders = ScrapeFilter::new();
            for peer in &swarm.peers {
                let filter = if peer.seed { &mut seeds } else { &mut downloaders };
                match peer.addr.ip() {
                    IpAddr::V4(v4) => filter.set(&v4.octets()),
                    IpAddr::V6(v6) => filter.set(&v6.octets()),
                }
            }
            return Some(PeersReply::Scrape { seeds, downloaders });
        }

        let candidates = swarm
            .peers
            .iter()
            .filter(|p| !(exclude_seeds && p.seed))
            .filter(|p| prefix.is_none_or(|f| f.matches(&p.addr)))
            .map(|p| p.addr);
        let sample = candidates.choose_multiple(&mut rand::thread_rng(), max_reply);
        Some(PeersReply::Peers(sample))
    }

    /// Remove peers older than `max_age`. Returns how many were removed.
    pub fn prune_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let mut removed = 0;
        for swarm in self.swarms.values_mut() {
            let before = swarm.len();
            swarm
                .peers
                .retain(|p| now.saturating_duration_since(p.added) < max_age);
            removed += before - swarm.len();
        }
        removed
    }

    /// Remove swarms with no peers left. Returns how many were removed.
    pub fn drop_empty(&mut self) -> usize {
        let before = self.swarms.len();
        self.swarms.retain(|_, swarm| !swarm.is_empty());
        before - self.swarms.len()
    }

    pub fn peer_count(&self) -> usize {
        self.swarms.values().map(SwarmEntry::len).sum()
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn peer(n: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), port))
    }

    fn peers_of(reply: Option<PeersReply>) -> Vec<SocketAddr> {
        match reply {
            Some(PeersReply::Peers(list)) => list,
            other => panic!("expected peer list, got {other:?}"),
        }
    }

    #[test]
    fn announce_dedups_by_ip_and_port() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 10);
        let key = NodeId::random();

        dir.announce(key, peer(1, 6881), false, now);
        dir.announce(key, peer(1, 6881), true, now + Duration::from_secs(5));
        dir.announce(key, peer(1, 6882), false, now);

        assert_eq!(dir.peer_count(), 2);
        let swarm = dir.get(&key).unwrap();
        let refreshed = swarm.peers.iter().find(|p| p.addr == peer(1, 6881)).unwrap();
        assert!(refreshed.seed);
        assert_eq!(refreshed.added, now + Duration::from_secs(5));
    }

    #[test]
    fn unknown_swarm_returns_none() {
        let dir = SwarmDirectory::new(10, 10);
        assert!(dir.lookup_peers(&NodeId::random(), None, false, false, 10).is_none());
    }

    #[test]
    fn lookup_bounds_and_excludes_seeds() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 100);
        let key = NodeId::random();
        for n in 0..30 {
            dir.announce(key, peer(n, 1000), n % 2 == 0, now);
        }

        let sample = peers_of(dir.lookup_peers(&key, None, false, false, 10));
        assert_eq!(sample.len(), 10);

        let downloaders = peers_of(dir.lookup_peers(&key, None, true, false, 100));
        assert_eq!(downloaders.len(), 15);
        assert!(downloaders.iter().all(|a| match a.ip() {
            IpAddr::V4(v4) => v4.octets()[3] % 2 == 1,
            IpAddr::V6(_) => false,
        }));
    }

    #[test]
    fn scrape_reports_estimates() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 100);
        let key = NodeId::random();
        for n in 0..10 {
            dir.announce(key, peer(n, 1000), n < 4, now);
        }
        match dir.lookup_peers(&key, None, false, true, 100) {
            Some(PeersReply::Scrape { seeds, downloaders }) => {
                assert!((3..=5).contains(&seeds.estimated_count()));
                assert!((5..=7).contains(&downloaders.estimated_count()));
            }
            other => panic!("expected scrape, got {other:?}"),
        }
    }

    #[test]
    fn prefix_filter_partitions_swarm() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 1000);
        let key = NodeId::random();
        for n in 0..200 {
            dir.announce(key, peer(n, 2000), false, now);
        }

        let zero = PrefixFilter { bits: 1, value: [0u8; ID_LEN] };
        let one = PrefixFilter { bits: 1, value: [0x80; ID_LEN] };
        let a = peers_of(dir.lookup_peers(&key, Some(&zero), false, false, 1000));
        let b = peers_of(dir.lookup_peers(&key, Some(&one), false, false, 1000));
        assert_eq!(a.len() + b.len(), 200);
        assert!(a.iter().all(|p| !b.contains(p)));

        let everything = PrefixFilter { bits: 0, value: [0u8; ID_LEN] };
        let all = peers_of(dir.lookup_peers(&key, Some(&everything), false, false, 1000));
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn full_swarm_ignores_new_peers() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 2);
        let key = NodeId::random();
        assert!(dir.announce(key, peer(1, 1), false, now));
        assert!(dir.announce(key, peer(2, 1), false, now));
        assert!(!dir.announce(key, peer(3, 1), false, now));
        assert!(dir.announce(key, peer(1, 1), true, now));
        assert_eq!(dir.peer_count(), 2);
    }

    #[test]
    fn full_directory_drops_smallest_swarm() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(2, 10);
        let big = NodeId::from_bytes([1u8; ID_LEN]);
        let small = NodeId::from_bytes([2u8; ID_LEN]);
        let newcomer = NodeId::from_bytes([3u8; ID_LEN]);

        dir.announce(big, peer(1, 1), false, now);
        dir.announce(big, peer(2, 1), false, now);
        dir.announce(small, peer(3, 1), false, now);
        dir.announce(newcomer, peer(4, 1), false, now);

        assert_eq!(dir.swarm_count(), 2);
        assert!(dir.get(&big).is_some());
        assert!(dir.get(&small).is_none());
        assert!(dir.get(&newcomer).is_some());
    }

    #[test]
    fn pruning_is_idempotent() {
        let start = Instant::now();
        let mut dir = SwarmDirectory::new(10, 10);
        let key = NodeId::random();
        dir.announce(key, peer(1, 1), false, start);
        dir.announce(key, peer(2, 1), false, start + Duration::from_secs(100));

        let now = start + Duration::from_secs(120);
        let max_age = Duration::from_secs(60);
        assert_eq!(dir.prune_stale(now, max_age), 1);
        assert_eq!(dir.prune_stale(now, max_age), 0);
        assert_eq!(dir.peer_count(), 1);
    }

    #[test]
    fn empty_swarms_dropped_on_request() {
        let start = Instant::now();
        let mut dir = SwarmDirectory::new(10, 10);
        let key = NodeId::random();
        dir.announce(key, peer(1, 1), false, start);

        dir.prune_stale(start + Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(dir.swarm_count(), 1);
        assert_eq!(dir.drop_empty(), 1);
        assert_eq!(dir.swarm_count(), 0);
    }

    #[test]
    fn name_set_once() {
        let now = Instant::now();
        let mut dir = SwarmDirectory::new(10, 10);
        let key = NodeId::random();
        dir.announce(key, peer(1, 1), false, now);
        dir.set_name(&key, "ubuntu.iso");
        dir.set_name(&key, "other");
        assert_eq!(dir.get(&key).unwrap().name(), Some("ubuntu.iso"));
    }
}
