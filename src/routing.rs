//! # Routing Table (XOR-Metric)
//!
//! Kademlia routing table over the 160-bit key space.
//!
//! ## Bucket Organization
//!
//! ```text
//! Bucket 0:   distance has 0 leading zeros (furthest, half the key space)
//! Bucket 1:   distance has 1 leading zero  (a quarter)
//! ...
//! Bucket 159: distance has 159 leading zeros (closest)
//! ```
//!
//! Each bucket holds up to `k` live contacts plus a replacement cache of the
//! same size. New contacts go to the replacement cache when the bucket is
//! full.
//!
//! ## Failure Handling
//!
//! `note_unreachable` bumps the contact's fail count. If the bucket has a
//! replacement waiting, the failed contact is swapped out immediately;
//! otherwise it is kept until it reaches `max_fail_count`. Any reply resets
//! the count.
//!
//! ## Router Nodes
//!
//! Well-known bootstrap routers are remembered by address and used to seed
//! lookups, but never inserted into buckets. They answer for everyone and
//! would otherwise skew the table.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace};

use crate::identity::{Contact, Distance, ID_LEN, NodeId, distance_cmp};

/// Number of buckets, one per bit of the key space.
pub const BUCKET_COUNT: usize = ID_LEN * 8;

#[derive(Clone, Debug)]
struct NodeEntry {
    contact: Contact,
    fail_count: u8,
    /// Whether the node ever answered one of our queries.
    confirmed: bool,
    last_seen: Instant,
}

impl NodeEntry {
    fn new(contact: Contact, confirmed: bool, now: Instant) -> Self {
        Self {
            contact,
            fail_count: 0,
            confirmed,
            last_seen: now,
        }
    }

    fn pinged_ok(&mut self, now: Instant) {
        self.fail_count = 0;
        self.confirmed = true;
        self.last_seen = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// Bucket full; contact parked in the replacement cache.
    Replacement,
    /// Our own id, a router, or an address conflict.
    Ignored,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    live: Vec<NodeEntry>,
    replacements: Vec<NodeEntry>,
    last_active: Instant,
}

impl RoutingBucket {
    fn new(now: Instant) -> Self {
        Self {
            live: Vec::new(),
            replacements: Vec::new(),
            last_active: now,
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.live.iter().position(|e| e.contact.id == *id)
    }

    fn park(&mut self, entry: NodeEntry, k: usize) {
        if let Some(pos) = self
            .replacements
            .iter()
            .position(|e| e.contact.id == entry.contact.id)
        {
            self.replacements.remove(pos);
        }
        if self.replacements.len() >= k {
            // Drop the oldest unconfirmed candidate first.
            let victim = self
                .replacements
                .iter()
                .position(|e| !e.confirmed)
                .unwrap_or(0);
            self.replacements.remove(victim);
        }
        self.replacements.push(entry);
    }

    /// Best replacement: most recent confirmed one, else most recent.
    fn take_replacement(&mut self) -> Option<NodeEntry> {
        let pos = self
            .replacements
            .iter()
            .rposition(|e| e.confirmed)
            .or_else(|| self.replacements.len().checked_sub(1))?;
        Some(self.replacements.remove(pos))
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    max_fail_count: u8,
    buckets: Vec<RoutingBucket>,
    routers: HashSet<SocketAddr>,
}

fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    self_id.common_prefix_len(other).min(BUCKET_COUNT - 1)
}

/// A random id that falls into bucket `bucket_idx` relative to `self_id`.
pub fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(BUCKET_COUNT - 1);
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; ID_LEN];
    if getrandom::getrandom(&mut distance).is_err() {
        rand::thread_rng().fill_bytes(&mut distance);
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize, max_fail_count: u8) -> Self {
        let now = Instant::now();
        Self {
            self_id,
            k,
            max_fail_count: max_fail_count.max(1),
            buckets: (0..BUCKET_COUNT).map(|_| RoutingBucket::new(now)).collect(),
            routers: HashSet::new(),
        }
    }

    pub fn add_router(&mut self, addr: SocketAddr) {
        self.routers.insert(addr);
    }

    pub fn routers(&self) -> Vec<SocketAddr> {
        self.routers.iter().copied().collect()
    }

    /// Record that `contact` was heard from.
    ///
    /// `confirmed` is true when the contact answered one of our queries,
    /// false when we only heard about it (it queried us, or another node
    /// listed it).
    pub fn insert_or_refresh(&mut self, contact: Contact, confirmed: bool) -> InsertOutcome {
        self.insert_or_refresh_at(contact, confirmed, Instant::now())
    }

    pub fn insert_or_refresh_at(
        &mut self,
        contact: Contact,
        confirmed: bool,
        now: Instant,
    ) -> InsertOutcome {
        if contact.id == self.self_id || self.routers.contains(&contact.addr) {
            return InsertOutcome::Ignored;
        }
        let k = self.k;
        let idx = bucket_index(&self.self_id, &contact.id);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&contact.id) {
            let entry = &mut bucket.live[pos];
            if entry.contact.addr != contact.addr {
                // Same id from a new address: only trust it once the old one is failing.
                if entry.fail_count == 0 || !confirmed {
                    trace!(node = %contact.id.short(), addr = %contact.addr, "address conflict");
                    return InsertOutcome::Ignored;
                }
                entry.contact.addr = contact.addr;
            }
            if confirmed {
                entry.pinged_ok(now);
            } else {
                entry.last_seen = now;
            }
            bucket.last_active = now;
            return InsertOutcome::Refreshed;
        }

        // An address already in the table under another id is suspicious.
        if bucket.live.iter().any(|e| e.contact.addr == contact.addr) {
            return InsertOutcome::Ignored;
        }

        let entry = NodeEntry::new(contact, confirmed, now);
        if bucket.live.len() < k {
            bucket.replacements.retain(|e| e.contact.id != contact.id);
            bucket.live.push(entry);
            bucket.last_active = now;
            return InsertOutcome::Inserted;
        }

        if confirmed
            && let Some(pos) = bucket.live.iter().position(|e| e.fail_count > 0)
        {
            let evicted = bucket.live.remove(pos);
            trace!(evicted = %evicted.contact.id.short(), node = %contact.id.short(), "replacing failing node");
            bucket.live.push(entry);
            bucket.last_active = now;
            return InsertOutcome::Inserted;
        }

        bucket.park(entry, k);
        InsertOutcome::Replacement
    }

    /// A query to `addr` went unanswered.
    /// Returns true if the node was removed from its bucket.
    pub fn note_unreachable(&mut self, addr: &SocketAddr) -> bool {
        let max_fail_count = self.max_fail_count;
        for bucket in &mut self.buckets {
            bucket.replacements.retain(|e| e.contact.addr != *addr);

            let Some(pos) = bucket.live.iter().position(|e| e.contact.addr == *addr) else {
                continue;
            };
            let entry = &mut bucket.live[pos];
            entry.fail_count = entry.fail_count.saturating_add(1);

            let exhausted = entry.fail_count >= max_fail_count;
            if exhausted || !bucket.replacements.is_empty() {
                let removed = bucket.live.remove(pos);
                if let Some(replacement) = bucket.take_replacement() {
                    bucket.live.push(replacement);
                }
                debug!(
                    node = %removed.contact.id.short(),
                    addr = %addr,
                    fail_count = removed.fail_count,
                    "removed unreachable node"
                );
                return true;
            }
            return false;
        }
        false
    }

    /// Up to `count` live contacts closest to `target`, nearest first.
    /// Nodes with outstanding failures are skipped unless nothing else is known.
    pub fn nearest_nodes(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let healthy = self.nearest_filtered(target, count, |e| e.fail_count == 0);
        if healthy.len() >= count {
            return healthy;
        }
        self.nearest_filtered(target, count, |_| true)
    }

    fn nearest_filtered(
        &self,
        target: &NodeId,
        count: usize,
        keep: impl Fn(&NodeEntry) -> bool,
    ) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: Distance,
            contact: Contact,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(count + 1);
        for entry in self.buckets.iter().flat_map(|b| b.live.iter()).filter(|e| keep(e)) {
            let dist = entry.contact.id.xor_distance(target);
            if heap.len() < count {
                heap.push(ByDistance { dist, contact: entry.contact });
            } else if let Some(furthest) = heap.peek()
                && distance_cmp(&dist, &furthest.dist) == Ordering::Less
            {
                heap.push(ByDistance { dist, contact: entry.contact });
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|d| d.contact).collect()
    }

    /// Index of the first non-empty bucket idle for longer than `interval`.
    pub fn bucket_needing_refresh(&self, now: Instant, interval: Duration) -> Option<usize> {
        self.buckets.iter().position(|b| {
            !b.live.is_empty() && now.saturating_duration_since(b.last_active) >= interval
        })
    }

    /// Time until some non-empty bucket becomes due for refresh.
    pub fn until_refresh(&self, now: Instant, interval: Duration) -> Option<Duration> {
        self.buckets
            .iter()
            .filter(|b| !b.live.is_empty())
            .map(|b| interval.saturating_sub(now.saturating_duration_since(b.last_active)))
            .min()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_active = now;
        }
    }

    /// `(live nodes, live + replacement nodes)`.
    pub fn size(&self) -> (usize, usize) {
        let live: usize = self.buckets.iter().map(|b| b.live.len()).sum();
        let cached: usize = self.buckets.iter().map(|b| b.replacements.len()).sum();
        (live, live + cached)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.live.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, (n >> 8) as u8, n as u8), 6881))
    }

    /// Contact whose id lands in bucket `bucket` (< 144) relative to the all-zero id.
    fn contact_in_bucket(bucket: usize, n: u16) -> Contact {
        let mut bytes = [0u8; ID_LEN];
        bytes[bucket / 8] = 0x80 >> (bucket % 8);
        bytes[ID_LEN - 2..].copy_from_slice(&n.to_be_bytes());
        Contact::new(NodeId::from_bytes(bytes), addr(n))
    }

    fn find(rt: &RoutingTable, id: &NodeId) -> Option<Contact> {
        let bucket = &rt.buckets[bucket_index(&rt.self_id, id)];
        bucket.position(id).map(|pos| bucket.live[pos].contact)
    }

    fn table(k: usize, max_fail: u8) -> RoutingTable {
        RoutingTable::new(NodeId::from_bytes([0u8; ID_LEN]), k, max_fail)
    }

    #[test]
    fn self_and_routers_are_never_inserted() {
        let mut rt = table(8, 3);
        let me = Contact::new(rt.self_id, addr(1));
        assert_eq!(rt.insert_or_refresh(me, true), InsertOutcome::Ignored);

        let router = contact_in_bucket(0, 2);
        rt.add_router(router.addr);
        assert_eq!(rt.insert_or_refresh(router, true), InsertOutcome::Ignored);
        assert_eq!(rt.size(), (0, 0));
    }

    #[test]
    fn full_bucket_parks_replacements() {
        let mut rt = table(2, 3);
        assert_eq!(rt.insert_or_refresh(contact_in_bucket(0, 1), true), InsertOutcome::Inserted);
        assert_eq!(rt.insert_or_refresh(contact_in_bucket(0, 2), true), InsertOutcome::Inserted);
        assert_eq!(rt.insert_or_refresh(contact_in_bucket(0, 3), true), InsertOutcome::Replacement);
        assert_eq!(rt.insert_or_refresh(contact_in_bucket(0, 1), true), InsertOutcome::Refreshed);
        assert_eq!(rt.size(), (2, 3));
    }

    #[test]
    fn unreachable_node_swapped_for_replacement() {
        let mut rt = table(2, 5);
        let a = contact_in_bucket(0, 1);
        let b = contact_in_bucket(0, 2);
        let c = contact_in_bucket(0, 3);
        rt.insert_or_refresh(a, true);
        rt.insert_or_refresh(b, true);
        rt.insert_or_refresh(c, true);

        assert!(rt.note_unreachable(&a.addr));
        assert!(find(&rt, &a.id).is_none());
        assert!(find(&rt, &c.id).is_some());
        assert_eq!(rt.size(), (2, 2));
    }

    #[test]
    fn node_removed_after_max_failures_without_replacement() {
        let mut rt = table(8, 3);
        let a = contact_in_bucket(5, 1);
        rt.insert_or_refresh(a, true);

        assert!(!rt.note_unreachable(&a.addr));
        assert!(!rt.note_unreachable(&a.addr));
        assert!(rt.note_unreachable(&a.addr));
        assert!(rt.is_empty());
    }

    #[test]
    fn reply_resets_fail_count() {
        let mut rt = table(8, 2);
        let a = contact_in_bucket(5, 1);
        rt.insert_or_refresh(a, true);
        assert!(!rt.note_unreachable(&a.addr));
        rt.insert_or_refresh(a, true);
        assert!(!rt.note_unreachable(&a.addr));
        assert!(find(&rt, &a.id).is_some());
    }

    #[test]
    fn nearest_nodes_sorted_by_distance() {
        let mut rt = table(8, 3);
        for bucket in [3usize, 40, 90, 140] {
            rt.insert_or_refresh(contact_in_bucket(bucket, bucket as u16), true);
        }
        let target = NodeId::from_bytes([0u8; ID_LEN]);
        let nearest = rt.nearest_nodes(&target, 3);
        assert_eq!(nearest.len(), 3);
        for pair in nearest.windows(2) {
            let d0 = pair[0].id.xor_distance(&target);
            let d1 = pair[1].id.xor_distance(&target);
            assert_eq!(distance_cmp(&d0, &d1), Ordering::Less);
        }
        assert_eq!(nearest[0].id, contact_in_bucket(140, 140).id);
    }

    #[test]
    fn address_conflict_ignored_while_node_healthy() {
        let mut rt = table(8, 3);
        let a = contact_in_bucket(7, 1);
        rt.insert_or_refresh(a, true);
        let moved = Contact::new(a.id, addr(99));
        assert_eq!(rt.insert_or_refresh(moved, true), InsertOutcome::Ignored);
        assert_eq!(find(&rt, &a.id).unwrap().addr, a.addr);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let me = NodeId::random();
        for bucket in [0usize, 1, 7, 8, 63, 159] {
            let id = random_id_for_bucket(&me, bucket);
            assert_eq!(bucket_index(&me, &id), bucket);
        }
    }

    #[test]
    fn idle_buckets_need_refresh() {
        let mut rt = table(8, 3);
        rt.insert_or_refresh(contact_in_bucket(12, 1), true);
        let now = Instant::now();
        let interval = Duration::from_secs(900);

        assert_eq!(rt.bucket_needing_refresh(now, interval), None);
        let later = now + interval;
        assert_eq!(rt.bucket_needing_refresh(later, interval), Some(12));

        rt.mark_bucket_refreshed(12, later);
        assert_eq!(rt.bucket_needing_refresh(later, interval), None);
        assert_eq!(rt.until_refresh(later, interval), Some(interval));
    }
}
