//! # Item Storage
//!
//! Bounded tables holding the small blobs other nodes `put` into the DHT.
//!
//! | Table | Key | Write rule |
//! |-------|-----|------------|
//! | immutable | `BLAKE3(value)[..20]` | first write wins, later writes only re-mark as seen |
//! | mutable | `BLAKE3(public_key \|\| salt)[..20]` | sequence number must not go backwards |
//! | resource | see [`NodeId::for_resource`] | per entry: sequence must not go backwards, bounded entry list |
//!
//! ## Popularity
//!
//! Every item tracks the distinct IPs that stored it in a 128-byte bloom
//! filter. The announcer count is bumped only when the filter reports a probable
//! new member, so duplicates never count and false positives can only
//! undercount. When a table is over capacity the least popular items go
//! first, oldest `last_seen` breaking ties.
//!
//! ## Locking
//!
//! [`ItemStore`] is a plain single-threaded table. The node wraps each table in
//! its own mutex; eviction works on `(key, popularity, last_seen)` triples
//! and never clones values.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::bloom::BloomFilter;
use crate::crypto::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::identity::NodeId;
use crate::resource::ResourceEntry;

/// Bytes in the per-item announcer filter.
pub const ANNOUNCER_FILTER_BYTES: usize = 128;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutError {
    /// Supplied sequence number is lower than the stored one, or equal with
    /// different content.
    StaleSequence { stored: u64, supplied: u64 },
    /// Compare-and-swap expectation did not match the stored sequence.
    CasMismatch { expected: u64, stored: u64 },
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PutError::StaleSequence { stored, supplied } => {
                write!(f, "stale sequence number {supplied} (stored {stored})")
            }
            PutError::CasMismatch { expected, stored } => {
                write!(f, "cas mismatch: expected {expected}, stored {stored}")
            }
        }
    }
}

impl std::error::Error for PutError {}

// ============================================================================
// Items
// ============================================================================

/// Distinct IPs that stored an item, and when it was last stored.
#[derive(Clone, Debug)]
struct Announcers {
    filter: BloomFilter<ANNOUNCER_FILTER_BYTES>,
    count: u32,
    last_seen: Instant,
}

impl Announcers {
    fn new(now: Instant) -> Self {
        Self {
            filter: BloomFilter::new(),
            count: 0,
            last_seen: now,
        }
    }

    fn mark(&mut self, announcer: &IpAddr, now: Instant) {
        let inserted = match announcer {
            IpAddr::V4(v4) => self.filter.insert(&v4.octets()),
            IpAddr::V6(v6) => self.filter.insert(&v6.octets()),
        };
        if inserted {
            self.count = self.count.saturating_add(1);
        }
        self.last_seen = now;
    }
}

#[derive(Clone, Debug)]
pub struct ImmutableItem {
    value: Vec<u8>,
    announcers: Announcers,
}

impl ImmutableItem {
    fn new(value: Vec<u8>, now: Instant) -> Self {
        Self {
            value,
            announcers: Announcers::new(now),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[derive(Clone, Debug)]
pub struct MutableItem {
    base: ImmutableItem,
    signature: [u8; SIGNATURE_LEN],
    seq: u64,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl MutableItem {
    pub fn value(&self) -> &[u8] {
        self.base.value()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }
}

/// A signed mutable write, already checked against its signature.
#[derive(Clone, Debug)]
pub struct MutablePut {
    pub value: Vec<u8>,
    pub seq: u64,
    pub signature: [u8; SIGNATURE_LEN],
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// Only apply when the stored sequence equals this.
    pub cas: Option<u64>,
}

/// Every entry under one resource key.
#[derive(Clone, Debug)]
pub struct ResourceItem {
    entries: Vec<ResourceEntry>,
    announcers: Announcers,
}

impl ResourceItem {
    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }
}

/// Popularity and age bookkeeping shared by every item shape.
pub trait StoredItem {
    fn popularity(&self) -> u32;
    fn last_seen(&self) -> Instant;
    fn mark_seen(&mut self, announcer: &IpAddr, now: Instant);
}

impl StoredItem for ImmutableItem {
    fn popularity(&self) -> u32 {
        self.announcers.count
    }

    fn last_seen(&self) -> Instant {
        self.announcers.last_seen
    }

    fn mark_seen(&mut self, announcer: &IpAddr, now: Instant) {
        self.announcers.mark(announcer, now);
    }
}

impl StoredItem for MutableItem {
    fn popularity(&self) -> u32 {
        self.base.popularity()
    }

    fn last_seen(&self) -> Instant {
        self.base.last_seen()
    }

    fn mark_seen(&mut self, announcer: &IpAddr, now: Instant) {
        self.base.mark_seen(announcer, now);
    }
}

impl StoredItem for ResourceItem {
    fn popularity(&self) -> u32 {
        self.announcers.count
    }

    fn last_seen(&self) -> Instant {
        self.announcers.last_seen
    }

    fn mark_seen(&mut self, announcer: &IpAddr, now: Instant) {
        self.announcers.mark(announcer, now);
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug)]
pub struct ItemStore<I> {
    items: HashMap<NodeId, I>,
    capacity: usize,
}

impl<I: StoredItem> ItemStore<I> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, key: &NodeId) -> Option<&I> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Record `announcer` as having stored `key`. Returns false if absent.
    pub fn mark_seen(&mut self, key: &NodeId, announcer: &IpAddr, now: Instant) -> bool {
        match self.items.get_mut(key) {
            Some(item) => {
                item.mark_seen(announcer, now);
                true
            }
            None => false,
        }
    }

    /// Remove least popular items until the table is back within capacity.
    /// Returns how many were removed.
    pub fn evict_if_over_capacity(&mut self) -> usize {
        let excess = self.items.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let mut ranked: Vec<(u32, Instant, NodeId)> = self
            .items
            .iter()
            .map(|(key, item)| (item.popularity(), item.last_seen(), *key))
            .collect();
        ranked.sort_unstable();

        for (popularity, _, key) in ranked.into_iter().take(excess) {
            trace!(key = %key.short(), popularity, "evicting item");
            self.items.remove(&key);
        }
        excess
    }

    /// Drop items not seen within `lifetime`. Returns how many were removed.
    pub fn expire(&mut self, now: Instant, lifetime: Duration) -> usize {
        let before = self.items.len();
        self.items
            .retain(|_, item| now.saturating_duration_since(item.last_seen()) < lifetime);
        before - self.items.len()
    }

    fn insert(&mut self, key: NodeId, item: I) {
        self.items.insert(key, item);
        self.evict_if_over_capacity();
    }
}

impl ItemStore<ImmutableItem> {
    /// Store `value` under `key`. An existing item keeps its value and is only
    /// re-marked as seen by `announcer`.
    pub fn put_immutable(&mut self, key: NodeId, value: Vec<u8>, announcer: &IpAddr, now: Instant) {
        if self.mark_seen(&key, announcer, now) {
            return;
        }
        let mut item = ImmutableItem::new(value, now);
        item.mark_seen(announcer, now);
        self.insert(key, item);
    }
}

impl ItemStore<MutableItem> {
    /// Apply a signed write.
    ///
    /// A lower sequence number is rejected outright. An equal one is accepted
    /// only as a refresh of byte-identical content.
    pub fn put_mutable(
        &mut self,
        key: NodeId,
        put: MutablePut,
        announcer: &IpAddr,
        now: Instant,
    ) -> Result<(), PutError> {
        if let Some(existing) = self.items.get_mut(&key) {
            if let Some(expected) = put.cas
                && expected != existing.seq
            {
                return Err(PutError::CasMismatch {
                    expected,
                    stored: existing.seq,
                });
            }
            if put.seq < existing.seq
                || (put.seq == existing.seq && put.value != existing.base.value)
            {
                return Err(PutError::StaleSequence {
                    stored: existing.seq,
                    supplied: put.seq,
                });
            }
            if put.seq > existing.seq {
                existing.base.value = put.value;
                existing.signature = put.signature;
                existing.seq = put.seq;
            }
            existing.base.mark_seen(announcer, now);
            return Ok(());
        }

        let mut item = MutableItem {
            base: ImmutableItem::new(put.value, now),
            signature: put.signature,
            seq: put.seq,
            public_key: put.public_key,
        };
        item.base.mark_seen(announcer, now);
        self.insert(key, item);
        Ok(())
    }
}

impl ItemStore<ResourceItem> {
    /// Apply a verified entry to its resource.
    ///
    /// Each signer owns one slot (the owner's, for single-valued resources)
    /// under the same sequence rules as mutable items. A multi-valued
    /// resource holding more than `max_entries` drops its oldest entry by
    /// author time.
    pub fn put_resource(
        &mut self,
        entry: ResourceEntry,
        max_entries: usize,
        announcer: &IpAddr,
        now: Instant,
    ) -> Result<(), PutError> {
        let key = entry.key();
        let Some(item) = self.items.get_mut(&key) else {
            let mut item = ResourceItem {
                entries: vec![entry],
                announcers: Announcers::new(now),
            };
            item.announcers.mark(announcer, now);
            self.insert(key, item);
            return Ok(());
        };

        let existing = if entry.multi {
            item.entries.iter_mut().find(|e| e.signer == entry.signer)
        } else {
            item.entries.first_mut()
        };
        match existing {
            Some(existing) => {
                if entry.seq < existing.seq
                    || (entry.seq == existing.seq && entry.value != existing.value)
                {
                    return Err(PutError::StaleSequence {
                        stored: existing.seq,
                        supplied: entry.seq,
                    });
                }
                if entry.seq > existing.seq {
                    *existing = entry;
                }
            }
            None => {
                item.entries.push(entry);
                if item.entries.len() > max_entries
                    && let Some(oldest) = item
                        .entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.time)
                        .map(|(i, _)| i)
                {
                    let dropped = item.entries.remove(oldest);
                    trace!(key = %key.short(), time = dropped.time, "dropping oldest resource entry");
                }
            }
        }
        item.announcers.mark(announcer, now);
        Ok(())
    }
}
