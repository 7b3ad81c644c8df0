//! Node configuration.
//!
//! All limits and intervals used by the node live in [`DhtConfig`]. The
//! defaults below are conservative values for a public node; embedders
//! override fields individually:
//!
//! ```ignore
//! let config = DhtConfig {
//!     max_swarms: 500,
//!     ..DhtConfig::default()
//! };
//! ```

use std::time::Duration;

/// Contacts per routing table bucket (Kademlia `k`).
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Parallel queries per lookup round.
pub const DEFAULT_ALPHA: usize = 5;

/// Consecutive failures before a node is evicted from its bucket.
pub const DEFAULT_MAX_FAIL_COUNT: u8 = 20;

pub const DEFAULT_MAX_SWARMS: usize = 2000;

pub const DEFAULT_MAX_PEERS_PER_SWARM: usize = 1000;

/// Peers returned in a single get_peers reply.
pub const DEFAULT_MAX_PEERS_REPLY: usize = 100;

/// Capacity of each item table (immutable, mutable and resource are bounded separately).
pub const DEFAULT_MAX_ITEMS: usize = 700;

/// Largest value accepted by `put`, in bytes.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1000;

pub const DEFAULT_MAX_SALT_SIZE: usize = 64;

/// Entries kept under one multi-valued resource.
pub const DEFAULT_MAX_ENTRIES_PER_RESOURCE: usize = 16;

/// Write-token secret rotation period. Tokens stay valid for up to two periods.
pub const DEFAULT_TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Swarm peers not re-announced within this window are pruned.
pub const DEFAULT_PEER_RETENTION: Duration = Duration::from_secs(45 * 60);

/// Items not re-put within this window are expired.
pub const DEFAULT_ITEM_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Buckets idle for longer than this get a refresh lookup.
pub const DEFAULT_BUCKET_REFRESH: Duration = Duration::from_secs(15 * 60);

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_LOOKUP_ITERATIONS: usize = 20;

/// Upper bound on the delay returned by `tick`.
pub const DEFAULT_MAX_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub bucket_size: usize,
    pub alpha: usize,
    pub max_fail_count: u8,
    pub max_swarms: usize,
    pub max_peers_per_swarm: usize,
    pub max_peers_reply: usize,
    pub max_items: usize,
    pub max_value_size: usize,
    /// Also bounds resource names.
    pub max_salt_size: usize,
    pub max_entries_per_resource: usize,
    pub token_rotation: Duration,
    pub peer_retention: Duration,
    pub item_lifetime: Duration,
    pub bucket_refresh: Duration,
    pub query_timeout: Duration,
    pub max_lookup_iterations: usize,
    pub max_tick_interval: Duration,
    /// Drop swarms whose last peer was pruned.
    pub drop_empty_swarms: bool,
    /// Refuse to answer queries, only issue them.
    pub read_only: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            max_fail_count: DEFAULT_MAX_FAIL_COUNT,
            max_swarms: DEFAULT_MAX_SWARMS,
            max_peers_per_swarm: DEFAULT_MAX_PEERS_PER_SWARM,
            max_peers_reply: DEFAULT_MAX_PEERS_REPLY,
            max_items: DEFAULT_MAX_ITEMS,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_salt_size: DEFAULT_MAX_SALT_SIZE,
            max_entries_per_resource: DEFAULT_MAX_ENTRIES_PER_RESOURCE,
            token_rotation: DEFAULT_TOKEN_ROTATION,
            peer_retention: DEFAULT_PEER_RETENTION,
            item_lifetime: DEFAULT_ITEM_LIFETIME,
            bucket_refresh: DEFAULT_BUCKET_REFRESH,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_lookup_iterations: DEFAULT_MAX_LOOKUP_ITERATIONS,
            max_tick_interval: DEFAULT_MAX_TICK_INTERVAL,
            drop_empty_swarms: true,
            read_only: false,
        }
    }
}

impl DhtConfig {
    /// Reject configurations that would make the node misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket_size == 0 {
            anyhow::bail!("bucket_size must be non-zero");
        }
        if self.alpha == 0 {
            anyhow::bail!("alpha must be non-zero");
        }
        if self.max_items == 0 || self.max_swarms == 0 || self.max_entries_per_resource == 0 {
            anyhow::bail!("table capacities must be non-zero");
        }
        if self.token_rotation.is_zero() {
            anyhow::bail!("token_rotation must be non-zero");
        }
        if self.query_timeout.is_zero() {
            anyhow::bail!("query_timeout must be non-zero");
        }
        Ok(())
    }
}
