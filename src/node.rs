//! # DHT Node
//!
//! [`DhtNode`] is the orchestrator: it owns the storage tables, the token
//! authority, the routing table, the RPC manager and the traversal registry,
//! and routes every message between them.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = DhtNode::bind("0.0.0.0:6881".parse()?, DhtConfig::default()).await?;
//! node.add_router_node("router.example.net:6881".parse()?);
//! node.bootstrap(&[]).await?;
//!
//! let peers = node.announce(info_hash, Some(6881), false).await?;
//!
//! loop {
//!     let next = node.tick();
//!     tokio::time::sleep(next).await;
//! }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Unbootstrapped ──bootstrap()──► Bootstrapping ──table populated──► Active
//!        ▲                              │
//!        └──────── nothing found ───────┘
//!
//! any ──shutdown()──► ShuttingDown ──traversals cancelled, tables cleared──► Stopped
//! ```
//!
//! ## Concurrency
//!
//! The node is a cheap-to-clone handle over shared state. Inbound datagrams,
//! the tick timer and traversal tasks all call into it concurrently. Every
//! table has its own short-held `parking_lot` lock, and no lock is held
//! across an `.await` or a transport send.
//!
//! Traversals (bootstrap, refresh, lookups, announce, put, get) each run as a
//! tokio task registered in the [`TraversalRegistry`]. The public `async`
//! methods resolve with what the traversal produced; shutdown aborts them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::crypto;
use crate::identity::{Contact, Keypair, NodeId};
use crate::lookup::{LookupKind, MutableValue, ScrapeEstimate};
use crate::messages::{self, Body, Dict, DictExt, MAX_DATAGRAM_SIZE, Message, Method, Value};
use crate::protocols::{DhtObserver, NodeEvent, NodeState, NoopObserver, Transport};
use crate::resource::ResourceEntry;
use crate::routing::{RoutingTable, random_id_for_bucket};
use crate::rpc::{Correlation, RpcManager};
use crate::storage::{ImmutableItem, ItemStore, MutableItem, ResourceItem};
use crate::swarm::SwarmDirectory;
use crate::tokens::TokenAuthority;
use crate::transport::UdpTransport;
use crate::traversal::{TraversalHandle, TraversalKind, TraversalRegistry};

/// Shortest delay `tick` will ask for.
const MIN_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot returned by [`DhtNode::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub routing_nodes: usize,
    pub routing_total: usize,
    pub swarms: usize,
    pub peers: usize,
    pub immutable_items: usize,
    pub mutable_items: usize,
    pub resource_items: usize,
    pub traversals: usize,
    pub pending_queries: usize,
}

/// Result of a `put_*` traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: NodeId,
    /// Nodes that acknowledged the write.
    pub stored_at: usize,
}

pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) config: DhtConfig,
    state: Mutex<NodeState>,
    pub(crate) tokens: TokenAuthority,
    pub(crate) swarms: Mutex<SwarmDirectory>,
    pub(crate) immutable: Mutex<ItemStore<ImmutableItem>>,
    pub(crate) mutable: Mutex<ItemStore<MutableItem>>,
    pub(crate) resources: Mutex<ItemStore<ResourceItem>>,
    pub(crate) routing: Mutex<RoutingTable>,
    pub(crate) rpc: RpcManager,
    pub(crate) traversals: TraversalRegistry,
    pub(crate) observer: Arc<dyn DhtObserver>,
    background: Mutex<Vec<AbortHandle>>,
}

/// Handle to a running DHT node. Clones share the same node.
#[derive(Clone)]
pub struct DhtNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl DhtNode {
    pub fn new(
        id: NodeId,
        config: DhtConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn DhtObserver>,
    ) -> Result<Self> {
        config.validate().context("invalid DHT configuration")?;
        let inner = NodeInner {
            id,
            tokens: TokenAuthority::new(),
            swarms: Mutex::new(SwarmDirectory::new(
                config.max_swarms,
                config.max_peers_per_swarm,
            )),
            immutable: Mutex::new(ItemStore::new(config.max_items)),
            mutable: Mutex::new(ItemStore::new(config.max_items)),
            resources: Mutex::new(ItemStore::new(config.max_items)),
            routing: Mutex::new(RoutingTable::new(
                id,
                config.bucket_size,
                config.max_fail_count,
            )),
            rpc: RpcManager::new(id, transport, config.query_timeout),
            traversals: TraversalRegistry::new(),
            observer,
            state: Mutex::new(NodeState::Unbootstrapped),
            background: Mutex::new(Vec::new()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Node with a random id on a custom transport and no observer.
    pub fn with_transport(config: DhtConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::new(NodeId::random(), config, transport, Arc::new(NoopObserver))
    }

    /// Bind a UDP socket and start serving on it.
    pub async fn bind(addr: SocketAddr, config: DhtConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let node = Self::with_transport(config, transport.clone())?;
        let receiver = transport.serve(node.clone());
        node.inner.background.lock().push(receiver);
        info!(id = %node.id(), addr = ?node.local_addr(), "DHT node listening");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.rpc.transport().local_addr()
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Decode and dispatch a raw datagram.
    pub fn incoming_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            self.inner.malformed(from, "datagram too large".to_string());
            return;
        }
        match messages::decode(bytes) {
            Ok(message) => self.incoming(from, message),
            Err(e) => self.inner.malformed(from, e.to_string()),
        }
    }

    /// Dispatch a decoded message.
    pub fn incoming(&self, from: SocketAddr, message: Message) {
        let inner = &self.inner;
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }

        let tid = message.transaction;
        match message.body {
            Body::Query { method, args } => {
                if inner.config.read_only {
                    return;
                }
                if let Some(id) = args.node_id("id")
                    && !args.flag("ro")
                {
                    inner
                        .routing
                        .lock()
                        .insert_or_refresh(Contact::new(id, from), false);
                }
                let reply = inner.incoming_request(from, tid, &method, &args, Instant::now());
                if let Body::Error { code, message } = &reply.body {
                    debug!(%from, method = %method, code, reason = %message, "request rejected");
                    inner.observer.on_event(&NodeEvent::RequestRejected {
                        from,
                        method: method.clone(),
                        code: *code,
                    });
                }
                if let Err(e) = inner.rpc.transport().send(from, reply) {
                    warn!(%from, error = %e, "failed to send reply");
                }
            }
            Body::Reply(_) | Body::Error { .. } => {
                let sender = message.sender_id();
                match inner.rpc.incoming(from, message) {
                    Correlation::Matched { method, rtt } => {
                        trace!(tid, %from, method = method.as_str(), rtt_ms = rtt.as_millis() as u64, "reply matched");
                        if let Some(id) = sender {
                            inner
                                .routing
                                .lock()
                                .insert_or_refresh(Contact::new(id, from), true);
                        }
                    }
                    Correlation::Late | Correlation::WrongSender | Correlation::Unknown => {}
                }
            }
        }
    }

    /// A peer failed to respond.
    pub fn unreachable(&self, addr: SocketAddr) {
        self.inner.unreachable(addr);
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Periodic maintenance. Returns when `tick` should be called next.
    pub fn tick(&self) -> Duration {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> Duration {
        let inner = &self.inner;
        let config = &inner.config;
        let state = self.state();
        if matches!(state, NodeState::ShuttingDown | NodeState::Stopped) {
            return config.max_tick_interval;
        }

        if inner.tokens.rotate_if_due(now, config.token_rotation) {
            inner.observer.on_event(&NodeEvent::SecretRotated);
        }

        {
            let mut swarms = inner.swarms.lock();
            let pruned = swarms.prune_stale(now, config.peer_retention);
            let dropped = if config.drop_empty_swarms {
                swarms.drop_empty()
            } else {
                0
            };
            if pruned > 0 || dropped > 0 {
                debug!(pruned, dropped, "pruned stale swarm peers");
            }
        }

        let expired = inner.immutable.lock().expire(now, config.item_lifetime)
            + inner.mutable.lock().expire(now, config.item_lifetime)
            + inner.resources.lock().expire(now, config.item_lifetime);
        let evicted = inner.immutable.lock().evict_if_over_capacity()
            + inner.mutable.lock().evict_if_over_capacity()
            + inner.resources.lock().evict_if_over_capacity();
        if expired > 0 || evicted > 0 {
            debug!(expired, evicted, "item maintenance");
        }

        // Any running node with live contacts keeps its buckets fresh, whether
        // the table was filled by bootstrap or by inbound traffic.
        let due = {
            let mut routing = inner.routing.lock();
            let due = routing.bucket_needing_refresh(now, config.bucket_refresh);
            if let Some(bucket) = due {
                routing.mark_bucket_refreshed(bucket, now);
            }
            due
        };
        if let Some(bucket) = due {
            let target = random_id_for_bucket(&inner.id, bucket);
            self.spawn_refresh(target);
        }

        let mut next = config
            .max_tick_interval
            .min(inner.tokens.until_rotation(now, config.token_rotation));
        if let Some(refresh) = inner.routing.lock().until_refresh(now, config.bucket_refresh) {
            next = next.min(refresh);
        }
        next.max(MIN_TICK_INTERVAL)
    }

    fn spawn_refresh(&self, target: NodeId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let node = self.clone();
        runtime.spawn(async move {
            match node.refresh(target).await {
                Ok(found) => debug!(target = %target.short(), found = found.len(), "bucket refresh complete"),
                Err(e) => debug!(target = %target.short(), error = %e, "bucket refresh failed"),
            }
        });
    }

    // =========================================================================
    // Routing table
    // =========================================================================

    /// Ping `addr` and add it to the routing table if it answers.
    pub async fn add_node(&self, addr: SocketAddr) -> Result<NodeId> {
        self.inner.ensure_running()?;
        let reply = self
            .inner
            .query(addr, Method::Ping, Dict::new(), None)
            .await
            .map_err(|e| anyhow!("ping {addr} failed: {e}"))?;
        let id = reply
            .node_id("id")
            .ok_or_else(|| anyhow!("ping reply from {addr} carried no id"))?;
        self.inner
            .routing
            .lock()
            .insert_or_refresh(Contact::new(id, addr), true);
        Ok(id)
    }

    /// Remember a well-known bootstrap router. Routers seed lookups but never
    /// enter the routing table.
    pub fn add_router_node(&self, addr: SocketAddr) {
        self.inner.routing.lock().add_router(addr);
    }

    /// Join the network through `seeds` (plus any routers).
    ///
    /// Seeds are queried first, then an iterative lookup for our own id fills
    /// the routing table. Resolves with the nodes closest to us.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<Vec<Contact>> {
        {
            let state = self.state();
            match state {
                NodeState::ShuttingDown | NodeState::Stopped => bail!("node is shut down"),
                NodeState::Unbootstrapped => {
                    self.inner.set_state(NodeState::Bootstrapping);
                }
                NodeState::Bootstrapping | NodeState::Active => {}
            }
        }

        let mut initial: Vec<SocketAddr> = seeds.to_vec();
        initial.extend(self.inner.routing.lock().routers());
        initial.sort();
        initial.dedup();
        if initial.is_empty() && self.inner.routing.lock().is_empty() {
            self.inner.set_state(NodeState::Unbootstrapped);
            bail!("no bootstrap nodes");
        }

        let target = self.inner.id;
        let result = self
            .run_traversal(TraversalKind::Bootstrap, target, move |inner, handle| async move {
                inner
                    .iterative_lookup(target, &LookupKind::FindNode, &initial, &handle)
                    .await
            })
            .await;

        let populated = !self.inner.routing.lock().is_empty();
        if self.state() == NodeState::Bootstrapping {
            self.inner.set_state(if populated {
                NodeState::Active
            } else {
                NodeState::Unbootstrapped
            });
        }
        let found = result?;
        info!(found = found.closest.len(), populated, "bootstrap complete");
        Ok(found.contacts())
    }

    /// Iterative find_node for `target`, refreshing the buckets on the way.
    pub async fn refresh(&self, target: NodeId) -> Result<Vec<Contact>> {
        let result = self
            .run_traversal(TraversalKind::Refresh, target, move |inner, handle| async move {
                inner
                    .iterative_lookup(target, &LookupKind::FindNode, &[], &handle)
                    .await
            })
            .await?;
        Ok(result.contacts())
    }

    // =========================================================================
    // Swarms
    // =========================================================================

    /// Peers in the swarm for `info_hash`, without announcing.
    pub async fn get_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>> {
        let kind = LookupKind::GetPeers {
            noseed: false,
            scrape: false,
        };
        let result = self
            .run_traversal(TraversalKind::GetPeers, info_hash, move |inner, handle| async move {
                inner.iterative_lookup(info_hash, &kind, &[], &handle).await
            })
            .await?;
        Ok(result.peers)
    }

    /// Estimated swarm size for `info_hash`.
    pub async fn scrape(&self, info_hash: NodeId) -> Result<ScrapeEstimate> {
        let kind = LookupKind::GetPeers {
            noseed: false,
            scrape: true,
        };
        let result = self
            .run_traversal(TraversalKind::GetPeers, info_hash, move |inner, handle| async move {
                inner.iterative_lookup(info_hash, &kind, &[], &handle).await
            })
            .await?;
        Ok(result.scrape_estimate())
    }

    /// Announce ourselves in the swarm for `info_hash`.
    ///
    /// With `port = None` the remote side uses the UDP source port. Resolves
    /// with the peers discovered during the lookup.
    pub async fn announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        seed: bool,
    ) -> Result<Vec<SocketAddr>> {
        self.announce_named(info_hash, port, seed, None).await
    }

    /// [`announce`](Self::announce) that also proposes a swarm name.
    pub async fn announce_named(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        seed: bool,
        name: Option<String>,
    ) -> Result<Vec<SocketAddr>> {
        let kind = LookupKind::GetPeers {
            noseed: seed,
            scrape: false,
        };
        self.run_traversal(TraversalKind::Announce, info_hash, move |inner, handle| async move {
            let found = inner.iterative_lookup(info_hash, &kind, &[], &handle).await;
            let mut args = Dict::new();
            args.insert("info_hash".into(), info_hash.into());
            match port {
                Some(port) => {
                    args.insert("port".into(), Value::Int(port as i64));
                }
                None => {
                    args.insert("port".into(), Value::Int(0));
                    args.insert("implied_port".into(), Value::Int(1));
                }
            }
            if seed {
                args.insert("seed".into(), Value::Int(1));
            }
            if let Some(name) = name {
                args.insert("n".into(), name.as_str().into());
            }
            let acked = inner
                .write_to(Method::AnnouncePeer, args, &found.closest, &handle)
                .await;
            debug!(info_hash = %info_hash.short(), acked, peers = found.peers.len(), "announce complete");
            found.peers
        })
        .await
    }

    // =========================================================================
    // Items
    // =========================================================================

    /// Store an immutable value under its content hash.
    pub async fn put_immutable(&self, value: Vec<u8>) -> Result<PutOutcome> {
        if value.len() > self.inner.config.max_value_size {
            bail!(
                "value of {} bytes exceeds limit of {}",
                value.len(),
                self.inner.config.max_value_size
            );
        }
        let key = NodeId::for_content(&value);
        let stored_at = self
            .run_traversal(TraversalKind::Put, key, move |inner, handle| async move {
                let found = inner
                    .iterative_lookup(key, &LookupKind::GetImmutable, &[], &handle)
                    .await;
                let mut args = Dict::new();
                args.insert("v".into(), Value::Bytes(value));
                inner.write_to(Method::Put, args, &found.closest, &handle).await
            })
            .await?;
        Ok(PutOutcome { key, stored_at })
    }

    /// Sign and store a mutable value under `(keypair, salt)`.
    pub async fn put_mutable(
        &self,
        keypair: &Keypair,
        salt: &[u8],
        value: Vec<u8>,
        seq: u64,
    ) -> Result<PutOutcome> {
        let config = &self.inner.config;
        if value.len() > config.max_value_size {
            bail!(
                "value of {} bytes exceeds limit of {}",
                value.len(),
                config.max_value_size
            );
        }
        if salt.len() > config.max_salt_size {
            bail!("salt of {} bytes exceeds limit of {}", salt.len(), config.max_salt_size);
        }
        let seq_wire = i64::try_from(seq).context("sequence number out of range")?;

        let public_key = keypair.public_key_bytes();
        let key = keypair.item_key(salt);
        let signature = crypto::sign_item(keypair, salt, seq, &value);
        let salt = salt.to_vec();
        let kind = LookupKind::GetMutable {
            public_key,
            salt: salt.clone(),
        };

        let stored_at = self
            .run_traversal(TraversalKind::Put, key, move |inner, handle| async move {
                let found = inner.iterative_lookup(key, &kind, &[], &handle).await;
                if let Some(current) = &found.mutable
                    && current.seq > seq
                {
                    warn!(key = %key.short(), current = current.seq, seq, "network holds a newer sequence number");
                }
                let mut args = Dict::new();
                args.insert("v".into(), Value::Bytes(value));
                args.insert("k".into(), Value::Bytes(public_key.to_vec()));
                args.insert("sig".into(), Value::Bytes(signature.to_vec()));
                args.insert("seq".into(), Value::Int(seq_wire));
                if !salt.is_empty() {
                    args.insert("salt".into(), Value::Bytes(salt));
                }
                inner.write_to(Method::Put, args, &found.closest, &handle).await
            })
            .await?;
        Ok(PutOutcome { key, stored_at })
    }

    /// Fetch an immutable value by its content hash.
    pub async fn get_immutable(&self, key: NodeId) -> Result<Option<Vec<u8>>> {
        let local = self
            .inner
            .immutable
            .lock()
            .get(&key)
            .map(|item| item.value().to_vec());
        if local.is_some() {
            return Ok(local);
        }
        let result = self
            .run_traversal(TraversalKind::Get, key, move |inner, handle| async move {
                inner
                    .iterative_lookup(key, &LookupKind::GetImmutable, &[], &handle)
                    .await
            })
            .await?;
        Ok(result.immutable)
    }

    /// Fetch the newest verified version of a mutable item.
    pub async fn get_mutable(
        &self,
        public_key: [u8; 32],
        salt: &[u8],
    ) -> Result<Option<MutableValue>> {
        let key = NodeId::for_mutable(&public_key, salt);
        let kind = LookupKind::GetMutable {
            public_key,
            salt: salt.to_vec(),
        };
        let result = self
            .run_traversal(TraversalKind::Get, key, move |inner, handle| async move {
                inner.iterative_lookup(key, &kind, &[], &handle).await
            })
            .await?;
        Ok(result.mutable)
    }

    /// Sign `value` and write it into the resource `(owner, resource, multi)`.
    ///
    /// Single-valued resources accept only their owner's key. In a
    /// multi-valued one every signer keeps its own entry.
    pub async fn put_data(
        &self,
        keypair: &Keypair,
        owner: [u8; 32],
        resource: &[u8],
        multi: bool,
        value: Vec<u8>,
        seq: u64,
    ) -> Result<PutOutcome> {
        let config = &self.inner.config;
        if value.len() > config.max_value_size {
            bail!(
                "value of {} bytes exceeds limit of {}",
                value.len(),
                config.max_value_size
            );
        }
        if resource.len() > config.max_salt_size {
            bail!(
                "resource name of {} bytes exceeds limit of {}",
                resource.len(),
                config.max_salt_size
            );
        }
        i64::try_from(seq).context("sequence number out of range")?;
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before the Unix epoch")?
            .as_secs();

        let entry = ResourceEntry::signed(keypair, owner, resource, multi, seq, time, value);
        if !entry.signer_allowed() {
            bail!("only the owner may write a single-valued resource");
        }
        let key = entry.key();
        let kind = LookupKind::GetData {
            owner,
            resource: resource.to_vec(),
            multi,
        };

        let stored_at = self
            .run_traversal(TraversalKind::Put, key, move |inner, handle| async move {
                let found = inner.iterative_lookup(key, &kind, &[], &handle).await;
                if let Some(current) = found.resources.iter().find(|e| e.signer == entry.signer)
                    && current.seq > entry.seq
                {
                    warn!(key = %key.short(), current = current.seq, seq = entry.seq, "network holds a newer sequence number");
                }
                inner.write_to(Method::Put, entry.to_wire(), &found.closest, &handle).await
            })
            .await?;
        Ok(PutOutcome { key, stored_at })
    }

    /// Fetch every verified entry of a resource, newest first.
    pub async fn get_data(
        &self,
        owner: [u8; 32],
        resource: &[u8],
        multi: bool,
    ) -> Result<Vec<ResourceEntry>> {
        let key = NodeId::for_resource(&owner, resource, multi);
        let kind = LookupKind::GetData {
            owner,
            resource: resource.to_vec(),
            multi,
        };
        let result = self
            .run_traversal(TraversalKind::Get, key, move |inner, handle| async move {
                inner.iterative_lookup(key, &kind, &[], &handle).await
            })
            .await?;
        Ok(result.resources)
    }

    // =========================================================================
    // Status and shutdown
    // =========================================================================

    pub fn status(&self) -> NodeStatus {
        let inner = &self.inner;
        let (routing_nodes, routing_total) = inner.routing.lock().size();
        let (swarms, peers) = {
            let swarms = inner.swarms.lock();
            (swarms.swarm_count(), swarms.peer_count())
        };
        NodeStatus {
            id: inner.id,
            state: self.state(),
            routing_nodes,
            routing_total,
            swarms,
            peers,
            immutable_items: inner.immutable.lock().len(),
            mutable_items: inner.mutable.lock().len(),
            resource_items: inner.resources.lock().len(),
            traversals: inner.traversals.len(),
            pending_queries: inner.rpc.num_pending(),
        }
    }

    /// Cancel every traversal, drop pending queries and clear the tables.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }
        inner.set_state(NodeState::ShuttingDown);

        let cancelled = inner.traversals.cancel_all();
        let dropped = inner.rpc.cancel_all();
        for task in inner.background.lock().drain(..) {
            task.abort();
        }

        *inner.swarms.lock() = SwarmDirectory::new(
            inner.config.max_swarms,
            inner.config.max_peers_per_swarm,
        );
        *inner.immutable.lock() = ItemStore::new(inner.config.max_items);
        *inner.mutable.lock() = ItemStore::new(inner.config.max_items);
        *inner.resources.lock() = ItemStore::new(inner.config.max_items);

        info!(traversals = cancelled.len(), queries = dropped, "DHT node stopped");
        inner.set_state(NodeState::Stopped);
    }

    /// Run `work` as a registered, cancellable traversal task.
    async fn run_traversal<T, F, Fut>(&self, kind: TraversalKind, target: NodeId, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<NodeInner>, TraversalHandle) -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.inner.ensure_running()?;
        // A shutdown racing past the state check has closed the registry.
        let Some(guard) = self.inner.traversals.register(kind, target) else {
            bail!("node is shut down");
        };
        let id = guard.id();
        let handle = guard.handle();
        self.inner
            .observer
            .on_event(&NodeEvent::TraversalStarted { id, kind, target });

        let fut = work(self.inner.clone(), handle);
        let task = tokio::spawn(async move {
            let _guard = guard;
            fut.await
        });
        self.inner.traversals.attach(id, task.abort_handle());

        let joined = task.await;
        self.inner.rpc.cancel_traversal(id);
        self.inner
            .observer
            .on_event(&NodeEvent::TraversalFinished { id, kind });

        match joined {
            Ok(value) => Ok(value),
            Err(e) if e.is_cancelled() => bail!("{} traversal cancelled", kind.as_str()),
            Err(e) => Err(anyhow!("{} traversal failed: {e}", kind.as_str())),
        }
    }
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NodeInner {
    pub(crate) fn set_state(&self, to: NodeState) {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            info!(from = from.as_str(), to = to.as_str(), "node state changed");
            self.observer.on_event(&NodeEvent::StateChanged { from, to });
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            NodeState::ShuttingDown | NodeState::Stopped => bail!("node is shut down"),
            _ => Ok(()),
        }
    }

    pub(crate) fn unreachable(&self, addr: SocketAddr) {
        if self.routing.lock().note_unreachable(&addr) {
            debug!(%addr, "peer removed after failures");
        }
    }

    fn malformed(&self, from: SocketAddr, reason: String) {
        debug!(%from, reason = %reason, "malformed datagram");
        self.observer
            .on_event(&NodeEvent::Malformed { from, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(SocketAddr, Message)>>,
    }

    impl Transport for Capture {
        fn send(&self, to: SocketAddr, message: Message) -> Result<()> {
            self.sent.lock().push((to, message));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<NodeEvent>>);

    impl DhtObserver for Events {
        fn on_event(&self, event: &NodeEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn node_with(config: DhtConfig) -> (DhtNode, Arc<Capture>, Arc<Events>) {
        let capture = Arc::new(Capture::default());
        let events = Arc::new(Events::default());
        let node = DhtNode::new(NodeId::random(), config, capture.clone(), events.clone()).unwrap();
        (node, capture, events)
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn ping_from(id: NodeId) -> Message {
        let mut args = Dict::new();
        args.insert("id".into(), id.into());
        Message::query(1, Method::Ping, args)
    }

    #[test]
    fn queriers_enter_routing_table_unconfirmed() {
        let (node, capture, _) = node_with(DhtConfig::default());
        node.incoming(peer(1), ping_from(NodeId::random()));

        assert_eq!(node.status().routing_nodes, 1);
        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1.body, Body::Reply(_)));
    }

    #[test]
    fn read_only_queriers_not_added() {
        let (node, _, _) = node_with(DhtConfig::default());
        let mut msg = ping_from(NodeId::random());
        if let Body::Query { args, .. } = &mut msg.body {
            args.insert("ro".into(), Value::Int(1));
        }
        node.incoming(peer(1), msg);
        assert_eq!(node.status().routing_nodes, 0);
    }

    #[test]
    fn read_only_node_does_not_answer() {
        let (node, capture, _) = node_with(DhtConfig {
            read_only: true,
            ..DhtConfig::default()
        });
        node.incoming(peer(1), ping_from(NodeId::random()));
        assert!(capture.sent.lock().is_empty());
    }

    #[test]
    fn malformed_datagram_reported() {
        let (node, capture, events) = node_with(DhtConfig::default());
        node.incoming_datagram(peer(1), &[0xde, 0xad]);
        assert!(capture.sent.lock().is_empty());
        assert!(matches!(events.0.lock()[0], NodeEvent::Malformed { .. }));
    }

    #[test]
    fn unknown_method_rejected_with_event() {
        let (node, capture, events) = node_with(DhtConfig::default());
        let mut args = Dict::new();
        args.insert("id".into(), NodeId::random().into());
        let msg = Message {
            transaction: 9,
            body: Body::Query {
                method: "vote".into(),
                args,
            },
        };
        node.incoming(peer(2), msg);

        let sent = capture.sent.lock();
        assert!(matches!(
            &sent[0].1.body,
            Body::Error { code, .. } if *code == ErrorCode::MethodUnknown.code()
        ));
        assert!(events
            .0
            .lock()
            .iter()
            .any(|e| matches!(e, NodeEvent::RequestRejected { code: 204, .. })));
    }

    #[test]
    fn unmatched_reply_silently_dropped() {
        let (node, capture, _) = node_with(DhtConfig::default());
        let mut values = Dict::new();
        values.insert("id".into(), NodeId::random().into());
        node.incoming(peer(3), Message::reply(77, values));
        assert!(capture.sent.lock().is_empty());
        assert_eq!(node.status().routing_nodes, 0);
    }

    #[test]
    fn tick_prunes_and_expires() {
        let (node, _, _) = node_with(DhtConfig::default());
        let start = Instant::now();
        let info_hash = NodeId::random();
        node.inner.swarms.lock().announce(info_hash, peer(1), false, start);
        node.inner.immutable.lock().put_immutable(
            NodeId::for_content(b"v"),
            b"v".to_vec(),
            &peer(1).ip(),
            start,
        );
        let owner = Keypair::generate();
        let entry = ResourceEntry::signed(&owner, owner.public_key_bytes(), b"bio", false, 1, 1, b"v".to_vec());
        node.inner
            .resources
            .lock()
            .put_resource(entry, 4, &peer(1).ip(), start)
            .unwrap();
        assert_eq!(node.status().resource_items, 1);

        let later = start + Duration::from_secs(3 * 60 * 60);
        node.tick_at(later);
        let status = node.status();
        assert_eq!(status.peers, 0);
        assert_eq!(status.swarms, 0);
        assert_eq!(status.immutable_items, 0);
        assert_eq!(status.resource_items, 0);
    }

    #[test]
    fn tick_rotates_secret_on_schedule() {
        let (node, _, events) = node_with(DhtConfig::default());
        let now = Instant::now();
        let next = node.tick_at(now);
        assert!(next >= MIN_TICK_INTERVAL);
        assert!(next <= node.config().max_tick_interval);
        assert!(events.0.lock().is_empty());

        node.tick_at(now + node.config().token_rotation);
        assert!(events.0.lock().contains(&NodeEvent::SecretRotated));
    }

    fn sent_find_nodes(capture: &Capture) -> usize {
        capture
            .sent
            .lock()
            .iter()
            .filter(|(_, m)| matches!(&m.body, Body::Query { method, .. } if method == Method::FindNode.as_str()))
            .count()
    }

    #[tokio::test]
    async fn tick_refreshes_buckets_filled_by_inbound_queries() {
        let (node, capture, events) = node_with(DhtConfig::default());
        node.incoming(peer(7), ping_from(NodeId::random()));
        let start = Instant::now();
        assert_eq!(node.state(), NodeState::Unbootstrapped);
        assert_eq!(node.status().routing_nodes, 1);

        let due = start + node.config().bucket_refresh + Duration::from_secs(1);
        let next = node.tick_at(due);
        assert!(next > MIN_TICK_INTERVAL);

        for _ in 0..50 {
            if sent_find_nodes(&capture) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sent_find_nodes(&capture), 1);
        assert_eq!(node.status().traversals, 1);
        assert!(events.0.lock().iter().any(|e| matches!(
            e,
            NodeEvent::TraversalStarted { kind: TraversalKind::Refresh, .. }
        )));

        // The refreshed bucket is not due again on the next tick.
        assert!(node.tick_at(due + Duration::from_secs(1)) > MIN_TICK_INTERVAL);
        node.shutdown();
    }

    #[tokio::test]
    async fn traversal_refused_once_registry_closed() {
        let (node, capture, _) = node_with(DhtConfig::default());
        node.incoming(peer(1), ping_from(NodeId::random()));
        capture.sent.lock().clear();

        // Shutdown cancelled the registry after this caller saw a running node.
        node.inner.traversals.cancel_all();
        assert_eq!(node.state(), NodeState::Unbootstrapped);

        assert!(node.get_peers(NodeId::random()).await.is_err());
        assert_eq!(node.status().traversals, 0);
        assert!(capture.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_without_seeds_fails() {
        let (node, _, _) = node_with(DhtConfig::default());
        assert!(node.bootstrap(&[]).await.is_err());
        assert_eq!(node.state(), NodeState::Unbootstrapped);
    }

    #[tokio::test]
    async fn shutdown_stops_node() {
        let (node, _, events) = node_with(DhtConfig::default());
        node.shutdown();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(node.get_peers(NodeId::random()).await.is_err());
        assert!(events.0.lock().contains(&NodeEvent::StateChanged {
            from: NodeState::ShuttingDown,
            to: NodeState::Stopped,
        }));

        // Messages after shutdown are ignored.
        node.incoming(peer(1), ping_from(NodeId::random()));
        assert_eq!(node.status().routing_nodes, 0);
    }
}
