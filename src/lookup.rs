//! # Iterative Lookup
//!
//! Kademlia-style search toward a target key, shared by every traversal:
//!
//! | Kind | Query | Harvested |
//! |------|-------|-----------|
//! | `FindNode` | `find_node` | closest responders |
//! | `GetPeers` | `get_peers` | peers or scrape filters, tokens |
//! | `GetImmutable` | `get` | value whose hash matches the target, tokens |
//! | `GetMutable` | `get` | highest-seq value with a valid signature, tokens |
//! | `GetData` | `get` | newest verified entry per signer, tokens |
//!
//! ## Algorithm
//!
//! 1. Seed the shortlist from the routing table. Explicit seed addresses (and
//!    routers when the table is empty) are queried in the first round.
//! 2. Each round queries up to `alpha` unqueried nodes among the `k` closest
//!    known, concurrently through a [`JoinSet`].
//! 3. Nodes from replies join the shortlist. Nodes that fail to answer leave it.
//! 4. Stop when the `k` closest are all queried, the round limit is hit, or
//!    the traversal is cancelled.
//!
//! Announce and put finish with [`NodeInner::write_to`], which sends the
//! write to the closest responders along with the token each one issued.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::crypto::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::identity::{Contact, ID_LEN, NodeId, distance_cmp};
use crate::messages::{
    COMPACT_NODE_LEN, COMPACT_NODE6_LEN, Dict, DictExt, Method, Value, decode_nodes, decode_nodes6,
    decode_peer,
};
use crate::node::NodeInner;
use crate::resource::ResourceEntry;
use crate::rpc::{QueryError, QueryResult};
use crate::schema::{KeyDesc, verify_message};
use crate::swarm::{SCRAPE_FILTER_BYTES, ScrapeFilter};
use crate::traversal::{TraversalHandle, TraversalId};

/// Shape every lookup reply must have. Harvest fields are all optional.
const LOOKUP_REPLY: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("nodes", COMPACT_NODE_LEN).optional().size_divisible(),
    KeyDesc::bytes("nodes6", COMPACT_NODE6_LEN).optional().size_divisible(),
    KeyDesc::bytes("token", 0).optional(),
    KeyDesc::list("values").optional(),
    KeyDesc::bytes("BFsd", SCRAPE_FILTER_BYTES).optional(),
    KeyDesc::bytes("BFpe", SCRAPE_FILTER_BYTES).optional(),
    KeyDesc::bytes("v", 0).optional(),
    KeyDesc::int("seq").optional(),
    KeyDesc::bytes("sig", SIGNATURE_LEN).optional(),
    KeyDesc::bytes("k", PUBLIC_KEY_LEN).optional(),
    KeyDesc::list("l").optional(),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LookupKind {
    FindNode,
    GetPeers { noseed: bool, scrape: bool },
    GetImmutable,
    GetMutable {
        public_key: [u8; PUBLIC_KEY_LEN],
        salt: Vec<u8>,
    },
    GetData {
        owner: [u8; PUBLIC_KEY_LEN],
        resource: Vec<u8>,
        multi: bool,
    },
}

impl LookupKind {
    fn method(&self) -> Method {
        match self {
            LookupKind::FindNode => Method::FindNode,
            LookupKind::GetPeers { .. } => Method::GetPeers,
            LookupKind::GetImmutable | LookupKind::GetMutable { .. } | LookupKind::GetData { .. } => {
                Method::Get
            }
        }
    }

    fn args(&self, target: NodeId) -> Dict {
        let mut args = Dict::new();
        match self {
            LookupKind::FindNode => {
                args.insert("target".into(), target.into());
            }
            LookupKind::GetPeers { noseed, scrape } => {
                args.insert("info_hash".into(), target.into());
                if *noseed {
                    args.insert("noseed".into(), Value::Int(1));
                }
                if *scrape {
                    args.insert("scrape".into(), Value::Int(1));
                }
            }
            LookupKind::GetImmutable | LookupKind::GetMutable { .. } | LookupKind::GetData { .. } => {
                args.insert("target".into(), target.into());
            }
        }
        args
    }
}

/// A verified mutable item fetched from the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutableValue {
    pub value: Vec<u8>,
    pub seq: u64,
    pub signature: [u8; SIGNATURE_LEN],
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub salt: Vec<u8>,
}

/// Swarm size estimated from merged scrape filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeEstimate {
    pub seeds: u32,
    pub downloaders: u32,
}

/// A node that answered, with the write token it handed out.
#[derive(Clone, Debug)]
pub(crate) struct Responder {
    pub contact: Contact,
    pub token: Option<Vec<u8>>,
}

/// Values collected from lookup replies.
#[derive(Debug)]
struct Harvest {
    target: NodeId,
    peers: Vec<SocketAddr>,
    seen_peers: HashSet<SocketAddr>,
    seeds: ScrapeFilter,
    downloaders: ScrapeFilter,
    immutable: Option<Vec<u8>>,
    mutable: Option<MutableValue>,
    resources: Vec<ResourceEntry>,
}

impl Harvest {
    fn new(target: NodeId) -> Self {
        Self {
            target,
            peers: Vec::new(),
            seen_peers: HashSet::new(),
            seeds: ScrapeFilter::new(),
            downloaders: ScrapeFilter::new(),
            immutable: None,
            mutable: None,
            resources: Vec::new(),
        }
    }

    fn absorb(&mut self, kind: &LookupKind, reply: &Dict) {
        match kind {
            LookupKind::FindNode => {}
            LookupKind::GetPeers { .. } => {
                for value in reply.get("values").and_then(Value::as_list).unwrap_or_default() {
                    if let Some(peer) = value.as_bytes().and_then(decode_peer)
                        && self.seen_peers.insert(peer)
                    {
                        self.peers.push(peer);
                    }
                }
                if let Some(filter) = reply.bytes("BFsd").and_then(ScrapeFilter::from_slice) {
                    self.seeds.merge(&filter);
                }
                if let Some(filter) = reply.bytes("BFpe").and_then(ScrapeFilter::from_slice) {
                    self.downloaders.merge(&filter);
                }
            }
            LookupKind::GetImmutable => {
                if self.immutable.is_none()
                    && let Some(value) = reply.bytes("v")
                    && NodeId::for_content(value) == self.target
                {
                    self.immutable = Some(value.to_vec());
                }
            }
            LookupKind::GetMutable { public_key, salt } => {
                if let Some(candidate) = mutable_from_reply(reply, public_key, salt)
                    && self.mutable.as_ref().is_none_or(|best| candidate.seq > best.seq)
                {
                    self.mutable = Some(candidate);
                }
            }
            LookupKind::GetData {
                owner,
                resource,
                multi,
            } => {
                for record in reply.get("l").and_then(Value::as_list).unwrap_or_default() {
                    let Some(entry) = record
                        .as_dict()
                        .and_then(|d| ResourceEntry::from_wire(d, "r.l").ok())
                    else {
                        continue;
                    };
                    if entry.is_for(owner, resource, *multi)
                        && entry.signer_allowed()
                        && entry.verify().is_ok()
                    {
                        self.merge_resource(entry);
                    }
                }
            }
        }
    }

    /// Keep the highest sequence number seen per signer.
    fn merge_resource(&mut self, entry: ResourceEntry) {
        match self.resources.iter_mut().find(|e| e.signer == entry.signer) {
            Some(existing) if entry.seq > existing.seq => *existing = entry,
            Some(_) => {}
            None => self.resources.push(entry),
        }
    }
}

/// Extract a mutable item from a `get` reply if it belongs to `public_key`
/// and its signature checks out.
fn mutable_from_reply(reply: &Dict, public_key: &[u8; PUBLIC_KEY_LEN], salt: &[u8]) -> Option<MutableValue> {
    let value = reply.bytes("v")?;
    let seq = u64::try_from(reply.int("seq")?).ok()?;
    let signature: [u8; SIGNATURE_LEN] = reply.bytes("sig")?.try_into().ok()?;
    if reply.bytes("k")? != public_key.as_slice() {
        return None;
    }
    crypto::verify_item(public_key, salt, seq, value, &signature).ok()?;
    Some(MutableValue {
        value: value.to_vec(),
        seq,
        signature,
        public_key: *public_key,
        salt: salt.to_vec(),
    })
}

#[derive(Debug)]
pub(crate) struct LookupResult {
    /// Closest responders to the target, nearest first.
    pub closest: Vec<Responder>,
    pub peers: Vec<SocketAddr>,
    pub immutable: Option<Vec<u8>>,
    pub mutable: Option<MutableValue>,
    /// Verified resource entries, newest author time first.
    pub resources: Vec<ResourceEntry>,
    seeds: ScrapeFilter,
    downloaders: ScrapeFilter,
}

impl LookupResult {
    pub fn contacts(&self) -> Vec<Contact> {
        self.closest.iter().map(|r| r.contact).collect()
    }

    pub fn scrape_estimate(&self) -> ScrapeEstimate {
        ScrapeEstimate {
            seeds: self.seeds.estimated_count(),
            downloaders: self.downloaders.estimated_count(),
        }
    }
}

impl NodeInner {
    /// Send one query and wait for the answer. A timeout counts as a failure
    /// against the peer in the routing table.
    pub(crate) async fn query(
        &self,
        to: SocketAddr,
        method: Method,
        mut args: Dict,
        traversal: Option<TraversalId>,
    ) -> QueryResult {
        if self.config.read_only {
            args.insert("ro".into(), Value::Int(1));
        }
        let result = self.rpc.query(to, method, args, traversal).await;
        if let Err(QueryError::Timeout) = result {
            self.unreachable(to);
        }
        result
    }

    pub(crate) async fn iterative_lookup(
        self: &Arc<Self>,
        target: NodeId,
        kind: &LookupKind,
        seeds: &[SocketAddr],
        traversal: &TraversalHandle,
    ) -> LookupResult {
        let k = self.config.bucket_size;
        let alpha = self.config.alpha;
        let method = kind.method();
        let args = kind.args(target);

        let (mut shortlist, mut first_round, routers) = {
            let routing = self.routing.lock();
            let shortlist = routing.nearest_nodes(&target, k);
            let routers: HashSet<SocketAddr> = routing.routers().into_iter().collect();
            let mut first_round: Vec<SocketAddr> = seeds.to_vec();
            if shortlist.is_empty() {
                first_round.extend(routers.iter().copied());
            }
            (shortlist, first_round, routers)
        };
        first_round.sort();
        first_round.dedup();

        let mut seen: HashSet<SocketAddr> = shortlist.iter().map(|c| c.addr).collect();
        seen.extend(first_round.iter().copied());
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut responders: Vec<Responder> = Vec::new();
        let mut harvest = Harvest::new(target);
        let mut iteration = 0;

        loop {
            if traversal.is_cancelled() {
                debug!(target = %target.short(), "lookup cancelled");
                break;
            }
            iteration += 1;
            if iteration > self.config.max_lookup_iterations {
                debug!(target = %target.short(), iterations = iteration - 1, "lookup hit round limit");
                break;
            }

            let batch: Vec<SocketAddr> = if first_round.is_empty() {
                shortlist.sort_by(|a, b| {
                    distance_cmp(&a.id.xor_distance(&target), &b.id.xor_distance(&target))
                });
                shortlist
                    .iter()
                    .take(k)
                    .map(|c| c.addr)
                    .filter(|addr| !queried.contains(addr))
                    .take(alpha)
                    .collect()
            } else {
                std::mem::take(&mut first_round)
            };
            if batch.is_empty() {
                break;
            }

            let mut join_set = JoinSet::new();
            for addr in batch {
                queried.insert(addr);
                let inner = self.clone();
                let args = args.clone();
                let id = traversal.id;
                join_set.spawn(async move {
                    let result = inner.query(addr, method, args, Some(id)).await;
                    (addr, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((addr, result)) = joined else {
                    continue;
                };
                let reply = match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        trace!(%addr, error = %e, "lookup query failed");
                        shortlist.retain(|c| c.addr != addr);
                        continue;
                    }
                };
                if let Err(e) = verify_message(&reply, "r", LOOKUP_REPLY) {
                    debug!(%addr, error = %e, "invalid lookup reply");
                    shortlist.retain(|c| c.addr != addr);
                    continue;
                }
                let Some(id) = reply.node_id("id") else {
                    continue;
                };
                if id == self.id {
                    continue;
                }

                // Routers only point the way.
                if !routers.contains(&addr) {
                    let contact = Contact::new(id, addr);
                    self.routing.lock().insert_or_refresh(contact, true);
                    if !shortlist.iter().any(|c| c.addr == addr) {
                        shortlist.push(contact);
                    }
                    responders.push(Responder {
                        contact,
                        token: reply.bytes("token").map(<[u8]>::to_vec),
                    });
                }

                let mut found = decode_nodes(reply.bytes("nodes").unwrap_or_default());
                found.extend(decode_nodes6(reply.bytes("nodes6").unwrap_or_default()));
                for node in found {
                    if node.id != self.id && !routers.contains(&node.addr) && seen.insert(node.addr) {
                        shortlist.push(node);
                    }
                }
                harvest.absorb(kind, &reply);
            }
        }

        responders.sort_by(|a, b| {
            distance_cmp(
                &a.contact.id.xor_distance(&target),
                &b.contact.id.xor_distance(&target),
            )
        });
        responders.dedup_by(|a, b| a.contact.id == b.contact.id);
        responders.truncate(k);

        debug!(
            target = %target.short(),
            method = method.as_str(),
            rounds = iteration,
            queried = queried.len(),
            responders = responders.len(),
            peers = harvest.peers.len(),
            "lookup complete"
        );

        harvest.resources.sort_by(|a, b| b.time.cmp(&a.time));

        LookupResult {
            closest: responders,
            peers: harvest.peers,
            immutable: harvest.immutable,
            mutable: harvest.mutable,
            resources: harvest.resources,
            seeds: harvest.seeds,
            downloaders: harvest.downloaders,
        }
    }

    /// Send `method` with `base_args` plus each responder's token to every
    /// responder that issued one. Returns how many acknowledged.
    pub(crate) async fn write_to(
        self: &Arc<Self>,
        method: Method,
        base_args: Dict,
        responders: &[Responder],
        traversal: &TraversalHandle,
    ) -> usize {
        let mut join_set = JoinSet::new();
        for responder in responders {
            let Some(token) = &responder.token else {
                continue;
            };
            let mut args = base_args.clone();
            args.insert("token".into(), Value::Bytes(token.clone()));
            let inner = self.clone();
            let addr = responder.contact.addr;
            let id = traversal.id;
            join_set.spawn(async move {
                let result = inner.query(addr, method, args, Some(id)).await;
                (addr, result)
            });
        }

        let mut acked = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => acked += 1,
                Ok((addr, Err(e))) => {
                    debug!(%addr, method = method.as_str(), error = %e, "write rejected");
                }
                Err(_) => {}
            }
        }
        acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::encode_peer;

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 1, 0, n], 6881))
    }

    fn peers_reply(peers: &[SocketAddr]) -> Dict {
        let mut reply = Dict::new();
        let values = peers.iter().map(|p| Value::Bytes(encode_peer(p))).collect();
        reply.insert("values".into(), Value::List(values));
        reply
    }

    fn mutable_reply(keypair: &Keypair, seq: u64, value: &[u8], signed: &[u8]) -> Dict {
        let mut reply = Dict::new();
        reply.insert("v".into(), value.into());
        reply.insert("seq".into(), Value::Int(seq as i64));
        reply.insert("k".into(), Value::Bytes(keypair.public_key_bytes().to_vec()));
        let sig = crypto::sign_item(keypair, b"", seq, signed);
        reply.insert("sig".into(), Value::Bytes(sig.to_vec()));
        reply
    }

    #[test]
    fn peers_deduplicated_across_replies() {
        let kind = LookupKind::GetPeers {
            noseed: false,
            scrape: false,
        };
        let mut harvest = Harvest::new(NodeId::random());
        harvest.absorb(&kind, &peers_reply(&[peer(1), peer(2)]));
        harvest.absorb(&kind, &peers_reply(&[peer(2), peer(3)]));
        assert_eq!(harvest.peers, vec![peer(1), peer(2), peer(3)]);
    }

    #[test]
    fn scrape_filters_merged() {
        let kind = LookupKind::GetPeers {
            noseed: false,
            scrape: true,
        };
        let mut harvest = Harvest::new(NodeId::random());
        for n in 0..2u8 {
            let mut seeds = ScrapeFilter::new();
            seeds.set(&[10, 0, 0, n]);
            let mut reply = Dict::new();
            reply.insert("BFsd".into(), Value::Bytes(seeds.as_bytes().to_vec()));
            reply.insert("BFpe".into(), Value::Bytes(vec![0; SCRAPE_FILTER_BYTES]));
            harvest.absorb(&kind, &reply);
        }
        assert_eq!(harvest.seeds.estimated_count(), 2);
        assert_eq!(harvest.downloaders.estimated_count(), 0);
    }

    #[test]
    fn immutable_value_must_hash_to_target() {
        let value = b"content".to_vec();
        let mut harvest = Harvest::new(NodeId::for_content(&value));

        let mut forged = Dict::new();
        forged.insert("v".into(), b"something else"[..].into());
        harvest.absorb(&LookupKind::GetImmutable, &forged);
        assert!(harvest.immutable.is_none());

        let mut genuine = Dict::new();
        genuine.insert("v".into(), Value::Bytes(value.clone()));
        harvest.absorb(&LookupKind::GetImmutable, &genuine);
        assert_eq!(harvest.immutable, Some(value));
    }

    #[test]
    fn mutable_keeps_highest_verified_seq() {
        let keypair = Keypair::generate();
        let kind = LookupKind::GetMutable {
            public_key: keypair.public_key_bytes(),
            salt: Vec::new(),
        };
        let mut harvest = Harvest::new(keypair.item_key(b""));

        harvest.absorb(&kind, &mutable_reply(&keypair, 4, b"four", b"four"));
        harvest.absorb(&kind, &mutable_reply(&keypair, 2, b"two", b"two"));
        // Higher seq but signed over different content.
        harvest.absorb(&kind, &mutable_reply(&keypair, 9, b"nine", b"forged"));

        let best = harvest.mutable.unwrap();
        assert_eq!(best.seq, 4);
        assert_eq!(best.value, b"four");
    }

    #[test]
    fn mutable_from_other_key_ignored() {
        let keypair = Keypair::generate();
        let stranger = Keypair::generate();
        let kind = LookupKind::GetMutable {
            public_key: keypair.public_key_bytes(),
            salt: Vec::new(),
        };
        let mut harvest = Harvest::new(keypair.item_key(b""));
        harvest.absorb(&kind, &mutable_reply(&stranger, 1, b"x", b"x"));
        assert!(harvest.mutable.is_none());
    }

    fn records_reply(entries: &[&ResourceEntry]) -> Dict {
        let mut reply = Dict::new();
        let records = entries.iter().map(|e| Value::Dict(e.to_wire())).collect();
        reply.insert("l".into(), Value::List(records));
        reply
    }

    #[test]
    fn resource_entries_merged_per_signer() {
        let owner = Keypair::generate();
        let owner_pk = owner.public_key_bytes();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let kind = LookupKind::GetData {
            owner: owner_pk,
            resource: b"replies".to_vec(),
            multi: true,
        };
        let mut harvest = Harvest::new(NodeId::for_resource(&owner_pk, b"replies", true));

        let alice_old = ResourceEntry::signed(&alice, owner_pk, b"replies", true, 1, 10, b"a1".to_vec());
        let alice_new = ResourceEntry::signed(&alice, owner_pk, b"replies", true, 2, 30, b"a2".to_vec());
        let bob_one = ResourceEntry::signed(&bob, owner_pk, b"replies", true, 1, 20, b"b1".to_vec());
        let elsewhere = ResourceEntry::signed(&bob, owner_pk, b"other", true, 5, 40, b"x".to_vec());
        let mut forged = ResourceEntry::signed(&bob, owner_pk, b"replies", true, 9, 50, b"b9".to_vec());
        forged.value = b"tampered".to_vec();

        harvest.absorb(&kind, &records_reply(&[&alice_new, &bob_one]));
        harvest.absorb(&kind, &records_reply(&[&alice_old, &elsewhere, &forged]));

        assert_eq!(harvest.resources, vec![alice_new, bob_one]);
    }

    #[test]
    fn single_resource_ignores_non_owner_entries() {
        let owner = Keypair::generate();
        let owner_pk = owner.public_key_bytes();
        let kind = LookupKind::GetData {
            owner: owner_pk,
            resource: b"bio".to_vec(),
            multi: false,
        };
        let mut harvest = Harvest::new(NodeId::for_resource(&owner_pk, b"bio", false));

        let intruder = ResourceEntry::signed(&Keypair::generate(), owner_pk, b"bio", false, 7, 9, b"x".to_vec());
        let genuine = ResourceEntry::signed(&owner, owner_pk, b"bio", false, 1, 5, b"me".to_vec());
        harvest.absorb(&kind, &records_reply(&[&intruder, &genuine]));

        assert_eq!(harvest.resources, vec![genuine]);
    }

    #[test]
    fn lookup_args_match_method() {
        let target = NodeId::random();
        let kind = LookupKind::GetPeers {
            noseed: true,
            scrape: false,
        };
        let args = kind.args(target);
        assert_eq!(kind.method(), Method::GetPeers);
        assert_eq!(args.node_id("info_hash"), Some(target));
        assert!(args.flag("noseed"));
        assert!(!args.contains_key("scrape"));
        assert_eq!(LookupKind::GetImmutable.method(), Method::Get);
    }
}
