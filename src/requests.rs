//! # Request Handlers
//!
//! Answers inbound queries. Every query is checked against its descriptor
//! list before it is dispatched, so handlers only see well-formed arguments.
//!
//! | Method | Reads | Writes | Token |
//! |--------|-------|--------|-------|
//! | `ping` | - | - | - |
//! | `find_node` | routing table | - | - |
//! | `get_peers` | routing table, swarms | - | issued |
//! | `announce_peer` | - | swarms | verified |
//! | `get` | routing table, items, resources | - | issued |
//! | `put` | - | items, resources | verified |
//!
//! A `put` carrying a `p` record goes to the resource table; any other `put`
//! is an immutable or mutable item.
//!
//! A rejected request never mutates state. Token checks come before any
//! store access; signature checks come before the store enforces ordering.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tracing::trace;

use crate::crypto::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::identity::{ID_LEN, NodeId};
use crate::messages::{Dict, DictExt, ErrorCode, Message, Method, Value, encode_nodes, encode_peer};
use crate::node::NodeInner;
use crate::resource::ResourceEntry;
use crate::schema::{KeyDesc, ValidationError, verify_message};
use crate::storage::{MutablePut, PutError};
use crate::swarm::{PeersReply, PrefixFilter};

const PING: &[KeyDesc] = &[KeyDesc::bytes("id", ID_LEN)];

const FIND_NODE: &[KeyDesc] = &[KeyDesc::bytes("id", ID_LEN), KeyDesc::bytes("target", ID_LEN)];

const GET_PEERS: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("info_hash", ID_LEN),
    KeyDesc::int("noseed").optional(),
    KeyDesc::int("scrape").optional(),
    KeyDesc::bytes("pfx", ID_LEN).optional(),
    KeyDesc::int("pfxbits").optional(),
];

const ANNOUNCE_PEER: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("info_hash", ID_LEN),
    KeyDesc::int("port"),
    KeyDesc::bytes("token", 0),
    KeyDesc::int("implied_port").optional(),
    KeyDesc::int("seed").optional(),
    KeyDesc::bytes("n", 0).optional(),
];

const GET: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("target", ID_LEN),
    KeyDesc::int("seq").optional(),
];

const PUT: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("token", 0),
    KeyDesc::bytes("v", 0),
    KeyDesc::bytes("k", PUBLIC_KEY_LEN).optional(),
    KeyDesc::bytes("sig", SIGNATURE_LEN).optional(),
    KeyDesc::int("seq").optional(),
    KeyDesc::bytes("salt", 0).optional(),
    KeyDesc::int("cas").optional(),
    KeyDesc::bytes("target", ID_LEN).optional(),
];

/// Envelope of a resource write. The record itself is checked by
/// [`ResourceEntry::from_wire`].
const PUT_DATA: &[KeyDesc] = &[
    KeyDesc::bytes("id", ID_LEN),
    KeyDesc::bytes("token", 0),
    KeyDesc::bytes("target", ID_LEN).optional(),
];

/// Why a query was answered with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    Validation(ValidationError),
    UnknownMethod(String),
    InvalidToken,
    InvalidPort(i64),
    /// Argument present and well-typed but out of range.
    InvalidArgument(&'static str),
    MessageTooBig { size: usize, max: usize },
    SaltTooBig { size: usize, max: usize },
    InvalidSignature,
    /// Someone other than the owner wrote a single-valued resource.
    NotOwner,
    /// The supplied target does not match the key derived from the item.
    TargetMismatch,
    Store(PutError),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Validation(_)
            | RequestError::InvalidToken
            | RequestError::InvalidPort(_)
            | RequestError::InvalidArgument(_)
            | RequestError::TargetMismatch => ErrorCode::Protocol,
            RequestError::UnknownMethod(_) => ErrorCode::MethodUnknown,
            RequestError::MessageTooBig { .. } => ErrorCode::MessageTooBig,
            RequestError::SaltTooBig { .. } => ErrorCode::SaltTooBig,
            RequestError::InvalidSignature | RequestError::NotOwner => ErrorCode::InvalidSignature,
            RequestError::Store(PutError::StaleSequence { .. }) => ErrorCode::SequenceLessThanCurrent,
            RequestError::Store(PutError::CasMismatch { .. }) => ErrorCode::CasMismatch,
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Validation(e) => write!(f, "{e}"),
            RequestError::UnknownMethod(m) => write!(f, "unknown method '{m}'"),
            RequestError::InvalidToken => write!(f, "invalid token"),
            RequestError::InvalidPort(p) => write!(f, "invalid port {p}"),
            RequestError::InvalidArgument(name) => write!(f, "invalid value for '{name}'"),
            RequestError::MessageTooBig { size, max } => {
                write!(f, "message too big ({size} > {max} bytes)")
            }
            RequestError::SaltTooBig { size, max } => write!(f, "salt too big ({size} > {max} bytes)"),
            RequestError::InvalidSignature => write!(f, "invalid signature"),
            RequestError::NotOwner => write!(f, "only the owner may write this resource"),
            RequestError::TargetMismatch => write!(f, "target does not match item key"),
            RequestError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<ValidationError> for RequestError {
    fn from(e: ValidationError) -> Self {
        RequestError::Validation(e)
    }
}

impl From<PutError> for RequestError {
    fn from(e: PutError) -> Self {
        RequestError::Store(e)
    }
}

/// Validated 20-byte key argument.
fn key_arg(args: &Dict, name: &'static str) -> Result<NodeId, RequestError> {
    args.node_id(name).ok_or(RequestError::InvalidArgument(name))
}

fn non_negative(args: &Dict, name: &'static str) -> Result<Option<u64>, RequestError> {
    match args.int(name) {
        None => Ok(None),
        Some(n) => u64::try_from(n)
            .map(Some)
            .map_err(|_| RequestError::InvalidArgument(name)),
    }
}

impl NodeInner {
    /// Answer one query. Always produces a reply or an error message.
    pub(crate) fn incoming_request(
        &self,
        from: SocketAddr,
        tid: u16,
        method: &str,
        args: &Dict,
        now: Instant,
    ) -> Message {
        match self.dispatch(from, method, args, now) {
            Ok(mut values) => {
                values.insert("id".into(), self.id.into());
                Message::reply(tid, values)
            }
            Err(e) => Message::error(tid, e.code(), e.to_string()),
        }
    }

    fn dispatch(
        &self,
        from: SocketAddr,
        method: &str,
        args: &Dict,
        now: Instant,
    ) -> Result<Dict, RequestError> {
        let Some(parsed) = Method::parse(method) else {
            return Err(RequestError::UnknownMethod(method.to_string()));
        };
        match parsed {
            Method::Ping => {
                verify_message(args, "a", PING)?;
                Ok(Dict::new())
            }
            Method::FindNode => {
                verify_message(args, "a", FIND_NODE)?;
                let target = key_arg(args, "target")?;
                let mut reply = Dict::new();
                self.insert_nodes(&mut reply, &target);
                Ok(reply)
            }
            Method::GetPeers => self.on_get_peers(from, args),
            Method::AnnouncePeer => self.on_announce(from, args, now),
            Method::Get => self.on_get(from, args),
            Method::Put => self.on_put(from, args, now),
        }
    }

    fn insert_nodes(&self, reply: &mut Dict, target: &NodeId) {
        let closest = self
            .routing
            .lock()
            .nearest_nodes(target, self.config.bucket_size);
        let (nodes, nodes6) = encode_nodes(&closest);
        reply.insert("nodes".into(), Value::Bytes(nodes));
        if !nodes6.is_empty() {
            reply.insert("nodes6".into(), Value::Bytes(nodes6));
        }
    }

    fn insert_token(&self, reply: &mut Dict, ip: &IpAddr, key: &NodeId) {
        let token = self.tokens.generate_token(ip, key);
        reply.insert("token".into(), Value::Bytes(token.to_vec()));
    }

    fn on_get_peers(&self, from: SocketAddr, args: &Dict) -> Result<Dict, RequestError> {
        verify_message(args, "a", GET_PEERS)?;
        let info_hash = key_arg(args, "info_hash")?;

        let prefix = match (args.bytes("pfx"), args.int("pfxbits")) {
            (Some(value), Some(bits)) => {
                let bits = u8::try_from(bits)
                    .ok()
                    .filter(|b| (*b as usize) <= ID_LEN * 8)
                    .ok_or(RequestError::InvalidArgument("pfxbits"))?;
                let value: [u8; ID_LEN] = value
                    .try_into()
                    .map_err(|_| RequestError::InvalidArgument("pfx"))?;
                Some(PrefixFilter { bits, value })
            }
            _ => None,
        };

        let mut reply = Dict::new();
        self.insert_token(&mut reply, &from.ip(), &info_hash);
        self.insert_nodes(&mut reply, &info_hash);

        let swarms = self.swarms.lock();
        let found = swarms.lookup_peers(
            &info_hash,
            prefix.as_ref(),
            args.flag("noseed"),
            args.flag("scrape"),
            self.config.max_peers_reply,
        );
        match found {
            Some(PeersReply::Peers(peers)) => {
                let values = peers.iter().map(|p| Value::Bytes(encode_peer(p))).collect();
                reply.insert("values".into(), Value::List(values));
            }
            Some(PeersReply::Scrape { seeds, downloaders }) => {
                reply.insert("BFsd".into(), Value::Bytes(seeds.as_bytes().to_vec()));
                reply.insert("BFpe".into(), Value::Bytes(downloaders.as_bytes().to_vec()));
            }
            None => {}
        }
        if let Some(name) = swarms.get(&info_hash).and_then(|s| s.name()) {
            reply.insert("n".into(), name.into());
        }
        Ok(reply)
    }

    fn on_announce(&self, from: SocketAddr, args: &Dict, now: Instant) -> Result<Dict, RequestError> {
        verify_message(args, "a", ANNOUNCE_PEER)?;
        let info_hash = key_arg(args, "info_hash")?;
        let token = args.bytes("token").unwrap_or_default();
        if !self.tokens.verify_token(token, &info_hash, &from.ip()) {
            return Err(RequestError::InvalidToken);
        }

        let port = if args.flag("implied_port") {
            from.port()
        } else {
            let raw = args.int("port").unwrap_or(0);
            u16::try_from(raw)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(RequestError::InvalidPort(raw))?
        };
        let peer = SocketAddr::new(from.ip(), port);
        let seed = args.flag("seed");

        let mut swarms = self.swarms.lock();
        let added = swarms.announce(info_hash, peer, seed, now);
        if let Some(name) = args.get("n").and_then(Value::as_str) {
            swarms.set_name(&info_hash, name);
        }
        trace!(info_hash = %info_hash.short(), %peer, seed, added, "peer announced");
        Ok(Dict::new())
    }

    fn on_get(&self, from: SocketAddr, args: &Dict) -> Result<Dict, RequestError> {
        verify_message(args, "a", GET)?;
        let target = key_arg(args, "target")?;
        let have_seq = non_negative(args, "seq")?;

        let mut reply = Dict::new();
        self.insert_token(&mut reply, &from.ip(), &target);
        self.insert_nodes(&mut reply, &target);

        if let Some(item) = self.mutable.lock().get(&target) {
            let seq = i64::try_from(item.seq()).unwrap_or(i64::MAX);
            reply.insert("seq".into(), Value::Int(seq));
            reply.insert("k".into(), Value::Bytes(item.public_key().to_vec()));
            reply.insert("sig".into(), Value::Bytes(item.signature().to_vec()));
            if have_seq.is_none_or(|known| item.seq() > known) {
                reply.insert("v".into(), Value::Bytes(item.value().to_vec()));
            }
            return Ok(reply);
        }
        if let Some(item) = self.resources.lock().get(&target) {
            let records = item
                .entries()
                .iter()
                .map(|entry| Value::Dict(entry.to_wire()))
                .collect();
            reply.insert("l".into(), Value::List(records));
            return Ok(reply);
        }
        if let Some(item) = self.immutable.lock().get(&target) {
            reply.insert("v".into(), Value::Bytes(item.value().to_vec()));
        }
        Ok(reply)
    }

    fn on_put(&self, from: SocketAddr, args: &Dict, now: Instant) -> Result<Dict, RequestError> {
        if args.contains_key("p") {
            return self.on_put_data(from, args, now);
        }
        verify_message(args, "a", PUT)?;
        let value = args.bytes("v").unwrap_or_default();
        let token = args.bytes("token").unwrap_or_default();
        let salt = args.bytes("salt").unwrap_or_default();

        if value.len() > self.config.max_value_size {
            return Err(RequestError::MessageTooBig {
                size: value.len(),
                max: self.config.max_value_size,
            });
        }
        if salt.len() > self.config.max_salt_size {
            return Err(RequestError::SaltTooBig {
                size: salt.len(),
                max: self.config.max_salt_size,
            });
        }

        let Some(public_key) = args.bytes("k") else {
            let key = NodeId::for_content(value);
            self.check_target(args, &key)?;
            if !self.tokens.verify_token(token, &key, &from.ip()) {
                return Err(RequestError::InvalidToken);
            }
            self.immutable
                .lock()
                .put_immutable(key, value.to_vec(), &from.ip(), now);
            trace!(key = %key.short(), size = value.len(), "immutable item stored");
            return Ok(Dict::new());
        };

        let public_key: [u8; PUBLIC_KEY_LEN] = public_key
            .try_into()
            .map_err(|_| RequestError::InvalidArgument("k"))?;
        let signature: [u8; SIGNATURE_LEN] = args
            .bytes("sig")
            .ok_or_else(|| ValidationError::Missing { path: "a.sig".into() })?
            .try_into()
            .map_err(|_| RequestError::InvalidArgument("sig"))?;
        let seq = non_negative(args, "seq")?
            .ok_or_else(|| ValidationError::Missing { path: "a.seq".into() })?;
        let cas = non_negative(args, "cas")?;

        let key = NodeId::for_mutable(&public_key, salt);
        self.check_target(args, &key)?;
        if !self.tokens.verify_token(token, &key, &from.ip()) {
            return Err(RequestError::InvalidToken);
        }
        crypto::verify_item(&public_key, salt, seq, value, &signature)
            .map_err(|_| RequestError::InvalidSignature)?;

        let put = MutablePut {
            value: value.to_vec(),
            seq,
            signature,
            public_key,
            cas,
        };
        self.mutable.lock().put_mutable(key, put, &from.ip(), now)?;
        trace!(key = %key.short(), seq, size = value.len(), "mutable item stored");
        Ok(Dict::new())
    }

    fn on_put_data(&self, from: SocketAddr, args: &Dict, now: Instant) -> Result<Dict, RequestError> {
        verify_message(args, "a", PUT_DATA)?;
        let entry = ResourceEntry::from_wire(args, "a")?;
        let token = args.bytes("token").unwrap_or_default();

        if entry.value.len() > self.config.max_value_size {
            return Err(RequestError::MessageTooBig {
                size: entry.value.len(),
                max: self.config.max_value_size,
            });
        }
        if entry.resource.len() > self.config.max_salt_size {
            return Err(RequestError::SaltTooBig {
                size: entry.resource.len(),
                max: self.config.max_salt_size,
            });
        }

        let key = entry.key();
        self.check_target(args, &key)?;
        if !self.tokens.verify_token(token, &key, &from.ip()) {
            return Err(RequestError::InvalidToken);
        }
        if !entry.signer_allowed() {
            return Err(RequestError::NotOwner);
        }
        entry.verify().map_err(|_| RequestError::InvalidSignature)?;

        let (seq, multi, size) = (entry.seq, entry.multi, entry.value.len());
        self.resources.lock().put_resource(
            entry,
            self.config.max_entries_per_resource,
            &from.ip(),
            now,
        )?;
        trace!(key = %key.short(), seq, multi, size, "resource entry stored");
        Ok(Dict::new())
    }

    fn check_target(&self, args: &Dict, key: &NodeId) -> Result<(), RequestError> {
        match args.node_id("target") {
            Some(target) if target != *key => Err(RequestError::TargetMismatch),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DhtConfig;
    use crate::identity::Keypair;
    use crate::messages::{Body, decode_peer};
    use crate::node::DhtNode;
    use crate::protocols::Transport;

    struct Null;

    impl Transport for Null {
        fn send(&self, _to: SocketAddr, _message: Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn node() -> DhtNode {
        DhtNode::with_transport(DhtConfig::default(), Arc::new(Null)).unwrap()
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, n], 7000 + n as u16))
    }

    fn args(entries: Vec<(&str, Value)>) -> Dict {
        let mut dict: Dict = entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        dict.insert("id".into(), NodeId::random().into());
        dict
    }

    fn call(node: &DhtNode, from: SocketAddr, method: &str, args: Dict) -> Result<Dict, (i64, String)> {
        match node.inner.incoming_request(from, 1, method, &args, Instant::now()).body {
            Body::Reply(values) => Ok(values),
            Body::Error { code, message } => Err((code, message)),
            Body::Query { .. } => panic!("handler produced a query"),
        }
    }

    fn peers_in(reply: &Dict) -> Vec<SocketAddr> {
        reply
            .get("values")
            .and_then(Value::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_bytes().and_then(decode_peer))
            .collect()
    }

    #[test]
    fn ping_requires_id() {
        let node = node();
        let reply = call(&node, addr(1), "ping", args(vec![])).unwrap();
        assert_eq!(reply.node_id("id"), Some(node.id()));

        let err = call(&node, addr(1), "ping", Dict::new()).unwrap_err();
        assert_eq!(err, (203, "missing 'a.id' key".to_string()));
    }

    #[test]
    fn announce_requires_valid_token() {
        let node = node();
        let info_hash = NodeId::random();
        let a1 = addr(1);

        let bad = args(vec![
            ("info_hash", info_hash.into()),
            ("port", Value::Int(6881)),
            ("token", Value::Bytes(vec![0, 0, 0, 0])),
        ]);
        let err = call(&node, a1, "announce_peer", bad).unwrap_err();
        assert_eq!(err.0, ErrorCode::Protocol.code());
        assert_eq!(node.status().swarms, 0);

        let reply = call(&node, a1, "get_peers", args(vec![("info_hash", info_hash.into())])).unwrap();
        assert!(peers_in(&reply).is_empty());
        let token = reply.bytes("token").unwrap().to_vec();

        let good = args(vec![
            ("info_hash", info_hash.into()),
            ("port", Value::Int(6881)),
            ("token", Value::Bytes(token)),
        ]);
        call(&node, a1, "announce_peer", good).unwrap();

        let reply = call(&node, a1, "get_peers", args(vec![("info_hash", info_hash.into())])).unwrap();
        assert_eq!(peers_in(&reply), vec![SocketAddr::new(a1.ip(), 6881)]);
    }

    #[test]
    fn token_bound_to_requester_address() {
        let node = node();
        let info_hash = NodeId::random();
        let reply = call(&node, addr(1), "get_peers", args(vec![("info_hash", info_hash.into())])).unwrap();
        let token = reply.bytes("token").unwrap().to_vec();

        let announce = args(vec![
            ("info_hash", info_hash.into()),
            ("port", Value::Int(0)),
            ("implied_port", Value::Int(1)),
            ("token", Value::Bytes(token)),
        ]);
        assert!(call(&node, addr(2), "announce_peer", announce.clone()).is_err());
        call(&node, addr(1), "announce_peer", announce).unwrap();

        let reply = call(&node, addr(3), "get_peers", args(vec![("info_hash", info_hash.into())])).unwrap();
        assert_eq!(peers_in(&reply), vec![addr(1)]);
    }

    #[test]
    fn zero_port_without_implied_port_rejected() {
        let node = node();
        let info_hash = NodeId::random();
        let token = node.inner.tokens.generate_token(&addr(1).ip(), &info_hash);
        let announce = args(vec![
            ("info_hash", info_hash.into()),
            ("port", Value::Int(0)),
            ("token", Value::Bytes(token.to_vec())),
        ]);
        let err = call(&node, addr(1), "announce_peer", announce).unwrap_err();
        assert_eq!(err.1, "invalid port 0");
    }

    #[test]
    fn scrape_returns_filters() {
        let node = node();
        let info_hash = NodeId::random();
        let now = Instant::now();
        {
            let mut swarms = node.inner.swarms.lock();
            swarms.announce(info_hash, addr(1), true, now);
            swarms.announce(info_hash, addr(2), false, now);
        }
        let reply = call(
            &node,
            addr(9),
            "get_peers",
            args(vec![("info_hash", info_hash.into()), ("scrape", Value::Int(1))]),
        )
        .unwrap();
        assert_eq!(reply.bytes("BFsd").map(<[u8]>::len), Some(256));
        assert_eq!(reply.bytes("BFpe").map(<[u8]>::len), Some(256));
        assert!(!reply.contains_key("values"));
    }

    fn mutable_put(node: &DhtNode, keypair: &Keypair, from: SocketAddr, seq: u64, value: &[u8]) -> Dict {
        let key = keypair.item_key(b"");
        let token = node.inner.tokens.generate_token(&from.ip(), &key);
        args(vec![
            ("token", Value::Bytes(token.to_vec())),
            ("v", value.into()),
            ("k", Value::Bytes(keypair.public_key_bytes().to_vec())),
            ("sig", Value::Bytes(crypto::sign_item(keypair, b"", seq, value).to_vec())),
            ("seq", Value::Int(seq as i64)),
        ])
    }

    #[test]
    fn stale_mutable_put_rejected() {
        let node = node();
        let keypair = Keypair::generate();
        let from = addr(4);

        call(&node, from, "put", mutable_put(&node, &keypair, from, 5, b"five")).unwrap();
        let err = call(&node, from, "put", mutable_put(&node, &keypair, from, 3, b"three")).unwrap_err();
        assert_eq!(err.0, ErrorCode::SequenceLessThanCurrent.code());

        let target = keypair.item_key(b"");
        let reply = call(&node, addr(5), "get", args(vec![("target", target.into())])).unwrap();
        assert_eq!(reply.int("seq"), Some(5));
        assert_eq!(reply.bytes("v"), Some(&b"five"[..]));
        assert_eq!(reply.bytes("k"), Some(&keypair.public_key_bytes()[..]));
    }

    #[test]
    fn get_omits_value_when_requester_is_current() {
        let node = node();
        let keypair = Keypair::generate();
        let from = addr(4);
        call(&node, from, "put", mutable_put(&node, &keypair, from, 2, b"two")).unwrap();

        let target = keypair.item_key(b"");
        let reply = call(
            &node,
            from,
            "get",
            args(vec![("target", target.into()), ("seq", Value::Int(2))]),
        )
        .unwrap();
        assert_eq!(reply.int("seq"), Some(2));
        assert!(!reply.contains_key("v"));
    }

    #[test]
    fn forged_signature_rejected() {
        let node = node();
        let keypair = Keypair::generate();
        let from = addr(4);
        let mut put = mutable_put(&node, &keypair, from, 1, b"original");
        put.insert("v".into(), b"tampered"[..].into());

        let err = call(&node, from, "put", put).unwrap_err();
        assert_eq!(err.0, ErrorCode::InvalidSignature.code());
        assert_eq!(node.status().mutable_items, 0);
    }

    #[test]
    fn cas_mismatch_rejected() {
        let node = node();
        let keypair = Keypair::generate();
        let from = addr(4);
        call(&node, from, "put", mutable_put(&node, &keypair, from, 1, b"one")).unwrap();

        let mut put = mutable_put(&node, &keypair, from, 2, b"two");
        put.insert("cas".into(), Value::Int(7));
        let err = call(&node, from, "put", put).unwrap_err();
        assert_eq!(err.0, ErrorCode::CasMismatch.code());
    }

    #[test]
    fn immutable_put_keyed_by_content() {
        let node = node();
        let from = addr(6);
        let value = b"hello dht".to_vec();
        let key = NodeId::for_content(&value);
        let token = node.inner.tokens.generate_token(&from.ip(), &key);

        let mismatched = args(vec![
            ("token", Value::Bytes(token.to_vec())),
            ("v", Value::Bytes(value.clone())),
            ("target", NodeId::random().into()),
        ]);
        assert_eq!(call(&node, from, "put", mismatched).unwrap_err().0, 203);

        let put = args(vec![
            ("token", Value::Bytes(token.to_vec())),
            ("v", Value::Bytes(value.clone())),
        ]);
        call(&node, from, "put", put).unwrap();

        let reply = call(&node, addr(7), "get", args(vec![("target", key.into())])).unwrap();
        assert_eq!(reply.bytes("v"), Some(&value[..]));
    }

    #[test]
    fn size_limits_enforced() {
        let node = node();
        let from = addr(6);
        let big = args(vec![
            ("token", Value::Bytes(vec![0; 4])),
            ("v", Value::Bytes(vec![0; 1001])),
        ]);
        assert_eq!(call(&node, from, "put", big).unwrap_err().0, 205);

        let keypair = Keypair::generate();
        let mut salty = mutable_put(&node, &keypair, from, 1, b"x");
        salty.insert("salt".into(), Value::Bytes(vec![1; 65]));
        assert_eq!(call(&node, from, "put", salty).unwrap_err().0, 207);
    }

    fn data_put(node: &DhtNode, from: SocketAddr, entry: &ResourceEntry) -> Dict {
        let token = node.inner.tokens.generate_token(&from.ip(), &entry.key());
        let mut put = entry.to_wire();
        put.insert("id".into(), NodeId::random().into());
        put.insert("token".into(), Value::Bytes(token.to_vec()));
        put
    }

    fn records_in(reply: &Dict) -> Vec<ResourceEntry> {
        reply
            .get("l")
            .and_then(Value::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.as_dict().and_then(|d| ResourceEntry::from_wire(d, "r.l").ok()))
            .collect()
    }

    #[test]
    fn multi_resource_collects_entries_from_many_signers() {
        let node = node();
        let owner = Keypair::generate();
        let owner_pk = owner.public_key_bytes();
        let first = ResourceEntry::signed(&Keypair::generate(), owner_pk, b"replies", true, 1, 10, b"hi".to_vec());
        let second = ResourceEntry::signed(&Keypair::generate(), owner_pk, b"replies", true, 1, 20, b"yo".to_vec());

        call(&node, addr(1), "put", data_put(&node, addr(1), &first)).unwrap();
        call(&node, addr(2), "put", data_put(&node, addr(2), &second)).unwrap();
        assert_eq!(node.status().resource_items, 1);

        let target = NodeId::for_resource(&owner_pk, b"replies", true);
        let reply = call(&node, addr(3), "get", args(vec![("target", target.into())])).unwrap();
        assert!(reply.contains_key("token"));
        assert!(!reply.contains_key("v"));
        assert_eq!(records_in(&reply), vec![first, second]);
    }

    #[test]
    fn single_resource_only_accepts_owner() {
        let node = node();
        let owner = Keypair::generate();
        let forged = ResourceEntry::signed(&Keypair::generate(), owner.public_key_bytes(), b"bio", false, 1, 10, b"x".to_vec());
        let err = call(&node, addr(1), "put", data_put(&node, addr(1), &forged)).unwrap_err();
        assert_eq!(err.0, ErrorCode::InvalidSignature.code());
        assert_eq!(node.status().resource_items, 0);

        let genuine = ResourceEntry::signed(&owner, owner.public_key_bytes(), b"bio", false, 1, 10, b"x".to_vec());
        call(&node, addr(1), "put", data_put(&node, addr(1), &genuine)).unwrap();
        assert_eq!(node.status().resource_items, 1);
    }

    #[test]
    fn resource_put_validated_and_signed() {
        let node = node();
        let owner = Keypair::generate();
        let entry = ResourceEntry::signed(&owner, owner.public_key_bytes(), b"bio", false, 1, 10, b"x".to_vec());

        let mut incomplete = data_put(&node, addr(1), &entry);
        if let Some(Value::Dict(p)) = incomplete.get_mut("p") {
            p.remove("seq");
        }
        let err = call(&node, addr(1), "put", incomplete).unwrap_err();
        assert_eq!(err, (203, "missing 'a.p.seq' key".to_string()));

        let mut tampered = data_put(&node, addr(1), &entry);
        if let Some(Value::Dict(p)) = tampered.get_mut("p") {
            p.insert("v".into(), b"y"[..].into());
        }
        assert_eq!(call(&node, addr(1), "put", tampered).unwrap_err().0, 206);

        let stale_token = data_put(&node, addr(2), &entry);
        assert_eq!(call(&node, addr(1), "put", stale_token).unwrap_err().0, 203);
        assert_eq!(node.status().resource_items, 0);
    }

    #[test]
    fn find_node_returns_compact_nodes() {
        let node = node();
        let peer = crate::identity::Contact::new(NodeId::random(), addr(8));
        node.inner.routing.lock().insert_or_refresh(peer, true);

        let reply = call(&node, addr(1), "find_node", args(vec![("target", NodeId::random().into())])).unwrap();
        assert_eq!(crate::messages::decode_nodes(reply.bytes("nodes").unwrap()), vec![peer]);
    }
}
