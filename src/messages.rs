//! # Wire Protocol Messages
//!
//! Every datagram carries one [`Message`]: a transaction id plus a query, a
//! reply or an error. Arguments and reply fields are a dynamic [`Value`]
//! tree so the request layer can check them against declarative
//! descriptors (see `schema`) before anything is dispatched.
//!
//! Messages are serialized with bincode and a bounded deserialization limit.
//!
//! ## Methods
//!
//! | Method | Arguments | Reply |
//! |--------|-----------|-------|
//! | `ping` | `id` | `id` |
//! | `find_node` | `id`, `target` | `id`, `nodes`, `nodes6` |
//! | `get_peers` | `id`, `info_hash`, opt. `noseed`, `scrape`, `pfx`/`pfxbits` | `id`, `token`, `nodes`, `values` or `BFsd`/`BFpe` |
//! | `announce_peer` | `id`, `info_hash`, `port`, `token`, opt. `implied_port`, `seed`, `n` | `id` |
//! | `get` | `id`, `target`, opt. `seq` | `id`, `token`, `nodes`, opt. `v`, `seq`, `sig`, `k` |
//! | `put` | `id`, `token`, `v`, opt. `k`, `sig`, `seq`, `salt`, `cas` | `id` |
//!
//! ## Compact Encodings
//!
//! - node: 20-byte id, 4-byte IPv4, 2-byte port (26 bytes), in `nodes`
//! - node6: 20-byte id, 16-byte IPv6, 2-byte port (38 bytes), in `nodes6`
//! - peer: 4+2 or 16+2 bytes, one list element each, in `values`

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::{Contact, ID_LEN, NodeId};

/// Largest datagram we send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024;

/// Deserialization limit.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_DATAGRAM_SIZE as u64;

pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_NODE6_LEN: usize = ID_LEN + 18;

pub type Dict = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::List(_) => ValueKind::List,
            Value::Dict(_) => ValueKind::Dict,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Bytes(id.as_bytes().to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Bytes,
    List,
    Dict,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Bytes => "string",
            ValueKind::List => "list",
            ValueKind::Dict => "dict",
        };
        f.write_str(name)
    }
}

/// Convenience accessors for argument dictionaries.
pub trait DictExt {
    fn int(&self, key: &str) -> Option<i64>;
    fn bytes(&self, key: &str) -> Option<&[u8]>;
    fn node_id(&self, key: &str) -> Option<NodeId>;
    fn flag(&self, key: &str) -> bool;
}

impl DictExt for Dict {
    fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    fn node_id(&self, key: &str) -> Option<NodeId> {
        self.bytes(key).and_then(NodeId::from_slice)
    }

    fn flag(&self, key: &str) -> bool {
        self.int(key).is_some_and(|n| n != 0)
    }
}

// ============================================================================
// Methods and error codes
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
            Method::Get => "get",
            Method::Put => "put",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "ping" => Method::Ping,
            "find_node" => Method::FindNode,
            "get_peers" => Method::GetPeers,
            "announce_peer" => Method::AnnouncePeer,
            "get" => Method::Get,
            "put" => Method::Put,
            _ => return None,
        })
    }
}

/// Numeric codes carried by error replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Generic = 201,
    Server = 202,
    /// Malformed message or invalid token.
    Protocol = 203,
    MethodUnknown = 204,
    MessageTooBig = 205,
    InvalidSignature = 206,
    SaltTooBig = 207,
    CasMismatch = 301,
    SequenceLessThanCurrent = 302,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            201 => ErrorCode::Generic,
            202 => ErrorCode::Server,
            203 => ErrorCode::Protocol,
            204 => ErrorCode::MethodUnknown,
            205 => ErrorCode::MessageTooBig,
            206 => ErrorCode::InvalidSignature,
            207 => ErrorCode::SaltTooBig,
            301 => ErrorCode::CasMismatch,
            302 => ErrorCode::SequenceLessThanCurrent,
            _ => return None,
        })
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Query { method: String, args: Dict },
    Reply(Dict),
    Error { code: i64, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub transaction: u16,
    pub body: Body,
}

impl Message {
    pub fn query(transaction: u16, method: Method, args: Dict) -> Self {
        Self {
            transaction,
            body: Body::Query {
                method: method.as_str().to_string(),
                args,
            },
        }
    }

    pub fn reply(transaction: u16, values: Dict) -> Self {
        Self {
            transaction,
            body: Body::Reply(values),
        }
    }

    pub fn error(transaction: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            transaction,
            body: Body::Error {
                code: code.code(),
                message: message.into(),
            },
        }
    }

    /// Sender id claimed by a query or reply.
    pub fn sender_id(&self) -> Option<NodeId> {
        match &self.body {
            Body::Query { args, .. } => args.node_id("id"),
            Body::Reply(values) => values.node_id("id"),
            Body::Error { .. } => None,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self.body, Body::Query { .. })
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

/// Deserialize with size bounds enforced.
pub fn decode(bytes: &[u8]) -> Result<Message, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Compact encodings
// ============================================================================

/// Split contacts into compact `nodes` (IPv4) and `nodes6` (IPv6) blobs.
pub fn encode_nodes(contacts: &[Contact]) -> (Vec<u8>, Vec<u8>) {
    let mut nodes = Vec::new();
    let mut nodes6 = Vec::new();
    for contact in contacts {
        match contact.addr.ip() {
            IpAddr::V4(v4) => {
                nodes.extend_from_slice(contact.id.as_bytes());
                nodes.extend_from_slice(&v4.octets());
                nodes.extend_from_slice(&contact.addr.port().to_be_bytes());
            }
            IpAddr::V6(v6) => {
                nodes6.extend_from_slice(contact.id.as_bytes());
                nodes6.extend_from_slice(&v6.octets());
                nodes6.extend_from_slice(&contact.addr.port().to_be_bytes());
            }
        }
    }
    (nodes, nodes6)
}

/// Parse a compact node blob. Trailing partial records are ignored.
pub fn decode_nodes(bytes: &[u8]) -> Vec<Contact> {
    decode_node_records(bytes, COMPACT_NODE_LEN)
}

pub fn decode_nodes6(bytes: &[u8]) -> Vec<Contact> {
    decode_node_records(bytes, COMPACT_NODE6_LEN)
}

fn decode_node_records(bytes: &[u8], record_len: usize) -> Vec<Contact> {
    bytes
        .chunks_exact(record_len)
        .filter_map(|record| {
            let id = NodeId::from_slice(&record[..ID_LEN])?;
            let addr = decode_peer(&record[ID_LEN..])?;
            Some(Contact::new(id, addr))
        })
        .collect()
}

pub fn encode_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

pub fn decode_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[..16].try_into().ok()?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_survives_codec() {
        let mut args = Dict::new();
        args.insert("id".into(), NodeId::random().into());
        args.insert("target".into(), NodeId::random().into());
        let msg = Message::query(7, Method::FindNode, args);

        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn oversized_input_rejected() {
        let mut args = Dict::new();
        args.insert("v".into(), Value::Bytes(vec![0u8; MAX_DATAGRAM_SIZE]));
        let msg = Message::query(1, Method::Put, args);
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode(&[0xff; 3]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn compact_nodes_split_by_family() {
        let v4 = Contact::new(NodeId::random(), "10.1.2.3:6881".parse().unwrap());
        let v6 = Contact::new(NodeId::random(), "[2001:db8::1]:6882".parse().unwrap());
        let (nodes, nodes6) = encode_nodes(&[v4, v6]);

        assert_eq!(nodes.len(), COMPACT_NODE_LEN);
        assert_eq!(nodes6.len(), COMPACT_NODE6_LEN);
        assert_eq!(decode_nodes(&nodes), vec![v4]);
        assert_eq!(decode_nodes6(&nodes6), vec![v6]);
    }

    #[test]
    fn compact_peer_lengths() {
        let v4: SocketAddr = "192.168.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        assert_eq!(encode_peer(&v4).len(), 6);
        assert_eq!(encode_peer(&v6).len(), 18);
        assert_eq!(decode_peer(&encode_peer(&v6)), Some(v6));
        assert_eq!(decode_peer(&[1, 2, 3]), None);
    }

    #[test]
    fn error_codes_map_both_ways() {
        assert_eq!(ErrorCode::Protocol.code(), 203);
        assert_eq!(ErrorCode::from_code(302), Some(ErrorCode::SequenceLessThanCurrent));
        assert_eq!(ErrorCode::from_code(999), None);
        assert_eq!(Method::parse("announce_peer"), Some(Method::AnnouncePeer));
        assert_eq!(Method::parse("vote"), None);
    }

    #[test]
    fn sender_id_read_from_args() {
        let id = NodeId::random();
        let mut args = Dict::new();
        args.insert("id".into(), id.into());
        assert_eq!(Message::query(1, Method::Ping, args).sender_id(), Some(id));
        assert_eq!(Message::error(1, ErrorCode::Generic, "x").sender_id(), None);
    }
}
