//! # Trackerless - Kademlia DHT Node
//!
//! A node for a Kademlia-style distributed hash table that replaces torrent
//! trackers and doubles as a small key-value store:
//!
//! - **Swarms**: peers announce themselves under an info-hash and look each other up
//! - **Immutable items**: blobs stored under the hash of their content
//! - **Mutable items**: Ed25519-signed records with monotonic sequence numbers
//! - **Resources**: named slots holding one owner-signed value, or one signed
//!   value per author when multi-valued
//! - **Write tokens**: announces and puts require a token bound to the
//!   requester's address, derived from a rotating secret
//!
//! ## Architecture
//!
//! [`DhtNode`] is a cheap-to-clone handle over shared state. Each table sits
//! behind its own short-held lock; inbound datagrams, the maintenance tick and
//! traversal tasks call into the node concurrently. Multi-round operations
//! (bootstrap, lookups, announce, put, get) run as tokio tasks tracked in a
//! traversal registry so shutdown can cancel them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | Orchestrator: lifecycle, dispatch, maintenance tick, public API |
//! | `requests` | Handlers for inbound queries |
//! | `lookup` | Iterative lookups and write fan-out |
//! | `tokens` | Write-token derivation and rotation |
//! | `storage` | Popularity-bounded immutable, mutable and resource tables |
//! | `resource` | Signed resource entries and their wire record |
//! | `swarm` | Info-hash to peer-set directory |
//! | `traversal` | Registry of in-flight traversals |
//! | `routing` | k-bucket routing table with replacement cache |
//! | `rpc` | Transaction correlation and timeouts |
//! | `messages` | Wire messages, bincode codec, compact encodings |
//! | `schema` | Declarative message validation |
//! | `identity` | Node ids, contacts, signing keypairs |
//! | `crypto` | Domain-separated item signatures |
//! | `bloom` | Fixed-size bloom filter |
//! | `protocols` | `Transport` and `DhtObserver` traits |
//! | `transport` | Tokio UDP transport |
//! | `config` | Tunable limits and intervals |

mod bloom;
mod config;
mod crypto;
mod identity;
mod lookup;
mod messages;
mod node;
mod protocols;
mod requests;
mod resource;
mod routing;
mod rpc;
mod schema;
mod storage;
mod swarm;
mod tokens;
mod transport;
mod traversal;

pub use config::DhtConfig;
pub use crypto::SignatureError;
pub use identity::{Contact, ID_LEN, Keypair, NodeId};
pub use lookup::{MutableValue, ScrapeEstimate};
pub use messages::{Body, Dict, ErrorCode, Message, Method, Value, decode, encode};
pub use node::{DhtNode, NodeStatus, PutOutcome};
pub use protocols::{DhtObserver, NodeEvent, NodeState, NoopObserver, Transport};
pub use requests::RequestError;
pub use resource::ResourceEntry;
pub use schema::ValidationError;
pub use storage::PutError;
pub use transport::UdpTransport;
pub use traversal::{TraversalId, TraversalKind};
