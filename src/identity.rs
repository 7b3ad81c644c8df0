//! # Identifiers, Contacts and Signing Keys
//!
//! This module defines the identity types shared by every other component:
//!
//! - [`NodeId`]: 160-bit identifier used for nodes, info-hashes and item keys
//! - [`Contact`]: a node id bound to the UDP address it was seen at
//! - [`Keypair`]: Ed25519 signing keypair used to author mutable items
//!
//! ## Key Space
//!
//! Every node and every piece of content lives in the same 160-bit key space.
//! Closeness is measured with the XOR metric: `distance(a, b) = a ^ b`,
//! compared as a big-endian unsigned integer (see [`distance_cmp`]).
//!
//! Content keys are derived, never chosen:
//! - immutable items: `BLAKE3(value)[..20]`
//! - mutable items: `BLAKE3(public_key || salt)[..20]`
//! - resources: `BLAKE3(owner || len || name || "s"/"m")[..20]`
//!
//! so only the holder of the private key can extend a mutable item's history.

use std::net::SocketAddr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of a [`NodeId`] in bytes.
pub const ID_LEN: usize = 20;

/// XOR distance between two ids.
pub type Distance = [u8; ID_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice of exactly [`ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Draw a uniformly random id from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Key under which an immutable value is stored.
    pub fn for_content(value: &[u8]) -> Self {
        Self::truncate_hash(blake3::hash(value))
    }

    /// Key under which a mutable item authored by `public_key` is stored.
    pub fn for_mutable(public_key: &[u8; 32], salt: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(public_key);
        hasher.update(salt);
        Self::truncate_hash(hasher.finalize())
    }

    /// Key of the resource slot `resource` owned by `owner`. Single- and
    /// multi-valued slots with the same name live under different keys.
    pub fn for_resource(owner: &[u8; 32], resource: &[u8], multi: bool) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(owner);
        hasher.update(&(resource.len() as u64).to_be_bytes());
        hasher.update(resource);
        hasher.update(if multi { b"m" } else { b"s" });
        Self::truncate_hash(hasher.finalize())
    }

    fn truncate_hash(hash: blake3::Hash) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other` (160 when equal).
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_LEN * 8
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Short hex prefix used in log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Compare two XOR distances numerically.
///
/// ```ignore
/// let da = target.xor_distance(&a);
/// let db = target.xor_distance(&b);
/// if distance_cmp(&da, &db) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> std::cmp::Ordering {
    a.cmp(b)
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A remote node as known to the routing layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Ed25519 keypair used to author mutable items.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Storage key of the mutable item this keypair authors under `salt`.
    pub fn item_key(&self, salt: &[u8]) -> NodeId {
        NodeId::for_mutable(&self.public_key_bytes(), salt)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}
