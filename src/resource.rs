//! # Resources
//!
//! A resource is a named slot owned by an Ed25519 key. Every entry written
//! into it is signed by its author over the whole record:
//!
//! | Mode | Writers | Entries kept |
//! |------|---------|--------------|
//! | single | the owner only | one, replaced by a higher `seq` |
//! | multi | anyone | one per signer, oldest `time` dropped when full |
//!
//! ## Wire Shape
//!
//! ```text
//! { k: signer, sig: signature, p: { o: owner, r: name, m: multi?, seq, time, v } }
//! ```
//!
//! `put` carries one such record at the top level of its arguments; `get`
//! replies list every stored record under `l`.

use crate::crypto::{self, PUBLIC_KEY_LEN, SIGNATURE_LEN, SignatureError};
use crate::identity::{Keypair, NodeId};
use crate::messages::{Dict, DictExt, Value};
use crate::schema::{KeyDesc, ValidationError, verify_message};

/// Shape of one signed record, wherever it appears.
const ENTRY: &[KeyDesc] = &[
    KeyDesc::bytes("k", PUBLIC_KEY_LEN),
    KeyDesc::bytes("sig", SIGNATURE_LEN),
    KeyDesc::dict("p").parse_children(),
    KeyDesc::bytes("o", PUBLIC_KEY_LEN),
    KeyDesc::bytes("r", 0),
    KeyDesc::int("m").optional(),
    KeyDesc::int("seq"),
    KeyDesc::int("time"),
    KeyDesc::bytes("v", 0).last_child(),
];

/// One signed value stored under a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceEntry {
    pub owner: [u8; PUBLIC_KEY_LEN],
    pub resource: Vec<u8>,
    pub multi: bool,
    pub seq: u64,
    /// Author's wall clock, seconds since the Unix epoch.
    pub time: u64,
    pub value: Vec<u8>,
    pub signer: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl ResourceEntry {
    /// Build and sign an entry authored by `keypair`.
    pub fn signed(
        keypair: &Keypair,
        owner: [u8; PUBLIC_KEY_LEN],
        resource: &[u8],
        multi: bool,
        seq: u64,
        time: u64,
        value: Vec<u8>,
    ) -> Self {
        let mut entry = Self {
            owner,
            resource: resource.to_vec(),
            multi,
            seq,
            time,
            value,
            signer: keypair.public_key_bytes(),
            signature: [0; SIGNATURE_LEN],
        };
        entry.signature = crypto::sign_resource(keypair, &entry.payload());
        entry
    }

    pub fn key(&self) -> NodeId {
        NodeId::for_resource(&self.owner, &self.resource, self.multi)
    }

    fn payload(&self) -> Vec<u8> {
        crypto::resource_payload(
            &self.owner,
            &self.resource,
            self.multi,
            self.seq,
            self.time,
            &self.value,
        )
    }

    /// Single-valued resources only take writes from their owner.
    pub fn signer_allowed(&self) -> bool {
        self.multi || self.signer == self.owner
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        crypto::verify_resource(&self.signer, &self.payload(), &self.signature)
    }

    /// Whether this entry belongs to the slot `(owner, resource, multi)`.
    pub(crate) fn is_for(&self, owner: &[u8; PUBLIC_KEY_LEN], resource: &[u8], multi: bool) -> bool {
        self.owner == *owner && self.resource == resource && self.multi == multi
    }

    pub(crate) fn to_wire(&self) -> Dict {
        let mut p = Dict::new();
        p.insert("o".into(), Value::Bytes(self.owner.to_vec()));
        p.insert("r".into(), Value::Bytes(self.resource.clone()));
        if self.multi {
            p.insert("m".into(), Value::Int(1));
        }
        p.insert("seq".into(), Value::Int(i64::try_from(self.seq).unwrap_or(i64::MAX)));
        p.insert("time".into(), Value::Int(i64::try_from(self.time).unwrap_or(i64::MAX)));
        p.insert("v".into(), Value::Bytes(self.value.clone()));

        let mut record = Dict::new();
        record.insert("k".into(), Value::Bytes(self.signer.to_vec()));
        record.insert("sig".into(), Value::Bytes(self.signature.to_vec()));
        record.insert("p".into(), Value::Dict(p));
        record
    }

    /// Parse a record out of `dict`. Keys outside the record are ignored, so
    /// this also reads the record embedded in `put` arguments. The signature
    /// is not checked here.
    pub(crate) fn from_wire(dict: &Dict, path: &str) -> Result<Self, ValidationError> {
        verify_message(dict, path, ENTRY)?;
        let p_path = if path.is_empty() {
            "p".to_string()
        } else {
            format!("{path}.p")
        };
        let p = dict
            .get("p")
            .and_then(Value::as_dict)
            .ok_or_else(|| ValidationError::Missing { path: p_path.clone() })?;

        let out_of_range = |name: &str| ValidationError::OutOfRange {
            path: format!("{p_path}.{name}"),
        };
        let fixed = |source: &Dict, name: &str| -> Result<[u8; PUBLIC_KEY_LEN], ValidationError> {
            source
                .bytes(name)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| out_of_range(name))
        };
        let counter = |name: &str| -> Result<u64, ValidationError> {
            p.int(name)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| out_of_range(name))
        };

        Ok(Self {
            owner: fixed(p, "o")?,
            resource: p.bytes("r").unwrap_or_default().to_vec(),
            multi: p.flag("m"),
            seq: counter("seq")?,
            time: counter("time")?,
            value: p.bytes("v").unwrap_or_default().to_vec(),
            signer: fixed(dict, "k")?,
            signature: dict
                .bytes("sig")
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| out_of_range("sig"))?,
        })
    }
}
