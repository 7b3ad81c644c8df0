//! # Item Signatures
//!
//! Mutable items are authored with Ed25519 keys. The signature covers a
//! domain-separated payload so an item signature can never be replayed as a
//! signature for anything else:
//!
//! ```text
//! DOMAIN || salt_len (u16 BE) || salt || seq (u64 BE) || value
//! ```
//!
//! Resource entries use their own domain and cover every field a reader
//! relies on:
//!
//! ```text
//! DOMAIN || owner || name_len (u16 BE) || name || multi (u8) || seq (u64 BE) || time (u64 BE) || value
//! ```
//!
//! The request handler verifies the signature before the store is touched;
//! the store itself only enforces sequence ordering.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Domain separation prefix for mutable item signatures.
pub const ITEM_SIGNATURE_DOMAIN: &[u8] = b"trackerless-item-v1:";

/// Domain separation prefix for resource entry signatures.
pub const RESOURCE_SIGNATURE_DOMAIN: &[u8] = b"trackerless-resource-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Sign data with domain separation.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes()
}

/// Verify a domain-separated signature made by `public_key`.
pub fn verify_with_domain(
    public_key: &[u8; PUBLIC_KEY_LEN],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Build the payload covered by a mutable item signature.
pub fn item_payload(salt: &[u8], seq: u64, value: &[u8]) -> Vec<u8> {
    let salt_len = u16::try_from(salt.len()).unwrap_or(u16::MAX);
    let mut payload = Vec::with_capacity(2 + salt.len() + 8 + value.len());
    payload.extend_from_slice(&salt_len.to_be_bytes());
    payload.extend_from_slice(salt);
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(value);
    payload
}

pub fn sign_item(keypair: &Keypair, salt: &[u8], seq: u64, value: &[u8]) -> [u8; SIGNATURE_LEN] {
    sign_with_domain(keypair, ITEM_SIGNATURE_DOMAIN, &item_payload(salt, seq, value))
}

pub fn verify_item(
    public_key: &[u8; PUBLIC_KEY_LEN],
    salt: &[u8],
    seq: u64,
    value: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    verify_with_domain(
        public_key,
        ITEM_SIGNATURE_DOMAIN,
        &item_payload(salt, seq, value),
        signature,
    )
}

/// Build the payload covered by a resource entry signature.
pub fn resource_payload(
    owner: &[u8; PUBLIC_KEY_LEN],
    resource: &[u8],
    multi: bool,
    seq: u64,
    time: u64,
    value: &[u8],
) -> Vec<u8> {
    let name_len = u16::try_from(resource.len()).unwrap_or(u16::MAX);
    let mut payload = Vec::with_capacity(PUBLIC_KEY_LEN + 2 + resource.len() + 17 + value.len());
    payload.extend_from_slice(owner);
    payload.extend_from_slice(&name_len.to_be_bytes());
    payload.extend_from_slice(resource);
    payload.push(u8::from(multi));
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(&time.to_be_bytes());
    payload.extend_from_slice(value);
    payload
}

pub fn sign_resource(keypair: &Keypair, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
    sign_with_domain(keypair, RESOURCE_SIGNATURE_DOMAIN, payload)
}

pub fn verify_resource(
    signer: &[u8; PUBLIC_KEY_LEN],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    verify_with_domain(signer, RESOURCE_SIGNATURE_DOMAIN, payload, signature)
}
