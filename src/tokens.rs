//! # Write Token Authority
//!
//! A node only accepts `announce_peer` and `put` from requesters that recently
//! asked it for the same key. The proof is a short token handed out in every
//! `get_peers`/`get` reply:
//!
//! ```text
//! token = BLAKE3(secret || requester_ip || key)[..TOKEN_LEN]
//! ```
//!
//! Tokens are never stored. Verification recomputes them under the current
//! and the previous secret, so a token stays valid for between one and two
//! rotation periods. Rotating twice invalidates everything issued before the
//! first rotation.
//!
//! The secret pair sits behind a single short-held lock: a verifier always
//! sees both secrets from the same generation.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::identity::NodeId;

/// Length of a write token in bytes.
pub const TOKEN_LEN: usize = 4;

pub type Token = [u8; TOKEN_LEN];

#[derive(Clone, Copy)]
struct Secrets {
    current: u64,
    previous: u64,
    rotated_at: Instant,
}

impl Secrets {
    fn rotate(&mut self, now: Instant) {
        self.previous = self.current;
        self.current = OsRng.next_u64();
        self.rotated_at = now;
    }
}

pub struct TokenAuthority {
    secrets: RwLock<Secrets>,
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenAuthority {
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    pub fn new_at(now: Instant) -> Self {
        Self {
            secrets: RwLock::new(Secrets {
                current: OsRng.next_u64(),
                previous: OsRng.next_u64(),
                rotated_at: now,
            }),
        }
    }

    fn derive(secret: u64, addr: &IpAddr, key: &NodeId) -> Token {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&secret.to_le_bytes());
        match addr {
            IpAddr::V4(v4) => hasher.update(&v4.octets()),
            IpAddr::V6(v6) => hasher.update(&v6.octets()),
        };
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&hash.as_bytes()[..TOKEN_LEN]);
        token
    }

    /// Token the requester at `addr` must present to write under `key`.
    pub fn generate_token(&self, addr: &IpAddr, key: &NodeId) -> Token {
        let current = self.secrets.read().current;
        Self::derive(current, addr, key)
    }

    /// Accepts tokens derived from the current or the previous secret.
    pub fn verify_token(&self, token: &[u8], key: &NodeId, addr: &IpAddr) -> bool {
        if token.len() != TOKEN_LEN {
            return false;
        }
        let (current, previous) = {
            let secrets = self.secrets.read();
            (secrets.current, secrets.previous)
        };
        token == Self::derive(current, addr, key) || token == Self::derive(previous, addr, key)
    }

    /// Shift the current secret into `previous` and draw a fresh one.
    pub fn rotate_secret(&self, now: Instant) {
        self.secrets.write().rotate(now);
    }

    /// Rotate if `interval` has passed since the last rotation.
    /// Returns true when a rotation happened.
    pub fn rotate_if_due(&self, now: Instant, interval: Duration) -> bool {
        // Checked under the write lock so overlapping callers rotate once.
        let mut secrets = self.secrets.write();
        if now.saturating_duration_since(secrets.rotated_at) < interval {
            return false;
        }
        secrets.rotate(now);
        drop(secrets);
        debug!("write token secret rotated");
        true
    }

    /// Time left until the next rotation is due.
    pub fn until_rotation(&self, now: Instant, interval: Duration) -> Duration {
        let elapsed = now.saturating_duration_since(self.secrets.read().rotated_at);
        interval.saturating_sub(elapsed)
    }
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}
