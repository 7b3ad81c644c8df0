//! Fixed-size bloom filter.
//!
//! Used in two places:
//! - per item, to count distinct announcers without storing their addresses
//! - in scrape replies, to summarize a swarm as two filters (seeds and
//!   downloaders) the requester can estimate sizes from
//!
//! Each insert sets two bits derived from the BLAKE3 hash of the input.

/// Bits set per inserted element.
const HASHES: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter<const BYTES: usize> {
    bits: [u8; BYTES],
}

impl<const BYTES: usize> Default for BloomFilter<BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BYTES: usize> BloomFilter<BYTES> {
    pub const fn new() -> Self {
        Self { bits: [0u8; BYTES] }
    }

    /// Rebuild a filter received off the wire. Returns `None` on size mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bits: [u8; BYTES] = bytes.try_into().ok()?;
        Some(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8; BYTES] {
        &self.bits
    }

    fn positions(data: &[u8]) -> [usize; HASHES] {
        let hash = blake3::hash(data);
        let h = hash.as_bytes();
        let total_bits = BYTES * 8;
        let mut out = [0usize; HASHES];
        for (i, pos) in out.iter_mut().enumerate() {
            let word = u32::from_le_bytes([h[i * 4], h[i * 4 + 1], h[i * 4 + 2], h[i * 4 + 3]]);
            *pos = word as usize % total_bits;
        }
        out
    }

    pub fn set(&mut self, data: &[u8]) {
        for pos in Self::positions(data) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        Self::positions(data)
            .iter()
            .all(|&pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Insert `data`, returning true when it was probably not present before.
    pub fn insert(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return false;
        }
        self.set(data);
        true
    }

    /// Union with another filter of the same size.
    pub fn merge(&mut self, other: &Self) {
        for (dst, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *dst |= *src;
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Estimate how many distinct elements were inserted.
    ///
    /// Uses `n = ln(z / m) / (k * ln(1 - 1/m))` where `m` is the bit count
    /// and `z` the number of zero bits. A saturated filter reports the
    /// estimate for a single remaining zero bit.
    pub fn estimated_count(&self) -> u32 {
        let m = (BYTES * 8) as f64;
        let zeros = (m - self.count_ones() as f64).max(1.0);
        if zeros >= m {
            return 0;
        }
        let n = (zeros / m).ln() / (HASHES as f64 * (1.0 - 1.0 / m).ln());
        n.round() as u32
    }
}
