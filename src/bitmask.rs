//! # Bitmask Shard Identifiers
//!
//! Every topic-shard in the overlay is named by a fixed 256-bit [`Bitmask`].
//! Bitmasks are used in two ways:
//!
//! | Mode | Meaning |
//! |------|---------|
//! | Raw | The bitmask is the join key, byte for byte |
//! | Derived | The bitmask is split into elementary (single-bit) bitmasks |
//!
//! Content is mapped onto a bitmask with [`bloom_index`], which sets a small
//! number of bits chosen by hashing the content. A node that subscribes to the
//! elementary components of a broad filter receives every message whose
//! content-derived bitmask shares at least one bit with that filter. False
//! positives are possible; false negatives are not.
//!
//! ## Bit Ordering
//!
//! Bit `i` lives in byte `i / 8` under mask `0x80 >> (i % 8)`, so bit 0 is the
//! most significant bit of the first byte.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a bitmask in bytes.
pub const BITMASK_LEN: usize = 32;

/// Number of addressable bits in a bitmask.
pub const BITMASK_BITS: usize = BITMASK_LEN * 8;

/// Vector width used when deriving a bitmask from published content.
/// Must stay a power of two so hash reduction does not bias positions.
pub const BLOOM_WIDTH_BITS: usize = 256;

/// Number of bits set when deriving a bitmask from published content.
pub const BLOOM_SET_BITS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bitmask([u8; BITMASK_LEN]);

impl Bitmask {
    /// Every bit set. Reserved as the discovery namespace.
    pub const ALL: Bitmask = Bitmask([0xff; BITMASK_LEN]);

    pub const ZERO: Bitmask = Bitmask([0u8; BITMASK_LEN]);

    #[inline]
    pub const fn from_bytes(bytes: [u8; BITMASK_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; BITMASK_LEN] {
        &self.0
    }

    /// Bitmask with only `bit` set, or `None` if `bit` is out of range.
    pub fn elementary(bit: usize) -> Option<Self> {
        if bit >= BITMASK_BITS {
            return None;
        }
        let mut mask = Self::ZERO;
        mask.set_bit(bit);
        Some(mask)
    }

    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < BITMASK_BITS && self.0[bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    #[inline]
    pub fn set_bit(&mut self, bit: usize) {
        if bit < BITMASK_BITS {
            self.0[bit / 8] |= 0x80 >> (bit % 8);
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn is_elementary(&self) -> bool {
        self.count_ones() == 1
    }

    /// True when the two bitmasks share at least one set bit.
    pub fn overlaps(&self, other: &Bitmask) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a & b != 0)
    }

    /// Index of the lowest set bit, `None` for [`Bitmask::ZERO`].
    pub fn first_bit(&self) -> Option<usize> {
        let (byte, value) = self.0.iter().enumerate().find(|(_, b)| **b != 0)?;
        Some(byte * 8 + value.leading_zeros() as usize)
    }

    /// Split into one elementary bitmask per set bit, in ascending bit order.
    pub fn decompose(&self) -> Vec<Bitmask> {
        (0..BITMASK_BITS)
            .filter(|&bit| self.is_set(bit))
            .filter_map(Self::elementary)
            .collect()
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; BITMASK_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmask({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Bitmask {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; BITMASK_LEN]> for Bitmask {
    fn from(bytes: [u8; BITMASK_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Bitmask {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Derive a content-addressed bitmask with `set_bits` distinct bits inside the
/// first `width_bits` positions.
///
/// The BLAKE3 digest of `data` is read as little-endian `u16` words, each
/// reduced to a bit position. When the digest runs out before enough distinct
/// positions are found, the content is re-hashed with a round counter.
///
/// `width_bits` is clamped to [`BITMASK_BITS`] and rounded down to a power of
/// two; `set_bits` is clamped to the resulting width.
pub fn bloom_index(data: &[u8], width_bits: usize, set_bits: usize) -> Bitmask {
    let width = effective_width(width_bits);
    let wanted = set_bits.min(width);

    let mut mask = Bitmask::ZERO;
    let mut placed = 0usize;
    let mut round: u32 = 0;

    while placed < wanted {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        if round > 0 {
            hasher.update(&round.to_le_bytes());
        }
        let digest = hasher.finalize();

        for word in digest.as_bytes().chunks_exact(2) {
            let bit = u16::from_le_bytes([word[0], word[1]]) as usize & (width - 1);
            if !mask.is_set(bit) {
                mask.set_bit(bit);
                placed += 1;
                if placed == wanted {
                    break;
                }
            }
        }
        round += 1;
    }

    mask
}

/// Largest power of two not above `width_bits`, within `1..=BITMASK_BITS`.
fn effective_width(width_bits: usize) -> usize {
    let clamped = width_bits.clamp(1, BITMASK_BITS);
    1 << (usize::BITS - 1 - clamped.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_and_zero_constants() {
        assert_eq!(Bitmask::ALL.count_ones(), 256);
        assert!(Bitmask::ZERO.is_zero());
        assert!(!Bitmask::ALL.is_zero());
        assert_eq!(Bitmask::ALL.to_hex(), "ff".repeat(32));
    }

    #[test]
    fn bit_ordering_is_msb_first() {
        let first = Bitmask::elementary(0).unwrap();
        assert_eq!(first.as_bytes()[0], 0x80);

        let ninth = Bitmask::elementary(9).unwrap();
        assert_eq!(ninth.as_bytes()[1], 0x40);

        let last = Bitmask::elementary(255).unwrap();
        assert_eq!(last.as_bytes()[31], 0x01);

        assert!(Bitmask::elementary(256).is_none());
    }

    #[test]
    fn first_bit_uses_bit_numbering() {
        assert_eq!(Bitmask::ZERO.first_bit(), None);
        assert_eq!(Bitmask::ALL.first_bit(), Some(0));
        for bit in [0, 1, 7, 8, 100, 255] {
            assert_eq!(Bitmask::elementary(bit).unwrap().first_bit(), Some(bit));
        }

        let mut mask = Bitmask::ZERO;
        mask.set_bit(200);
        mask.set_bit(9);
        assert_eq!(mask.first_bit(), Some(9));
    }

    #[test]
    fn decompose_yields_one_mask_per_set_bit() {
        let mut mask = Bitmask::ZERO;
        mask.set_bit(3);
        mask.set_bit(100);
        mask.set_bit(255);

        let parts = mask.decompose();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(Bitmask::is_elementary));
        assert!(parts[0].is_set(3));
        assert!(parts[1].is_set(100));
        assert!(parts[2].is_set(255));

        assert_eq!(Bitmask::ALL.decompose().len(), 256);
        assert!(Bitmask::ZERO.decompose().is_empty());
    }

    #[test]
    fn elementary_decomposes_to_itself() {
        let mask = Bitmask::elementary(42).unwrap();
        assert_eq!(mask.decompose(), vec![mask]);
    }

    #[test]
    fn bloom_index_is_deterministic() {
        let a = bloom_index(b"hello world", BLOOM_WIDTH_BITS, BLOOM_SET_BITS);
        let b = bloom_index(b"hello world", BLOOM_WIDTH_BITS, BLOOM_SET_BITS);
        assert_eq!(a, b);
        assert_eq!(a.count_ones(), BLOOM_SET_BITS as u32);
    }

    #[test]
    fn bloom_index_differs_for_different_content() {
        let mut distinct = std::collections::HashSet::new();
        for i in 0..64u32 {
            distinct.insert(bloom_index(&i.to_le_bytes(), BLOOM_WIDTH_BITS, BLOOM_SET_BITS));
        }
        // 64 inputs over C(256, 3) ≈ 2.7M outcomes; collisions are vanishingly rare.
        assert!(distinct.len() >= 63);
    }

    #[test]
    fn bloom_index_respects_width() {
        let mask = bloom_index(b"narrow", 16, 4);
        assert_eq!(mask.count_ones(), 4);
        assert!(mask.decompose().iter().all(|m| (0..16).any(|bit| m.is_set(bit))));

        // Non power of two widths round down.
        let mask = bloom_index(b"odd width", 100, 2);
        assert!((64..BITMASK_BITS).all(|bit| !mask.is_set(bit)));
    }

    #[test]
    fn bloom_index_saturates_small_widths() {
        let mask = bloom_index(b"tiny", 4, 10);
        assert_eq!(mask.count_ones(), 4);

        assert!(bloom_index(b"none", BLOOM_WIDTH_BITS, 0).is_zero());
    }

    #[test]
    fn overlap_detection() {
        let content = bloom_index(b"payload", BLOOM_WIDTH_BITS, BLOOM_SET_BITS);
        let parts = content.decompose();
        assert!(parts.iter().all(|p| p.overlaps(&content)));
        assert!(Bitmask::ALL.overlaps(&content));
        assert!(!Bitmask::ZERO.overlaps(&content));
    }

    #[test]
    fn hex_round_trip_and_errors() {
        let mask = bloom_index(b"hex", BLOOM_WIDTH_BITS, BLOOM_SET_BITS);
        let parsed: Bitmask = mask.to_string().parse().unwrap();
        assert_eq!(parsed, mask);

        assert!(Bitmask::from_hex("abcd").is_err());
        assert!(Bitmask::from_hex(&"zz".repeat(32)).is_err());
    }
}
