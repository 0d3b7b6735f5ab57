//! Weak rolling checksum and strong (MD4) block checksum.
//!
//! The weak checksum is the rsync-style two-lane sum: `a = sum(d[i])`,
//! `b = sum((L-i)*d[i])`, both mod 2^16, with an O(1) roll when the window
//! advances by one byte. This is the zsync variant (no `CHAR_OFFSET` bias),
//! grounded on `examples/original_source/c/librcksum/rsum.c`.

use md4::{Digest, Md4};

/// CHECKSUM_SIZE from the control-file format: full MD4 digest length.
pub const CHECKSUM_SIZE: usize = 16;

/// A weak checksum pair, 16 bits per lane, matching the wire `struct rsum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rsum {
    pub a: u16,
    pub b: u16,
}

impl Rsum {
    /// Mask `a` to the number of bits the control file actually stores
    /// (0, 8 or 16 depending on `rsum_bytes`).
    pub fn masked_a(self, mask: u16) -> u16 {
        self.a & mask
    }
}

/// Compute the rsum afresh over a window of bytes (`rcksum_calc_rsum_block`).
pub fn rsum_block(data: &[u8]) -> Rsum {
    let mut a: u16 = 0;
    let mut b: u16 = 0;
    let len = data.len();
    for (i, &c) in data.iter().enumerate() {
        let remaining = (len - i) as u16;
        a = a.wrapping_add(c as u16);
        b = b.wrapping_add(remaining.wrapping_mul(c as u16));
    }
    Rsum { a, b }
}

/// Roll the checksum forward by one byte: `oc` leaves the window, `nc`
/// enters it. `shift = log2(blocksize)`.
///
/// Must reproduce a fresh computation over the shifted window:
/// `rsum_roll(rsum_block(d[i..i+L]), d[i], d[i+L], log2(L)) ==
/// rsum_block(d[i+1..i+1+L])` for any window length `L`.
pub fn rsum_roll(r: Rsum, oc: u8, nc: u8, shift: u32) -> Rsum {
    let a = r.a.wrapping_add(nc as u16).wrapping_sub(oc as u16);
    let b = r.b.wrapping_add(a).wrapping_sub((oc as u16) << shift);
    Rsum { a, b }
}

/// MD4 digest of `data`, zero-padded to `blocksize` if short.
pub fn strong_checksum(data: &[u8], blocksize: usize) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Md4::new();
    hasher.update(data);
    if data.len() < blocksize {
        let pad = vec![0u8; blocksize - data.len()];
        hasher.update(&pad);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rsum_block_matches_manual_sum() {
        let data = b"abcdef";
        let r = rsum_block(data);
        let mut a: u16 = 0;
        let mut b: u16 = 0;
        for (i, &c) in data.iter().enumerate() {
            a = a.wrapping_add(c as u16);
            b = b.wrapping_add(((data.len() - i) as u16).wrapping_mul(c as u16));
        }
        assert_eq!(r, Rsum { a, b });
    }

    #[test]
    fn strong_checksum_pads_short_block() {
        let full = strong_checksum(b"hi", 4);
        let manual = strong_checksum(b"hi\0\0", 4);
        assert_eq!(full, manual);
    }

    proptest! {
        /// Rolling the checksum forward one byte at a time must always
        /// agree with recomputing it from scratch over the new window.
        #[test]
        fn rolling_matches_fresh_computation(
            data in prop::collection::vec(any::<u8>(), 5..200),
            l in 1usize..4,
        ) {
            let len = 1usize << l;
            if data.len() > len + 1 {
                for i in 0..(data.len() - len - 1) {
                    let base = rsum_block(&data[i..i + len]);
                    let rolled = rsum_roll(base, data[i], data[i + len], l as u32);
                    let fresh = rsum_block(&data[i + 1..i + 1 + len]);
                    prop_assert_eq!(rolled, fresh);
                }
            }
        }
    }
}
