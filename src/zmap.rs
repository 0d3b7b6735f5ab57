//! Zmap: a binary-searchable checkpoint table into a deflate stream, used
//! to translate desired uncompressed byte ranges into compressed byte
//! ranges, and to re-align a decoder onto an arbitrary checkpoint.
//!
//! Grounded on `examples/original_source/c/libzsync/zmap.c`
//! (`zmap_make`, `zmap_to_compressed_ranges`,
//! `configure_zstream_for_zdata`), reworked from a flat `malloc`'d
//! `off_t*` pair-array into a `Vec<(u64, u64)>` of half-open ranges.

use anyhow::{bail, Result};

/// Bit set on the wire `outbytes_delta` word when a checkpoint is a
/// mid-block safe point rather than a fresh deflate block start.
const GZB_NOTBLOCKSTART: u16 = 0x8000;

/// Heuristic upper bound (bytes) on a deflate block header's length, used
/// to size the extra compressed range fetched to recover a block's Huffman
/// tree before decoding data from a mid-block checkpoint. A magic number
/// in the original implementation; kept as a named constant here rather
/// than inlined, and exposed so callers can assert no real header exceeds it.
pub const BLOCK_HEADER_MAX_BYTES: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub inbits: u64,
    pub outbytes: u64,
    /// 0 if this point is a fresh deflate block start; otherwise the count
    /// of mid-block checkpoints since the last block start.
    pub blockcount: u32,
}

#[derive(Clone)]
pub struct Zmap {
    entries: Vec<Checkpoint>,
}

impl Zmap {
    /// Builds absolute checkpoints from the control file's delta-encoded
    /// `(inbits_delta, outbytes_delta_with_notblockstart_flag)` pairs.
    pub fn build(deltas: &[(u16, u16)]) -> Self {
        let mut entries = Vec::with_capacity(deltas.len());
        let mut in_total: u64 = 0;
        let mut out_total: u64 = 0;
        let mut bc: u32 = 0;
        for &(inbits_delta, out_word) in deltas {
            let notblockstart = out_word & GZB_NOTBLOCKSTART != 0;
            let ob = (out_word & !GZB_NOTBLOCKSTART) as u64;
            if notblockstart {
                bc += 1;
            } else {
                bc = 0;
            }
            in_total += inbits_delta as u64;
            out_total += ob;
            entries.push(Checkpoint {
                inbits: in_total,
                outbytes: out_total,
                blockcount: bc,
            });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[Checkpoint] {
        &self.entries
    }

    /// Entries must be strictly increasing in both `inbits` and `outbytes`,
    /// and the first entry must be a block start.
    pub fn is_well_formed(&self) -> bool {
        if let Some(first) = self.entries.first() {
            if first.blockcount != 0 {
                return false;
            }
        }
        self.entries
            .windows(2)
            .all(|w| w[0].inbits < w[1].inbits && w[0].outbytes < w[1].outbytes)
    }

    /// Translates a list of half-open uncompressed byte ranges into
    /// half-open compressed byte ranges that must be fetched, including
    /// whatever preceding deflate block header is needed to decode them.
    /// Ranges are merged (sorted by start, keeping the furthest end) before
    /// being returned.
    pub fn to_compressed_ranges(&self, uncompressed_ranges: &[(u64, u64)]) -> Result<Vec<(u64, u64)>> {
        let mut out: Vec<(u64, u64)> = Vec::new();
        let mut last_written_block_start: Option<u64> = None;

        for &(start, end) in uncompressed_ranges {
            let mut zstart: Option<u64> = None;
            let mut zend: Option<u64> = None;
            let mut lastblockstart: u64 = 0;

            let n = self.entries.len();
            for j in 0..n {
                if zstart.is_some() && zend.is_some() {
                    break;
                }
                let e = self.entries[j];

                if start < e.outbytes && zstart.is_none() {
                    if j == 0 {
                        bail!("zmap has no checkpoint before the start of range [{start}, {end})");
                    }
                    zstart = Some(self.entries[j - 1].inbits);
                    if last_written_block_start != Some(lastblockstart) {
                        let hdr_start = lastblockstart / 8;
                        out.push((hdr_start, hdr_start + BLOCK_HEADER_MAX_BYTES));
                        last_written_block_start = Some(lastblockstart);
                    }
                }

                if e.blockcount == 0 {
                    lastblockstart = e.inbits;
                }

                if start < e.outbytes && (end <= e.outbytes || j == n - 1) {
                    zend = Some(e.inbits);
                }
            }

            let (zs, ze) = match (zstart, zend) {
                (Some(s), Some(e)) => (s, e),
                _ => bail!("zmap couldn't translate uncompressed range [{start}, {end})"),
            };
            out.push((zs / 8, (ze + 7) / 8));
        }

        out.sort_unstable_by_key(|&(s, _)| s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(out.len());
        for (s, e) in out {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        Ok(merged)
    }

    /// Binary search for the checkpoint whose compressed byte offset
    /// (`inbits/8`) exactly equals `compressed_offset`; returns its
    /// uncompressed byte offset and whether a fresh `inflateInit` is needed
    /// (true iff this checkpoint is a deflate block start).
    pub fn configure_decoder(&self, compressed_offset: u64) -> Result<(u64, bool)> {
        let idx = self
            .entries
            .binary_search_by_key(&compressed_offset, |e| e.inbits / 8)
            .map_err(|_| anyhow::anyhow!("offset {compressed_offset} is not in the zmap"))?;
        let e = self.entries[idx];
        Ok((e.outbytes, e.blockcount == 0))
    }

    /// Bit offset within the byte at `configure_decoder`'s checkpoint —
    /// needed by the decoder to align to the exact bitstream position.
    pub fn bit_offset_within_byte(&self, compressed_offset: u64) -> Result<u8> {
        let idx = self
            .entries
            .binary_search_by_key(&compressed_offset, |e| e.inbits / 8)
            .map_err(|_| anyhow::anyhow!("offset {compressed_offset} is not in the zmap"))?;
        Ok((self.entries[idx].inbits % 8) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Zmap {
        // Four checkpoints, one every ~32KiB of uncompressed output; the
        // third is a mid-block safe point (NOTBLOCKSTART set).
        let deltas = vec![
            (400u16, 32_000u16),
            (380, 32_000),
            (50, 32_000 | GZB_NOTBLOCKSTART),
            (400, 32_000),
        ];
        Zmap::build(&deltas)
    }

    #[test]
    fn well_formed_increasing_with_block_start_first() {
        let z = sample();
        assert!(z.is_well_formed());
        assert_eq!(z.entries()[0].blockcount, 0);
    }

    #[test]
    fn translation_covers_requested_range() {
        let z = sample();
        let ranges = z.to_compressed_ranges(&[(40_000, 90_000)]).unwrap();
        assert!(!ranges.is_empty());
        // every compressed range must be non-empty and sorted
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0 || w[0].1 >= w[1].0);
        }
        for &(s, e) in &ranges {
            assert!(e > s);
        }
    }

    #[test]
    fn mid_block_checkpoint_pulls_in_header_range() {
        let z = sample();
        // Range starting right at the mid-block checkpoint's output offset
        // must fetch the preceding block-start header too.
        let mid_out = z.entries()[2].outbytes;
        let ranges = z.to_compressed_ranges(&[(mid_out, mid_out + 1)]).unwrap();
        assert!(ranges.len() >= 1);
    }

    #[test]
    fn configure_decoder_rejects_unknown_offset() {
        let z = sample();
        assert!(z.configure_decoder(999_999).is_err());
    }

    #[test]
    fn configure_decoder_finds_exact_checkpoint() {
        let z = sample();
        let cp = z.entries()[1];
        let (out_off, is_block_start) = z.configure_decoder(cp.inbits / 8).unwrap();
        assert_eq!(out_off, cp.outbytes);
        assert_eq!(is_block_start, cp.blockcount == 0);
    }
}
