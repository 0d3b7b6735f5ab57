//! Receiver: turns source-offset-tagged byte chunks from the HTTP client
//! into block-aligned writes through the matching engine's `submit`
//! entry point, either directly (plain mode) or via a deflate decoder
//! fed through the zmap (compressed mode).
//!
//! Grounded on `examples/original_source/c/fetch.c`
//! (`fetch_remaining_blocks_http`'s alignment/padding logic) and
//! `c/zfetch.c` (`fetch_remaining_blocks_zlib_http`'s inflate loop and
//! 32 KiB sliding-window preload), using `flate2::Decompress` instead of
//! a raw `zlib` binding.
//!
//! Scope note: `zfetch.c` relies on a site-patched zlib's
//! `inflate_advance`/`inflatePrime` to resume mid-byte inside a deflate
//! block. `flate2` doesn't expose that primitive, so compressed-mode
//! checkpoints here are required to land on a byte boundary
//! (`inbits % 8 == 0`); a non-byte-aligned checkpoint is reported as a
//! configuration error rather than silently misdecoding.

use anyhow::{bail, Context, Result};
use flate2::{Decompress, FlushDecompress, Status};

use crate::rangemap::{BlockId, RangeMap};
use crate::scratch::ScratchStore;
use crate::sigtable::SignatureTable;
use crate::zmap::Zmap;

pub struct PlainReceiver {
    blocksize: u64,
    /// Partial block accumulated while waiting for a block boundary.
    pending: Vec<u8>,
    pending_start_offset: u64,
    outoffset: u64,
}

impl PlainReceiver {
    pub fn new(blocksize: u64) -> Self {
        Self {
            blocksize,
            pending: Vec::new(),
            pending_start_offset: 0,
            outoffset: 0,
        }
    }

    /// Feeds `data` tagged with its offset in the target file. Whole
    /// blocks are submitted directly; a non-aligned leading/trailing
    /// fragment accumulates in `pending`.
    pub fn receive_data(
        &mut self,
        data: &[u8],
        offset: u64,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        let mut cursor = offset;
        let mut buf = data;

        if !self.pending.is_empty() {
            if cursor != self.pending_start_offset + self.pending.len() as u64 {
                bail!("receiver got non-contiguous data while a partial block was pending");
            }
            let need = (self.blocksize as usize) - self.pending.len();
            let take = need.min(buf.len());
            self.pending.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            cursor += take as u64;
            if self.pending.len() == self.blocksize as usize {
                let data = self.pending.clone();
                self.submit_block_bytes(&data, self.pending_start_offset, sigs, store, ranges)?;
                self.pending.clear();
            } else {
                return Ok(());
            }
        }

        let block_bytes = self.blocksize as usize;
        while buf.len() >= block_bytes {
            let block = &buf[..block_bytes];
            self.submit_block_bytes(block, cursor, sigs, store, ranges)?;
            buf = &buf[block_bytes..];
            cursor += self.blocksize;
        }

        if !buf.is_empty() {
            self.pending_start_offset = cursor;
            self.pending = buf.to_vec();
        }
        self.outoffset = offset + data.len() as u64;
        Ok(())
    }

    fn submit_block_bytes(
        &self,
        block: &[u8],
        offset: u64,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        let id = (offset / self.blocksize) as BlockId;
        let cksum = crate::checksum::strong_checksum(block, self.blocksize as usize);
        let declared = &sigs.entry(id).checksum[..sigs.checksum_bytes()];
        if &cksum[..sigs.checksum_bytes()] != declared {
            // Strong-checksum mismatch on received data: discard, keep going.
            return Ok(());
        }
        store.write_blocks(block, id, id, sigs, ranges)
    }

    /// Called when the fetch ends: flushes a short final block, zero-padded.
    pub fn finish(
        &mut self,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        if !self.pending.is_empty() {
            let mut padded = self.pending.clone();
            padded.resize(self.blocksize as usize, 0);
            self.submit_block_bytes(&padded, self.pending_start_offset, sigs, store, ranges)?;
            self.pending.clear();
        }
        Ok(())
    }
}

pub struct CompressedReceiver<'a> {
    blocksize: u64,
    zmap: &'a Zmap,
    decoder: Option<Decompress>,
    outbuf: Vec<u8>,
    outoffset: u64,
    last_in_offset: Option<u64>,
}

impl<'a> CompressedReceiver<'a> {
    pub fn new(blocksize: u64, zmap: &'a Zmap) -> Self {
        Self {
            blocksize,
            zmap,
            decoder: None,
            outbuf: vec![0u8; blocksize as usize],
            outoffset: 0,
            last_in_offset: None,
        }
    }

    pub fn receive_data(
        &mut self,
        data: &[u8],
        offset: u64,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        let needs_reconfigure = match self.last_in_offset {
            None => true,
            Some(prev) => prev != offset,
        };

        if needs_reconfigure {
            let bit_in_byte = self
                .zmap
                .bit_offset_within_byte(offset)
                .context("compressed checkpoint lookup")?;
            if bit_in_byte != 0 {
                bail!(
                    "checkpoint at compressed offset {offset} is not byte-aligned \
                     (bit {bit_in_byte}); unsupported without a bit-priming inflate"
                );
            }
            let (out_off, is_block_start) = self
                .zmap
                .configure_decoder(offset)
                .context("configuring decoder from zmap")?;
            self.outoffset = out_off;

            if is_block_start || self.decoder.is_none() {
                let mut d = Decompress::new(false);
                let lookback = self.outoffset.min(32 * 1024);
                if lookback > 0 {
                    let mut window = vec![0u8; lookback as usize];
                    store.read_known_data(&mut window, self.outoffset - lookback)?;
                    let _ = d.set_dictionary(&window);
                }
                self.decoder = Some(d);
            }

            let partial = (self.outoffset % self.blocksize) as usize;
            self.outbuf = vec![0u8; self.blocksize as usize - partial];
        }

        let decoder = self.decoder.as_mut().context("decoder not initialised")?;
        let mut input = data;
        let mut out_pos = 0usize;
        loop {
            if out_pos == self.outbuf.len() {
                self.flush_block(sigs, store, ranges)?;
                self.outbuf = vec![0u8; self.blocksize as usize];
                out_pos = 0;
            }
            if input.is_empty() {
                break;
            }
            let before_in = decoder.total_in();
            let before_out = decoder.total_out();
            let status = decoder
                .decompress(input, &mut self.outbuf[out_pos..], FlushDecompress::Sync)
                .context("inflating compressed range")?;
            let consumed = (decoder.total_in() - before_in) as usize;
            let produced = (decoder.total_out() - before_out) as usize;
            input = &input[consumed..];
            out_pos += produced;

            if matches!(status, Status::StreamEnd) {
                if out_pos > 0 {
                    self.outbuf.truncate(out_pos);
                    self.outbuf.resize(self.blocksize as usize, 0);
                    self.flush_block(sigs, store, ranges)?;
                }
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        self.last_in_offset = Some(offset + data.len() as u64);
        Ok(())
    }

    fn flush_block(
        &mut self,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        if self.outoffset % self.blocksize == 0 {
            let id = (self.outoffset / self.blocksize) as BlockId;
            let cksum = crate::checksum::strong_checksum(&self.outbuf, self.blocksize as usize);
            let declared = &sigs.entry(id).checksum[..sigs.checksum_bytes()];
            if &cksum[..sigs.checksum_bytes()] == declared {
                store.write_blocks(&self.outbuf, id, id, sigs, ranges)?;
            }
            self.outoffset += self.blocksize;
        } else {
            self.outoffset += self.outbuf.len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(blocksize: u64, blocks: u32) -> (SignatureTable, ScratchStore, RangeMap, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sigs = SignatureTable::new(blocks, 1, 4, 16);
        let store = ScratchStore::new(dir.path(), blocksize).unwrap();
        let ranges = RangeMap::new(blocks);
        (sigs, store, ranges, dir)
    }

    #[test]
    fn plain_receiver_submits_aligned_blocks() {
        let (mut sigs, mut store, mut ranges, _dir) = fresh(4, 2);
        sigs.add_target_block(0, crate::checksum::rsum_block(b"aaaa"), &crate::checksum::strong_checksum(b"aaaa", 4));
        sigs.add_target_block(1, crate::checksum::rsum_block(b"bbbb"), &crate::checksum::strong_checksum(b"bbbb", 4));
        sigs.build_hash();

        let mut recv = PlainReceiver::new(4);
        recv.receive_data(b"aaaabbbb", 0, &mut sigs, &mut store, &mut ranges)
            .unwrap();

        assert!(ranges.contains(0));
        assert!(ranges.contains(1));
    }

    #[test]
    fn plain_receiver_discards_bad_checksum_block() {
        let (mut sigs, mut store, mut ranges, _dir) = fresh(4, 1);
        sigs.add_target_block(0, crate::checksum::rsum_block(b"aaaa"), &crate::checksum::strong_checksum(b"aaaa", 4));
        sigs.build_hash();

        let mut recv = PlainReceiver::new(4);
        recv.receive_data(b"XXXX", 0, &mut sigs, &mut store, &mut ranges)
            .unwrap();
        assert!(!ranges.contains(0));
    }

    #[test]
    fn plain_receiver_flushes_trailing_partial_block_on_finish() {
        let (mut sigs, mut store, mut ranges, _dir) = fresh(4, 1);
        sigs.add_target_block(0, crate::checksum::rsum_block(b"ab\0\0"), &crate::checksum::strong_checksum(b"ab\0\0", 4));
        sigs.build_hash();

        let mut recv = PlainReceiver::new(4);
        recv.receive_data(b"ab", 0, &mut sigs, &mut store, &mut ranges)
            .unwrap();
        assert!(!ranges.contains(0));
        recv.finish(&mut sigs, &mut store, &mut ranges).unwrap();
        assert!(ranges.contains(0));
    }

    #[test]
    fn fresh_receiver_accepts_a_retry_restarting_from_the_block_boundary() {
        // Mirrors a dropped connection mid-block: one receiver gets a
        // partial block and is then discarded, and a new receiver (as the
        // driver now constructs per connection attempt) gets the same
        // range again from its block-aligned start, not from the old
        // fragment's tail.
        let (mut sigs, mut store, mut ranges, _dir) = fresh(4, 1);
        sigs.add_target_block(0, crate::checksum::rsum_block(b"aaaa"), &crate::checksum::strong_checksum(b"aaaa", 4));
        sigs.build_hash();

        let mut dropped = PlainReceiver::new(4);
        dropped.receive_data(b"aa", 0, &mut sigs, &mut store, &mut ranges).unwrap();
        assert!(!ranges.contains(0));
        drop(dropped);

        let mut retried = PlainReceiver::new(4);
        retried.receive_data(b"aaaa", 0, &mut sigs, &mut store, &mut ranges).unwrap();
        assert!(ranges.contains(0));
    }
}
