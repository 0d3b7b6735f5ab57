//! Matching engine: the rolling-checksum sweep over local source data
//! (seed files) that discovers target blocks already present locally.
//!
//! Grounded on `examples/original_source/c/librcksum/rsum.c`
//! (`rcksum_submit_source_data`, `check_checksums_on_hash_chain`,
//! `rcksum_submit_source_file`'s buffer-overlap contract).

use anyhow::Result;

use crate::checksum::{rsum_block, rsum_roll, strong_checksum, Rsum};
use crate::rangemap::{BlockId, RangeMap};
use crate::scratch::ScratchStore;
use crate::sigtable::SignatureTable;

pub struct Matcher {
    seq_matches: u8,
    blocksize: u64,
    r0: Rsum,
    r1: Rsum,
    /// Bytes to skip at the start of the next `submit_source_data` call.
    skip: usize,
    /// Hint: next signature index to try as a fast-path single-chain probe.
    next_match: Option<BlockId>,
    pub blocks_matched: u64,
}

impl Matcher {
    pub fn new(seq_matches: u8, blocksize: u64) -> Self {
        Self {
            seq_matches,
            blocksize,
            r0: Rsum::default(),
            r1: Rsum::default(),
            skip: 0,
            next_match: None,
            blocks_matched: 0,
        }
    }

    fn context(&self) -> usize {
        (self.blocksize as usize) * (self.seq_matches as usize)
    }

    /// Feeds a chunk of source bytes at `offset` in the source stream.
    /// `data` must include `context()` bytes of lookahead beyond the last
    /// usable window position, per the overlapping-buffer contract: the
    /// caller repeats the trailing `context()` bytes of one call as the
    /// leading bytes of the next.
    pub fn submit_source_data(
        &mut self,
        data: &[u8],
        offset: u64,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        if !sigs.is_built() {
            sigs.build_hash();
        }

        let bs = self.blocksize as usize;
        let mut x = if offset == 0 {
            self.next_match = None;
            0
        } else {
            self.skip
        };

        if x != 0 || offset == 0 {
            self.r0 = rsum_block(&data[x..x + bs]);
            if self.seq_matches > 1 {
                self.r1 = rsum_block(&data[x + bs..x + 2 * bs]);
            }
        }
        self.skip = 0;

        let len = data.len();
        let context = self.context();

        loop {
            if x + context == len {
                return Ok(());
            }

            let mut matched_run: u32 = 0;

            if let Some(hint) = self.next_match {
                if self.seq_matches > 1 {
                    if let Some((id, run)) = self.check_chain(hint, data, x, sigs, true)? {
                        matched_run = self.commit_run(id, run, data, x, sigs, store, ranges)?;
                    } else {
                        self.next_match = None;
                    }
                }
            }

            if matched_run == 0 {
                let hash = sigs.calc_hash(self.r0, self.r1);
                if sigs.bithash_bit_set(hash) {
                    if let Some(head) = sigs.chain_head(hash) {
                        if let Some((id, run)) = self.check_chain(head, data, x, sigs, false)? {
                            matched_run = self.commit_run(id, run, data, x, sigs, store, ranges)?;
                        }
                    }
                }
            }

            if matched_run > 0 {
                self.blocks_matched += matched_run as u64;
                x += bs * matched_run as usize;

                if x + context > len {
                    self.skip = x + context - len;
                    return Ok(());
                }

                if self.seq_matches > 1 && matched_run == 1 {
                    self.r0 = self.r1;
                } else {
                    self.r0 = rsum_block(&data[x..x + bs]);
                }
                if self.seq_matches > 1 {
                    self.r1 = rsum_block(&data[x + bs..x + 2 * bs]);
                }
                continue;
            }

            let oc = data[x];
            let nc = data[x + bs];
            self.r0 = rsum_roll(self.r0, oc, nc, self.blockshift());
            if self.seq_matches > 1 {
                let big_nc = data[x + bs * 2];
                self.r1 = rsum_roll(self.r1, nc, big_nc, self.blockshift());
            }
            x += 1;
        }
    }

    fn blockshift(&self) -> u32 {
        self.blocksize.trailing_zeros()
    }

    /// Walks a hash chain starting at `head`, testing weak then strong
    /// checksums. `onlyone` restricts the walk to a single candidate (the
    /// `next_match` fast path). Returns the matched run's starting block id
    /// and how many consecutive blocks (1 or `seq_matches`) passed the
    /// strong checksum, without writing anything yet — the caller decides
    /// how much of the run is still new territory.
    fn check_chain(
        &mut self,
        head: BlockId,
        data: &[u8],
        x: usize,
        sigs: &mut SignatureTable,
        onlyone: bool,
    ) -> Result<Option<(BlockId, u32)>> {
        let bs = self.blocksize as usize;
        let mut cur = Some(head);
        let mask = sigs.rsum_a_mask();

        while let Some(id) = cur {
            let next_cur = if onlyone {
                None
            } else {
                sigs.chain_next(id)
            };
            cur = next_cur;

            let entry_rsum = sigs.entry(id).rsum;
            if entry_rsum.a != (self.r0.a & mask) || entry_rsum.b != self.r0.b {
                continue;
            }

            if !onlyone && self.seq_matches > 1 {
                let next_rsum = sigs.entry(id + 1).rsum;
                if next_rsum.a != (self.r1.a & mask) || next_rsum.b != self.r1.b {
                    continue;
                }
            }

            let check_count: u32 = if onlyone { 1 } else { self.seq_matches as u32 };
            let mut ok = true;
            for k in 0..check_count {
                let block = &data[x + bs * k as usize..x + bs * (k as usize + 1)];
                let digest = strong_checksum(block, bs);
                let declared = &sigs.entry(id + k).checksum[..sigs.checksum_bytes()];
                if &digest[..sigs.checksum_bytes()] != declared {
                    ok = false;
                    break;
                }
            }

            if ok {
                return Ok(Some((id, check_count)));
            }
        }
        Ok(None)
    }

    /// Writing rule on a hit at block `id` with a confirmed run of `run`
    /// blocks: cap the write at the first already-known block so we never
    /// re-verify or re-write territory another source already filled in,
    /// then report how many blocks the caller should actually advance by.
    /// `next_match` is only carried forward when the full run was fresh;
    /// otherwise the next sweep falls back to a full hash probe.
    fn commit_run(
        &mut self,
        id: BlockId,
        run: u32,
        data: &[u8],
        x: usize,
        sigs: &mut SignatureTable,
        store: &mut ScratchStore,
        ranges: &mut RangeMap,
    ) -> Result<u32> {
        let bs = self.blocksize as usize;
        let available = ranges.next_known_after(id).saturating_sub(id);
        let num = run.min(available.max(1));

        let last_id = id + num - 1;
        let total_len = bs * num as usize;
        store.write_blocks(&data[x..x + total_len], id, last_id, sigs, ranges)?;

        self.next_match = if num == run { Some(id + num) } else { None };
        Ok(num)
    }
}
