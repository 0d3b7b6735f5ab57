//! Block signature table and hash index.
//!
//! Owns the per-block `(rsum, strong checksum)` pairs, plus the `rsum_hash`
//! chain table and `bithash` Bloom filter built over them. Grounded on
//! `examples/original_source/librcksum/hash.c` (`build_hash`,
//! `remove_block_from_hash`) and `c/librcksum/rsum.c`
//! (`rcksum_add_target_block`'s masking), reworked from intrusive
//! linked-list pointers into an arena plus `next` indices, avoiding a
//! per-entry allocation for every chain link.

use crate::checksum::{Rsum, CHECKSUM_SIZE};

/// Bits of extra hash width the bithash gets over `rsum_hash`.
const BITHASHBITS: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct Signature {
    pub rsum: Rsum,
    pub checksum: [u8; CHECKSUM_SIZE],
    /// Index of the next entry on this rsum_hash chain, or `None`.
    next: Option<u32>,
}

pub struct SignatureTable {
    /// One entry per block id, plus `seq_matches` trailing sentinels so
    /// lookahead at `entries[id+1]` never needs a bounds check.
    entries: Vec<Signature>,
    blocks: u32,
    seq_matches: u8,
    checksum_bytes: usize,
    rsum_bytes: u8,
    rsum_a_mask: u16,

    rsum_hash: Vec<Option<u32>>,
    hashmask: u32,
    bithash: Vec<u8>,
    bithashmask: u32,
    hash_func_shift: u32,
    built: bool,
}

impl SignatureTable {
    pub fn new(blocks: u32, seq_matches: u8, rsum_bytes: u8, checksum_bytes: usize) -> Self {
        let rsum_a_mask: u16 = match rsum_bytes {
            0..=2 => 0,
            3 => 0xff,
            _ => 0xffff,
        };
        Self {
            entries: vec![Signature::default(); (blocks + seq_matches as u32) as usize],
            blocks,
            seq_matches,
            checksum_bytes,
            rsum_bytes,
            rsum_a_mask,
            rsum_hash: Vec::new(),
            hashmask: 0,
            bithash: Vec::new(),
            bithashmask: 0,
            hash_func_shift: 0,
            built: false,
        }
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn checksum_bytes(&self) -> usize {
        self.checksum_bytes
    }

    pub fn rsum_a_mask(&self) -> u16 {
        self.rsum_a_mask
    }

    pub fn seq_matches(&self) -> u8 {
        self.seq_matches
    }

    pub fn entry(&self, id: u32) -> &Signature {
        &self.entries[id as usize]
    }

    /// `add_target_block`: store the signature for `id`, masking `rsum.a`.
    /// Invalidates any previously-built hash index. Out-of-range ids are
    /// ignored, matching the original's silent bounds check.
    pub fn add_target_block(&mut self, id: u32, mut rsum: Rsum, checksum: &[u8]) {
        if id >= self.blocks {
            return;
        }
        rsum.a &= self.rsum_a_mask;
        let e = &mut self.entries[id as usize];
        e.rsum = rsum;
        let n = checksum.len().min(CHECKSUM_SIZE);
        e.checksum[..n].copy_from_slice(&checksum[..n]);
        self.built = false;
        self.rsum_hash.clear();
        self.bithash.clear();
    }

    /// Combine `r[0].b` with either `r[1].b` (seq_matches>1) or
    /// `r[0].a & mask`, shifted into the high bits.
    pub fn calc_hash(&self, r0: Rsum, r1: Rsum) -> u32 {
        let second = if self.seq_matches > 1 {
            r1.b as u32
        } else {
            (r0.a & self.rsum_a_mask) as u32
        };
        (r0.b as u32) ^ (second << self.hash_func_shift)
    }

    fn calc_rhash(&self, e: &Signature, next: &Signature) -> u32 {
        let second = if self.seq_matches > 1 {
            next.rsum.b as u32
        } else {
            (e.rsum.a & self.rsum_a_mask) as u32
        };
        (e.rsum.b as u32) ^ (second << self.hash_func_shift)
    }

    pub fn hashmask(&self) -> u32 {
        self.hashmask
    }

    pub fn bithash_bit_set(&self, hash: u32) -> bool {
        let byte = (hash & self.bithashmask) >> 3;
        (self.bithash[byte as usize] & (1 << (hash & 7))) != 0
    }

    pub fn chain_head(&self, hash: u32) -> Option<u32> {
        self.rsum_hash[(hash & self.hashmask) as usize]
    }

    pub fn chain_next(&self, idx: u32) -> Option<u32> {
        self.entries[idx as usize].next
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// `build_hash`: idempotent, picks `hash_bits`/`hash_func_shift`,
    /// allocates and fills `rsum_hash` and `bithash`. Entries are prepended
    /// in reverse-id order so chains end up in ascending-id order, which
    /// keeps later sparse-file writes monotone on disk.
    pub fn build_hash(&mut self) {
        if self.built {
            return;
        }
        let rsum_bits = self.rsum_bytes as u32 * 8;
        let avail_bits = if self.seq_matches > 1 {
            rsum_bits.min(16) * 2
        } else {
            rsum_bits
        };

        let mut hash_bits = avail_bits;
        while (1u64 << (hash_bits - 1)) > self.blocks as u64 && hash_bits > 5 {
            hash_bits -= 1;
        }
        self.hashmask = (1u32 << hash_bits) - 1;
        self.rsum_hash = vec![None; (self.hashmask + 1) as usize];

        let bh_bits = (hash_bits + BITHASHBITS).min(avail_bits);
        self.bithashmask = (1u32 << bh_bits) - 1;
        self.bithash = vec![0u8; ((self.bithashmask + 1) / 8).max(1) as usize];

        self.hash_func_shift = if self.seq_matches > 1 && avail_bits < 24 {
            (hash_bits as i32 - avail_bits as i32 / 2).max(0) as u32
        } else {
            (hash_bits as i32 - (avail_bits as i32 - 16)).max(0) as u32
        };

        for id in (0..self.blocks).rev() {
            let h = {
                let e = &self.entries[id as usize];
                let next = &self.entries[id as usize + 1];
                self.calc_rhash(e, next)
            };
            let head = self.rsum_hash[(h & self.hashmask) as usize];
            self.entries[id as usize].next = head;
            self.rsum_hash[(h & self.hashmask) as usize] = Some(id);
            let byte = (h & self.bithashmask) >> 3;
            self.bithash[byte as usize] |= 1 << (h & 7);
        }
        self.built = true;
    }

    /// `remove_block_from_hash`: unlink `id` from its chain. Bithash bits
    /// are left set (harmless false positives), matching the original.
    pub fn remove_block_from_hash(&mut self, id: u32) {
        if !self.built {
            return;
        }
        let h = {
            let e = &self.entries[id as usize];
            let next = &self.entries[id as usize + 1];
            self.calc_rhash(e, next)
        };
        let slot = (h & self.hashmask) as usize;
        let mut cur = self.rsum_hash[slot];
        let mut prev: Option<u32> = None;
        while let Some(cidx) = cur {
            if cidx == id {
                let nxt = self.entries[cidx as usize].next;
                match prev {
                    None => self.rsum_hash[slot] = nxt,
                    Some(p) => self.entries[p as usize].next = nxt,
                }
                return;
            }
            prev = cur;
            cur = self.entries[cidx as usize].next;
        }
    }
}
