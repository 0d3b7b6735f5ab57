//! Range registry: the sorted set of block ids already committed to disk.
//!
//! A `RangeMap` holds non-adjacent, non-overlapping inclusive `[lo, hi]`
//! block-id ranges. Grounded on
//! `examples/original_source/c/librcksum/range.c` (`add_to_ranges`,
//! `already_got_block`, `rcksum_needed_block_ranges`,
//! `rcksum_blocks_todo`), reworked as a `Vec<(u32, u32)>` instead of a flat
//! `malloc`'d array with manual `memmove`.

pub type BlockId = u32;

#[derive(Debug, Default, Clone)]
pub struct RangeMap {
    /// Sorted, inclusive, non-adjacent, non-overlapping ranges.
    ranges: Vec<(BlockId, BlockId)>,
    total_blocks: BlockId,
    gotblocks: u32,
}

impl RangeMap {
    pub fn new(total_blocks: BlockId) -> Self {
        Self {
            ranges: Vec::new(),
            total_blocks,
            gotblocks: 0,
        }
    }

    /// Binary search for the range that would contain `x`, or the insertion
    /// point. Returns `Ok(i)` if `x` falls inside `ranges[i]`, `Err(i)`
    /// otherwise (`i` is where a new singleton range would be inserted).
    fn locate(&self, x: BlockId) -> Result<usize, usize> {
        self.ranges.binary_search_by(|&(lo, hi)| {
            if x < lo {
                std::cmp::Ordering::Greater
            } else if x > hi {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }

    /// Record block `x` as committed. No-op if already present.
    pub fn add(&mut self, x: BlockId) {
        let idx = match self.locate(x) {
            Ok(_) => return,
            Err(idx) => idx,
        };

        let merges_left = idx > 0 && self.ranges[idx - 1].1 + 1 == x;
        let merges_right = idx < self.ranges.len() && self.ranges[idx].0 == x + 1;

        self.gotblocks += 1;

        match (merges_left, merges_right) {
            (true, true) => {
                let right_hi = self.ranges[idx].1;
                self.ranges[idx - 1].1 = right_hi;
                self.ranges.remove(idx);
            }
            (true, false) => {
                self.ranges[idx - 1].1 = x;
            }
            (false, true) => {
                self.ranges[idx].0 = x;
            }
            (false, false) => {
                self.ranges.insert(idx, (x, x));
            }
        }
    }

    pub fn contains(&self, x: BlockId) -> bool {
        self.locate(x).is_ok()
    }

    /// First block id >= `id` already known, or `self.total_blocks` if none.
    /// Used by the matcher to skip re-writing blocks in a run we already have.
    pub fn next_known_after(&self, id: BlockId) -> BlockId {
        match self.locate(id) {
            Ok(_) => id,
            Err(idx) => {
                if idx < self.ranges.len() {
                    self.ranges[idx].0
                } else {
                    self.total_blocks
                }
            }
        }
    }

    /// Missing ids in `[from, to]`, returned as half-open `[lo, hi)` ranges.
    pub fn needed_ranges(&self, from: BlockId, to: BlockId) -> Vec<(BlockId, BlockId)> {
        if from > to {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut cursor = from;
        for &(lo, hi) in &self.ranges {
            if hi < cursor {
                continue;
            }
            if lo > to {
                break;
            }
            if lo > cursor {
                out.push((cursor, lo));
            }
            cursor = cursor.max(hi + 1);
            if cursor > to {
                break;
            }
        }
        if cursor <= to {
            out.push((cursor, to + 1));
        }
        out
    }

    pub fn blocks_todo(&self) -> u32 {
        self.total_blocks - self.gotblocks
    }

    pub fn gotblocks(&self) -> u32 {
        self.gotblocks
    }
}
