//! Sparse output store: the scratch file blocks are written into as they
//! are matched locally or received from the network.
//!
//! Grounded on `examples/original_source/librcksum/state.c`
//! (`rcksum_init`'s temp-file setup, `rcksum_filename`/`rcksum_filehandle`
//! ownership transfer) and `c/librcksum/range.c`'s callers of positioned
//! writes. Uses `tempfile` for the `rcksum-XXXXXX` scratch file instead of
//! a hand-rolled `mkstemp` wrapper, and `std::os::unix::fs::FileExt` for
//! positioned I/O instead of a `libc::pwrite` binding.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::rangemap::{BlockId, RangeMap};
use crate::sigtable::SignatureTable;

/// Left on disk if dropped without `take_filename`/`take_filehandle` being
/// called — a correctness-sensitive caller must claim the file first if it
/// wants to preserve a `.part` on failure.
pub struct ScratchStore {
    file: Option<File>,
    path: Option<PathBuf>,
    blockshift: u32,
    blocksize: u64,
}

impl ScratchStore {
    /// Creates a fresh `rcksum-XXXXXX`-style temp file in `dir` (the
    /// target's own directory, so the final rename stays on one filesystem).
    pub fn new(dir: &Path, blocksize: u64) -> Result<Self> {
        let named = tempfile::Builder::new()
            .prefix("rcksum-")
            .rand_bytes(6)
            .tempfile_in(dir)
            .context("creating scratch file")?;
        let (file, path) = named.keep().context("persisting scratch file handle")?;
        Ok(Self {
            file: Some(file),
            path: Some(path),
            blockshift: blocksize.trailing_zeros(),
            blocksize,
        })
    }

    /// Adopts an existing file (a `.part` resumed as scratch) as the store.
    pub fn from_existing(path: PathBuf, file: File, blocksize: u64) -> Self {
        Self {
            file: Some(file),
            path: Some(path),
            blockshift: blocksize.trailing_zeros(),
            blocksize,
        }
    }

    /// Writes `(to_id - from_id + 1)` consecutive blocks at their
    /// block-aligned offset, then commits them: unlinks the blocks from the
    /// signature table's hash chains and records them in the range registry.
    /// Write failures are fatal to the whole transfer — the output would be
    /// corrupt otherwise.
    pub fn write_blocks(
        &mut self,
        data: &[u8],
        from_id: BlockId,
        to_id: BlockId,
        sigs: &mut SignatureTable,
        ranges: &mut RangeMap,
    ) -> Result<()> {
        let offset = (from_id as u64) << self.blockshift;
        let file = self.file.as_ref().context("scratch file already taken")?;
        file.write_all_at(data, offset)
            .context("writing matched blocks to scratch file")?;
        for id in from_id..=to_id {
            sigs.remove_block_from_hash(id);
            ranges.add(id);
        }
        Ok(())
    }

    /// Positioned read used to preload the deflate decoder's sliding window
    /// with bytes we already have on disk.
    pub fn read_known_data(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.as_ref().context("scratch file already taken")?;
        let n = read_at_partial(file, buf, offset)?;
        Ok(n)
    }

    pub fn truncate_to(&mut self, length: u64) -> Result<()> {
        let file = self.file.as_ref().context("scratch file already taken")?;
        file.set_len(length).context("truncating scratch file")
    }

    /// Transfers filename ownership out; returns `None` if already taken.
    pub fn take_filename(&mut self) -> Option<PathBuf> {
        self.path.take()
    }

    /// Transfers the file handle out; returns `None` if already taken.
    pub fn take_filehandle(&mut self) -> Option<File> {
        self.file.take()
    }

    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }
}

/// `pread`-like helper: returns how many bytes were actually available,
/// since the caller may ask for a preload window that runs past EOF.
fn read_at_partial(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading scratch file"),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{rsum_block, strong_checksum};
    use std::io::Read as _;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ScratchStore::new(dir.path(), 4).unwrap();
        let mut sigs = SignatureTable::new(2, 1, 4, 16);
        sigs.add_target_block(0, rsum_block(b"aaaa"), &strong_checksum(b"aaaa", 4));
        sigs.add_target_block(1, rsum_block(b"bbbb"), &strong_checksum(b"bbbb", 4));
        sigs.build_hash();
        let mut ranges = RangeMap::new(2);

        store
            .write_blocks(b"aaaa", 0, 0, &mut sigs, &mut ranges)
            .unwrap();
        store
            .write_blocks(b"bbbb", 1, 1, &mut sigs, &mut ranges)
            .unwrap();

        assert!(ranges.contains(0));
        assert!(ranges.contains(1));
        assert_eq!(ranges.blocks_todo(), 0);

        let mut buf = [0u8; 4];
        let n = store.read_known_data(&mut buf, 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"aaaa");

        let path = store.take_filename().unwrap();
        let mut f = File::open(&path).unwrap();
        let mut all = Vec::new();
        f.read_to_end(&mut all).unwrap();
        assert_eq!(&all, b"aaaabbbb");
    }

    #[test]
    fn read_past_eof_returns_short_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ScratchStore::new(dir.path(), 4).unwrap();
        let mut sigs = SignatureTable::new(1, 1, 4, 16);
        sigs.add_target_block(0, rsum_block(b"aaaa"), &strong_checksum(b"aaaa", 4));
        sigs.build_hash();
        let mut ranges = RangeMap::new(1);
        store
            .write_blocks(b"aaaa", 0, 0, &mut sigs, &mut ranges)
            .unwrap();

        let mut buf = [0u8; 16];
        let n = store.read_known_data(&mut buf, 0).unwrap();
        assert_eq!(n, 4);
    }
}
