//! Top-level zsync state: the "core" that owns everything the matcher and
//! receiver mutate, per the ownership design in §9 of the design notes —
//! "keep a single core value that owns (signatures, bithash, rsum_hash,
//! range registry, scratch-file handle); matcher and receiver borrow the
//! core mutably for the duration of a call."

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};

use crate::controlfile::{ControlFile, RecompressHint};
use crate::error::ZsyncError;
use crate::matcher::Matcher;
use crate::rangemap::RangeMap;
use crate::scratch::ScratchStore;
use crate::sigtable::SignatureTable;
use crate::zmap::Zmap;

pub struct ZsyncState {
    pub filelen: u64,
    pub blocksize: u64,
    pub blocks: u32,
    /// Live pool of plain-content URLs; entries are evicted here on a
    /// transport error, never restored.
    pub urls: Vec<String>,
    /// Live pool of gzipped-content URLs, paired with `zmap`.
    pub zurls: Vec<String>,
    pub sha1: Option<String>,
    pub zmap: Option<Zmap>,
    pub recompress: Option<RecompressHint>,
    pub filename: Option<String>,
    pub mtime: Option<DateTime<FixedOffset>>,

    signatures: SignatureTable,
    ranges: RangeMap,
    store: ScratchStore,
    matcher: Matcher,
}

impl ZsyncState {
    /// Builds state from a freshly parsed control file, with a new scratch
    /// file created in `workdir` (the target's own directory, so the final
    /// rename stays on one filesystem).
    pub fn new(cf: ControlFile, workdir: &Path) -> Result<Self> {
        let store = ScratchStore::new(workdir, cf.blocksize)
            .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(e.to_string())))?;
        let seq_matches = cf.signatures.seq_matches();
        Ok(Self {
            filelen: cf.filelen,
            blocksize: cf.blocksize,
            blocks: cf.blocks,
            urls: cf.urls,
            zurls: cf.zurls,
            sha1: cf.sha1,
            zmap: cf.zmap,
            recompress: cf.recompress,
            filename: cf.filename,
            mtime: cf.mtime,
            ranges: RangeMap::new(cf.blocks),
            matcher: Matcher::new(seq_matches, cf.blocksize),
            signatures: cf.signatures,
        })
    }

    /// Whether the compressed (`Z-URL`/zmap) fetch path should be used
    /// instead of the plain `URL` list.
    pub fn prefer_compressed(&self) -> bool {
        self.zmap.is_some() && !self.zurls.is_empty()
    }

    pub fn blocks_todo(&self) -> u32 {
        self.ranges.blocks_todo()
    }

    pub fn blocks_matched_locally(&self) -> u64 {
        self.matcher.blocks_matched
    }

    /// Disjoint mutable access to the three pieces the matcher and receiver
    /// need, without forcing every caller through `&mut self` methods that
    /// would otherwise alias against each other.
    pub fn core_mut(&mut self) -> (&mut SignatureTable, &mut ScratchStore, &mut RangeMap) {
        (&mut self.signatures, &mut self.store, &mut self.ranges)
    }

    /// Feeds an entire local file through the matching engine, in
    /// overlapping chunks per the buffer contract: each read reuses the
    /// trailing `context` bytes of the previous chunk as its own leading
    /// bytes, and the final (short or empty) read is zero-padded by
    /// `context` bytes to signal end-of-stream.
    pub fn feed_seed_file(&mut self, path: &Path) -> Result<()> {
        let bs = self.blocksize as usize;
        let context = bs * self.signatures.seq_matches() as usize;
        let chunk = (bs * 256).max(context * 4);

        let mut file = File::open(path)
            .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(format!("opening seed file {}: {e}", path.display()))))?;

        let mut buf = vec![0u8; context + chunk];
        let mut tail_len = 0usize;
        let mut call_index: u64 = 0;

        loop {
            let n = file
                .read(&mut buf[tail_len..])
                .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(format!("reading seed file: {e}"))))?;
            let total = tail_len + n;

            if n == 0 {
                if total > 0 {
                    buf.truncate(total);
                    buf.resize(total + context, 0);
                    self.matcher
                        .submit_source_data(&buf, call_index, &mut self.signatures, &mut self.store, &mut self.ranges)?;
                }
                return Ok(());
            }

            // Not yet a full window's worth of data to submit (possible on
            // a file smaller than `context`, or an early short read on a
            // pipe-like source); keep reading rather than handing the
            // matcher a chunk shorter than its lookahead window.
            if total < context {
                tail_len = total;
                continue;
            }

            self.matcher
                .submit_source_data(&buf[..total], call_index, &mut self.signatures, &mut self.store, &mut self.ranges)?;
            call_index += 1;

            if total >= context {
                buf.copy_within(total - context..total, 0);
                tail_len = context;
            } else {
                tail_len = total;
            }
        }
    }

    /// Missing target-byte ranges, as inclusive `(from, to)` pairs suitable
    /// for an HTTP `Range:` header, clamped to the declared file length.
    pub fn needed_byte_ranges(&self) -> Vec<(u64, u64)> {
        if self.blocks == 0 {
            return Vec::new();
        }
        self.ranges
            .needed_ranges(0, self.blocks - 1)
            .into_iter()
            .map(|(lo, hi)| {
                let from = lo as u64 * self.blocksize;
                let to = ((hi as u64) * self.blocksize).min(self.filelen) - 1;
                (from, to)
            })
            .collect()
    }

    /// Verifies the scratch file's whole-file SHA-1 against the control
    /// file's declared digest, truncating to the declared length first.
    /// No-op if the control file declared none.
    pub fn verify_sha1(&mut self) -> Result<()> {
        let Some(expected) = self.sha1.clone() else {
            return Ok(());
        };
        self.store
            .truncate_to(self.filelen)
            .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(e.to_string())))?;

        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        let mut remaining = self.filelen;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = self
                .store
                .read_known_data(&mut buf[..want], offset)
                .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(e.to_string())))?;
            if n == 0 {
                return Err(anyhow::Error::new(ZsyncError::LocalFile(
                    "scratch file is shorter than the declared Length".into(),
                )));
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }

        let actual = hex_lower(&hasher.finalize());
        if actual != expected.to_lowercase() {
            return Err(anyhow::Error::new(ZsyncError::Sha1Mismatch { expected, actual }));
        }
        Ok(())
    }

    /// Releases ownership of the scratch file's path and handle for the
    /// caller to rename into place.
    pub fn finish(mut self) -> Result<(PathBuf, Option<File>)> {
        let path = self
            .store
            .take_filename()
            .context("scratch file already taken")?;
        let file = self.store.take_filehandle();
        Ok((path, file))
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{rsum_block, strong_checksum};
    use std::io::Write as _;

    fn sample_control_file(blocks: &[&[u8]], sha1: &str) -> ControlFile {
        let mut sigs = SignatureTable::new(blocks.len() as u32, 1, 4, 16);
        for (i, b) in blocks.iter().enumerate() {
            sigs.add_target_block(i as u32, rsum_block(b), &strong_checksum(b, 4));
        }
        sigs.build_hash();
        ControlFile {
            filelen: (blocks.len() * 4) as u64,
            blocksize: 4,
            blocks: blocks.len() as u32,
            filename: Some("out.dat".into()),
            zfilename: None,
            mtime: None,
            urls: vec!["http://example.com/out.dat".into()],
            zurls: Vec::new(),
            sha1: Some(sha1.to_string()),
            recompress: None,
            zmap: None,
            signatures: sigs,
        }
    }

    #[test]
    fn feeding_the_identical_file_leaves_nothing_needed() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"aaaabbbbcccc".to_vec();
        let seed_path = dir.path().join("seed.dat");
        File::create(&seed_path).unwrap().write_all(&data).unwrap();

        let cf = sample_control_file(&[b"aaaa", b"bbbb", b"cccc"], "0000000000000000000000000000000000000000");
        let mut state = ZsyncState::new(cf, dir.path()).unwrap();
        state.feed_seed_file(&seed_path).unwrap();

        assert_eq!(state.blocks_todo(), 0);
        assert!(state.needed_byte_ranges().is_empty());
        assert_eq!(state.blocks_matched_locally(), 3);
    }

    #[test]
    fn seed_file_smaller_than_a_block_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let seed_path = dir.path().join("tiny.dat");
        File::create(&seed_path).unwrap().write_all(b"ab").unwrap();

        let cf = sample_control_file(&[b"aaaa", b"bbbb"], "0000000000000000000000000000000000000000");
        let mut state = ZsyncState::new(cf, dir.path()).unwrap();
        state.feed_seed_file(&seed_path).unwrap();

        assert_eq!(state.blocks_matched_locally(), 0);
        assert_eq!(state.blocks_todo(), 2);
    }

    #[test]
    fn verify_sha1_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let cf = sample_control_file(&[b"aaaa"], "ffffffffffffffffffffffffffffffffffffffff");
        let mut state = ZsyncState::new(cf, dir.path()).unwrap();
        let (sigs, store, ranges) = state.core_mut();
        store.write_blocks(b"aaaa", 0, 0, sigs, ranges).unwrap();

        let err = state.verify_sha1().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZsyncError>(),
            Some(ZsyncError::Sha1Mismatch { .. })
        ));
    }
}
