//! Control-file (`.zsync`) parser: the `Name: value` header block followed
//! by optional zmap entries and the packed per-block signature table.
//!
//! Grounded on `examples/original_source/c/libzsync/zsync.c`
//! (`zsync_begin`), reworked from a `calloc`'d struct filled by a
//! hand-rolled `fgets`/`strchr` scanner into a `BufRead`-driven loop
//! returning `Result`.

use anyhow::{Context, Result};
use std::io::BufRead;

use crate::error::ZsyncError;
use crate::sigtable::SignatureTable;
use crate::zmap::Zmap;

/// Our own consumer version, compared lexicographically against a control
/// file's `Min-Version` header.
const CLIENT_VERSION: &str = "1.0.0";

const GZB_NOTBLOCKSTART: u16 = 0x8000;

#[derive(Debug, Clone)]
pub struct RecompressHint {
    pub gzip_header: Vec<u8>,
    pub gzip_options: String,
}

pub struct ControlFile {
    pub filelen: u64,
    pub blocksize: u64,
    pub blocks: u32,
    pub filename: Option<String>,
    pub zfilename: Option<String>,
    pub mtime: Option<chrono::DateTime<chrono::FixedOffset>>,
    pub urls: Vec<String>,
    pub zurls: Vec<String>,
    pub sha1: Option<String>,
    pub recompress: Option<RecompressHint>,
    pub zmap: Option<Zmap>,
    pub signatures: SignatureTable,
}

impl ControlFile {
    /// Parses the header block, then the zmap (if `Z-Map2` was declared),
    /// then `blocks` packed `(rsum, checksum)` signature entries, in that
    /// wire order. Fails fast on any malformed or unrecognised-and-unsafe
    /// header line, before any of that raw binary data is trusted.
    pub fn parse<R: BufRead>(mut r: R) -> Result<Self> {
        let mut filelen: u64 = 0;
        let mut blocksize: u64 = 0;
        let mut seq_matches: u8 = 1;
        let mut rsum_bytes: u8 = 4;
        let mut checksum_bytes: usize = 16;
        let mut filename = None;
        let mut zfilename = None;
        let mut mtime = None;
        let mut urls = Vec::new();
        let mut zurls = Vec::new();
        let mut sha1 = None;
        let mut recompress = None;
        let mut safe_keys: Vec<String> = Vec::new();
        let mut zmap_deltas: Option<Vec<(u16, u16)>> = None;
        let mut blocks: u32 = 0;

        loop {
            let mut line = String::new();
            let n = r.read_line(&mut line).context("reading control file header")?;
            if n == 0 {
                return Err(format_err("control file ended before the header's blank line"));
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                break;
            }

            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| format_err(format!("not a zsync control line: \"{line}\"")))?;

            match key {
                "zsync" => {
                    if value == "0.0.4" {
                        return Err(format_err(
                            "control file was produced by zsync 0.0.4, which this client does not support",
                        ));
                    }
                }
                "Min-Version" => {
                    if value > CLIENT_VERSION {
                        return Err(format_err(format!(
                            "control file requires zsync {value} or newer, this client is {CLIENT_VERSION}"
                        )));
                    }
                }
                "Length" => {
                    filelen = value
                        .parse()
                        .map_err(|_| format_err(format!("bad Length value '{value}'")))?;
                }
                "Filename" => {
                    if value.contains('/') || value.contains('\\') {
                        return Err(format_err("Filename contains a path separator"));
                    }
                    filename = Some(value.to_string());
                }
                "Z-Filename" => zfilename = Some(value.to_string()),
                "MTime" => {
                    mtime = chrono::DateTime::parse_from_rfc2822(value).ok();
                }
                "URL" => urls.push(value.to_string()),
                "Z-URL" => zurls.push(value.to_string()),
                "Blocksize" => {
                    blocksize = value
                        .parse()
                        .map_err(|_| format_err(format!("bad Blocksize value '{value}'")))?;
                    if blocksize == 0 || (blocksize & (blocksize - 1)) != 0 {
                        return Err(format_err(format!("Blocksize {blocksize} is not a power of two")));
                    }
                }
                "Hash-Lengths" => {
                    let parts: Vec<&str> = value.split(',').collect();
                    if parts.len() != 3 {
                        return Err(format_err(format!("bad Hash-Lengths value '{value}'")));
                    }
                    seq_matches = parts[0]
                        .parse()
                        .map_err(|_| format_err("bad seq_matches in Hash-Lengths"))?;
                    rsum_bytes = parts[1]
                        .parse()
                        .map_err(|_| format_err("bad rsum_bytes in Hash-Lengths"))?;
                    checksum_bytes = parts[2]
                        .parse()
                        .map_err(|_| format_err("bad checksum_bytes in Hash-Lengths"))?;
                    if !(1..=4).contains(&rsum_bytes)
                        || !(3..=16).contains(&checksum_bytes)
                        || !(1..=2).contains(&seq_matches)
                    {
                        return Err(format_err(format!("nonsensical Hash-Lengths '{value}'")));
                    }
                }
                "Z-Map2" if blocks > 0 => {
                    let nzblocks: usize = value
                        .parse()
                        .map_err(|_| format_err(format!("bad Z-Map2 count '{value}'")))?;
                    let mut deltas = Vec::with_capacity(nzblocks);
                    for _ in 0..nzblocks {
                        let mut buf = [0u8; 4];
                        r.read_exact(&mut buf)
                            .context("premature EOF reading Z-Map2 entries")?;
                        let inbits = u16::from_be_bytes([buf[0], buf[1]]);
                        let outbytes = u16::from_be_bytes([buf[2], buf[3]]);
                        deltas.push((inbits, outbytes));
                    }
                    zmap_deltas = Some(deltas);
                }
                "SHA-1" => {
                    if value.len() != 40 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(format_err("SHA-1 digest is the wrong length or not hex"));
                    }
                    sha1 = Some(value.to_lowercase());
                }
                "Safe" => {
                    safe_keys = value.split_whitespace().map(str::to_string).collect();
                }
                "Recompress" => {
                    recompress = parse_recompress(value);
                }
                _ if safe_keys.iter().any(|k| k == key) => {
                    // Declared safe to ignore by the producer.
                }
                _ => {
                    return Err(format_err(format!(
                        "unrecognised tag '{key}' - needs a newer client"
                    )));
                }
            }

            if filelen > 0 && blocksize > 0 {
                blocks = ((filelen + blocksize - 1) / blocksize) as u32;
            }
        }

        if filelen == 0 || blocksize == 0 {
            return Err(format_err("control file is missing Blocksize and/or Length"));
        }

        let zmap = zmap_deltas.map(|d| Zmap::build(&d));

        let mut signatures = SignatureTable::new(blocks, seq_matches, rsum_bytes, checksum_bytes);
        for id in 0..blocks {
            let mut rsum_buf = [0u8; 4];
            r.read_exact(&mut rsum_buf[4 - rsum_bytes as usize..])
                .context("short read on control file signature table")?;
            let rsum = crate::checksum::Rsum {
                a: u16::from_be_bytes([rsum_buf[0], rsum_buf[1]]),
                b: u16::from_be_bytes([rsum_buf[2], rsum_buf[3]]),
            };
            let mut checksum = vec![0u8; checksum_bytes];
            r.read_exact(&mut checksum)
                .context("short read on control file signature table")?;
            signatures.add_target_block(id, rsum, &checksum);
        }

        Ok(Self {
            filelen,
            blocksize,
            blocks,
            filename,
            zfilename,
            mtime,
            urls,
            zurls,
            sha1,
            recompress,
            zmap,
            signatures,
        })
    }

    /// The filename a completed download should use: `Z-Filename` when
    /// recompression is in effect, else `Filename`.
    pub fn target_filename(&self) -> Option<&str> {
        if self.recompress.is_some() {
            self.zfilename.as_deref().or(self.filename.as_deref())
        } else {
            self.filename.as_deref()
        }
    }

    /// Whether the compressed (`Z-URL`/zmap) fetch path should be preferred
    /// over the plain `URL` list.
    pub fn prefer_compressed(&self) -> bool {
        self.zmap.is_some() && !self.zurls.is_empty()
    }
}

fn parse_recompress(value: &str) -> Option<RecompressHint> {
    let (hex, opts) = value.split_once(' ').unwrap_or((value, ""));
    const WHITELIST: [&str; 4] = ["", "--best", "--rsync", "--rsync --best"];
    if !WHITELIST.contains(&opts) {
        return None;
    }
    let header = decode_hex(hex)?;
    Some(RecompressHint {
        gzip_header: header,
        gzip_options: opts.to_string(),
    })
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn format_err(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ZsyncError::Format(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_bytes(urls: &[&str]) -> Vec<u8> {
        let mut s = String::new();
        s.push_str("zsync: 0.6.2\n");
        s.push_str("Filename: test.dat\n");
        s.push_str("Length: 8\n");
        s.push_str("Blocksize: 4\n");
        s.push_str("Hash-Lengths: 1,4,16\n");
        for u in urls {
            s.push_str(&format!("URL: {u}\n"));
        }
        s.push_str("SHA-1: 0000000000000000000000000000000000000000\n");
        s.push('\n');
        let mut bytes = s.into_bytes();
        for _block in 0..2 {
            bytes.extend_from_slice(&[0u8; 4]);
            bytes.extend_from_slice(&[0u8; 16]);
        }
        bytes
    }

    #[test]
    fn parses_minimal_control_file() {
        let data = sample_bytes(&["http://example.com/test.dat"]);
        let cf = ControlFile::parse(Cursor::new(data)).unwrap();
        assert_eq!(cf.filelen, 8);
        assert_eq!(cf.blocksize, 4);
        assert_eq!(cf.blocks, 2);
        assert_eq!(cf.filename.as_deref(), Some("test.dat"));
        assert_eq!(cf.urls, vec!["http://example.com/test.dat"]);
        assert_eq!(cf.sha1.as_deref(), Some("0000000000000000000000000000000000000000"));
    }

    #[test]
    fn rejects_zsync_0_0_4() {
        let data = b"zsync: 0.0.4\nLength: 4\nBlocksize: 4\n\n".to_vec();
        assert!(ControlFile::parse(Cursor::new(data)).is_err());
    }

    #[test]
    fn rejects_unknown_unsafe_key() {
        let data = b"zsync: 0.6.2\nBogus-Key: x\nLength: 4\nBlocksize: 4\n\n".to_vec();
        assert!(ControlFile::parse(Cursor::new(data)).is_err());
    }

    #[test]
    fn tolerates_unknown_key_declared_safe() {
        let mut s = String::new();
        s.push_str("zsync: 0.6.2\n");
        s.push_str("Safe: Bogus-Key\n");
        s.push_str("Bogus-Key: x\n");
        s.push_str("Filename: test.dat\n");
        s.push_str("Length: 4\n");
        s.push_str("Blocksize: 4\n");
        s.push_str("Hash-Lengths: 1,4,16\n");
        s.push('\n');
        let mut bytes = s.into_bytes();
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&[0u8; 16]);
        let cf = ControlFile::parse(Cursor::new(bytes)).unwrap();
        assert_eq!(cf.blocks, 1);
    }

    #[test]
    fn rejects_non_power_of_two_blocksize() {
        let data = b"zsync: 0.6.2\nLength: 4\nBlocksize: 3\n\n".to_vec();
        assert!(ControlFile::parse(Cursor::new(data)).is_err());
    }
}
