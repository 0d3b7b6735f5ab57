//! Event logging.
//!
//! Kept as a small hand-rolled `Logger` trait rather than pulling in
//! `log`/`tracing`, matching this repo's prior style, but widened from
//! file-copy events to the transfer's own event set.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn connecting(&self, _host: &str, _port: u16) {}
    fn range_request(&self, _n_ranges: usize, _bytes: u64) {}
    fn block_matched(&self, _id: u32) {}
    fn block_received(&self, _id: u32) {}
    fn checksum_mismatch(&self, _id: u32) {}
    fn redirect(&self, _from: &str, _to: &str) {}
    fn done(&self, _bytes_local: u64, _bytes_downloaded: u64, _seconds: f64) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn connecting(&self, host: &str, port: u16) {
        self.line(&format!("CONNECTING host={host} port={port}"));
    }
    fn range_request(&self, n_ranges: usize, bytes: u64) {
        self.line(&format!("RANGE_REQUEST ranges={n_ranges} bytes={bytes}"));
    }
    fn block_matched(&self, id: u32) {
        self.line(&format!("BLOCK_MATCHED id={id}"));
    }
    fn block_received(&self, id: u32) {
        self.line(&format!("BLOCK_RECEIVED id={id}"));
    }
    fn checksum_mismatch(&self, id: u32) {
        self.line(&format!("CHECKSUM_MISMATCH id={id}"));
    }
    fn redirect(&self, from: &str, to: &str) {
        self.line(&format!("REDIRECT from={from} to={to}"));
    }
    fn done(&self, bytes_local: u64, bytes_downloaded: u64, seconds: f64) {
        self.line(&format!(
            "DONE bytes_local={bytes_local} bytes_downloaded={bytes_downloaded} seconds={seconds:.3}"
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}

/// One JSON object per line, for callers that want to pipe progress into
/// another tool rather than read prose.
pub struct JsonLogger {
    file: Mutex<File>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Connecting { host: &'a str, port: u16 },
    RangeRequest { n_ranges: usize, bytes: u64 },
    BlockMatched { id: u32 },
    BlockReceived { id: u32 },
    ChecksumMismatch { id: u32 },
    Redirect { from: &'a str, to: &'a str },
    Done { bytes_local: u64, bytes_downloaded: u64, seconds: f64 },
    Error { context: &'a str, msg: &'a str },
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn emit(&self, event: &Event) {
        #[derive(Serialize)]
        struct Line<'a> {
            at: String,
            #[serde(flatten)]
            event: &'a Event<'a>,
        }
        let Ok(line) = serde_json::to_string(&Line { at: Utc::now().to_rfc3339(), event }) else {
            return;
        };
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl Logger for JsonLogger {
    fn connecting(&self, host: &str, port: u16) {
        self.emit(&Event::Connecting { host, port });
    }
    fn range_request(&self, n_ranges: usize, bytes: u64) {
        self.emit(&Event::RangeRequest { n_ranges, bytes });
    }
    fn block_matched(&self, id: u32) {
        self.emit(&Event::BlockMatched { id });
    }
    fn block_received(&self, id: u32) {
        self.emit(&Event::BlockReceived { id });
    }
    fn checksum_mismatch(&self, id: u32) {
        self.emit(&Event::ChecksumMismatch { id });
    }
    fn redirect(&self, from: &str, to: &str) {
        self.emit(&Event::Redirect { from, to });
    }
    fn done(&self, bytes_local: u64, bytes_downloaded: u64, seconds: f64) {
        self.emit(&Event::Done { bytes_local, bytes_downloaded, seconds });
    }
    fn error(&self, context: &str, msg: &str) {
        self.emit(&Event::Error { context, msg });
    }
}

/// Terse stderr progress, one character per notable event — the spirit
/// of the original CLI's dot/asterisk progress indicator, without a
/// redrawn progress bar (out of scope; see Non-goals).
pub struct StderrLogger;

impl Logger for StderrLogger {
    fn connecting(&self, host: &str, port: u16) {
        eprintln!("connecting to {host}:{port}");
    }
    fn block_matched(&self, _id: u32) {
        eprint!(".");
    }
    fn block_received(&self, _id: u32) {
        eprint!("*");
    }
    fn checksum_mismatch(&self, id: u32) {
        eprintln!("\nchecksum mismatch on block {id}, discarding");
    }
    fn redirect(&self, from: &str, to: &str) {
        eprintln!("redirected: {from} -> {to}");
    }
    fn done(&self, bytes_local: u64, bytes_downloaded: u64, seconds: f64) {
        eprintln!(
            "\nused {bytes_local} local bytes, fetched {bytes_downloaded} bytes in {seconds:.1}s"
        );
    }
    fn error(&self, context: &str, msg: &str) {
        eprintln!("{context}: {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_logger_writes_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let logger = JsonLogger::new(&path).unwrap();
        logger.block_matched(3);
        logger.done(100, 50, 1.5);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "block_matched");
        assert_eq!(first["id"], 3);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "done");
        assert_eq!(second["bytes_downloaded"], 50);
    }
}
