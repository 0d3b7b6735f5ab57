//! zsync driver: parse control file → feed seed files → fetch remaining
//! ranges → verify → rename. Single-threaded, blocking I/O throughout.

use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;

use zsync::cli::Opts;
use zsync::controlfetch::fetch_control_file;
use zsync::controlfile::ControlFile;
use zsync::error::{exit_code_for, ZsyncError};
use zsync::httpfetch::{FetchConfig, RangeFetch};
use zsync::logger::{Logger, NoopLogger, StderrLogger};
use zsync::receiver::{CompressedReceiver, PlainReceiver};
use zsync::state::ZsyncState;
use zsync::url::HttpUrl;

fn main() -> ExitCode {
    let opts = Opts::parse();
    let logger: Box<dyn Logger> = if opts.is_quiet() {
        Box::new(NoopLogger)
    } else {
        Box::new(StderrLogger)
    };

    match run(&opts, logger.as_ref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logger.error("zsync", &format!("{e:#}"));
            ExitCode::from(exit_code_for(&e) as u8)
        }
    }
}

fn run(opts: &Opts, logger: &dyn Logger) -> Result<()> {
    let started = Instant::now();
    let user_agent = format!("zsync/{}", env!("CARGO_PKG_VERSION"));

    let body = if opts.target.starts_with("http://") {
        fetch_control_file(&opts.target, &user_agent, None, None)?.body
    } else {
        std::fs::read(&opts.target)
            .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(format!("reading {}: {e}", opts.target))))?
    };

    if let Some(save_to) = &opts.save_zsync {
        std::fs::write(save_to, &body)
            .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(format!("writing -k file: {e}"))))?;
    }

    let cf = ControlFile::parse(BufReader::new(Cursor::new(body)))?;

    let target_name = opts
        .output
        .clone()
        .or_else(|| cf.filename.clone().map(PathBuf::from))
        .context("no output filename: pass -o or ensure the control file declares Filename:")?;
    let workdir = target_name
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let part_path = with_suffix(&target_name, ".part");

    let mut state = ZsyncState::new(cf, &workdir)?;

    if part_path.exists() {
        state.feed_seed_file(&part_path)?;
    }
    for seed in &opts.seed {
        state.feed_seed_file(seed)?;
    }
    let bytes_local = state.blocks_matched_locally() * state.blocksize;

    let downloaded = if state.prefer_compressed() {
        fetch_compressed(&mut state, opts, &user_agent, logger)?
    } else {
        fetch_plain(&mut state, opts, &user_agent, logger)?
    };

    state.verify_sha1()?;

    let mtime = state.mtime;
    let (scratch_path, scratch_file) = state.finish()?;
    drop(scratch_file);

    if target_name.exists() {
        let backup = with_suffix(&target_name, ".zs-old");
        let _ = std::fs::remove_file(&backup);
        let _ = std::fs::hard_link(&target_name, &backup);
    }
    std::fs::rename(&scratch_path, &target_name)
        .map_err(|e| anyhow::Error::new(ZsyncError::LocalFile(format!("renaming scratch file into place: {e}"))))?;

    if let Some(mtime) = mtime {
        let ft = filetime::FileTime::from_unix_time(mtime.timestamp(), 0);
        let _ = filetime::set_file_mtime(&target_name, ft);
    }

    logger.done(bytes_local, downloaded, started.elapsed().as_secs_f64());
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn pick_url(pool: &[String]) -> Option<String> {
    if pool.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..pool.len());
    Some(pool[idx].clone())
}

/// The plain, uncompressed fetch path. Recomputes the needed-ranges set
/// after every connection (successful or not), so a transport error that
/// drops mid-transfer simply shrinks the retry request by whatever was
/// already committed.
fn fetch_plain(state: &mut ZsyncState, opts: &Opts, user_agent: &str, logger: &dyn Logger) -> Result<u64> {
    let mut pool = state.urls.clone();
    let mut receiver = PlainReceiver::new(state.blocksize);
    let mut downloaded = 0u64;

    loop {
        let ranges = state.needed_byte_ranges();
        if ranges.is_empty() {
            break;
        }

        let Some(url) = pick_url(&pool) else {
            return Err(anyhow::Error::new(ZsyncError::UrlsExhausted {
                filename: state.filename.clone().unwrap_or_default(),
            }));
        };
        let parsed = HttpUrl::parse(&url).map_err(|e| anyhow::Error::new(ZsyncError::Configuration(e.to_string())))?;
        logger.connecting(&parsed.host, parsed.port);
        let total_bytes: u64 = ranges.iter().map(|&(f, t)| t - f + 1).sum();
        logger.range_request(ranges.len(), total_bytes);

        let config = FetchConfig {
            user_agent: user_agent.to_string(),
            referer: opts.referer.clone(),
            auth: opts.parsed_auth()?,
            proxy: None,
        };
        let mut rf = RangeFetch::new(&parsed, config);
        rf.add_ranges(&ranges);

        // Reset per connection attempt: any fragment left pending from a
        // prior, failed attempt was never committed, and the re-requested
        // range starts at its block boundary again, not at the old
        // fragment's tail.
        receiver = PlainReceiver::new(state.blocksize);

        let mut buf = vec![0u8; 64 * 1024];
        let result: Result<()> = (|| {
            while let Some(block) = rf.get_range_block(&mut buf)? {
                let (sigs, store, reg) = state.core_mut();
                receiver.receive_data(&block.data, block.offset, sigs, store, reg)?;
            }
            Ok(())
        })();

        downloaded += rf.bytes_down();

        if let Err(e) = result {
            if matches!(e.downcast_ref::<ZsyncError>(), Some(ZsyncError::Transport(_))) {
                logger.error("range fetch", &e.to_string());
                pool.retain(|u| u != &url);
                continue;
            }
            return Err(e);
        }
    }

    let (sigs, store, reg) = state.core_mut();
    receiver.finish(sigs, store, reg)?;
    Ok(downloaded)
}

/// The gzip/zmap fetch path.
fn fetch_compressed(state: &mut ZsyncState, opts: &Opts, user_agent: &str, logger: &dyn Logger) -> Result<u64> {
    let zmap = state
        .zmap
        .clone()
        .context("prefer_compressed() returned true without a zmap")?;
    let mut pool = state.zurls.clone();
    let mut downloaded = 0u64;

    loop {
        let uncompressed = state.needed_byte_ranges();
        if uncompressed.is_empty() {
            break;
        }
        let compressed = zmap.to_compressed_ranges(&uncompressed)?;

        let Some(url) = pick_url(&pool) else {
            return Err(anyhow::Error::new(ZsyncError::UrlsExhausted {
                filename: state.filename.clone().unwrap_or_default(),
            }));
        };
        let parsed = HttpUrl::parse(&url).map_err(|e| anyhow::Error::new(ZsyncError::Configuration(e.to_string())))?;
        logger.connecting(&parsed.host, parsed.port);
        let total_bytes: u64 = compressed.iter().map(|&(s, e)| e - s).sum();
        logger.range_request(compressed.len(), total_bytes);

        let config = FetchConfig {
            user_agent: user_agent.to_string(),
            referer: opts.referer.clone(),
            auth: opts.parsed_auth()?,
            proxy: None,
        };
        let mut rf = RangeFetch::new(&parsed, config);
        let inclusive: Vec<(u64, u64)> = compressed.iter().map(|&(s, e)| (s, e - 1)).collect();
        rf.add_ranges(&inclusive);

        // Reset per connection attempt: the inflate state and any
        // partially-decoded output from a failed attempt must not carry
        // forward, since the retried range starts the compressed stream
        // fresh from its own checkpoint.
        let mut receiver = CompressedReceiver::new(state.blocksize, &zmap);

        let mut buf = vec![0u8; 64 * 1024];
        let result: Result<()> = (|| {
            while let Some(block) = rf.get_range_block(&mut buf)? {
                let (sigs, store, reg) = state.core_mut();
                receiver.receive_data(&block.data, block.offset, sigs, store, reg)?;
            }
            Ok(())
        })();

        downloaded += rf.bytes_down();

        if let Err(e) = result {
            if matches!(e.downcast_ref::<ZsyncError>(), Some(ZsyncError::Transport(_))) {
                logger.error("range fetch", &e.to_string());
                pool.retain(|u| u != &url);
                continue;
            }
            return Err(e);
        }
    }

    Ok(downloaded)
}
