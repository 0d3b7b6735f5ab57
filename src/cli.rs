//! Command-line argument surface (§6.3): a thin flag set in front of the
//! core transfer.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "zsync", version, about = "Delta-transfer downloads over plain HTTP range requests")]
pub struct Opts {
    /// Add an HTTP Basic auth entry for a host, as host=user:password
    /// (repeatable).
    #[arg(short = 'A', value_name = "host=user:password")]
    pub auth: Vec<String>,

    /// Save the downloaded .zsync control file at this path.
    #[arg(short = 'k', value_name = "file")]
    pub save_zsync: Option<PathBuf>,

    /// Output filename, overriding the control file's Filename:.
    #[arg(short = 'o', value_name = "file")]
    pub output: Option<PathBuf>,

    /// Seed file to scan for already-matching blocks (repeatable).
    #[arg(short = 'i', value_name = "file")]
    pub seed: Vec<PathBuf>,

    /// Referrer URL, when the .zsync was obtained out of band.
    #[arg(short = 'u', value_name = "url")]
    pub referer: Option<String>,

    /// Suppress progress output.
    #[arg(short = 's')]
    pub suppress: bool,

    /// Suppress progress output (alias kept distinct from -s, per upstream).
    #[arg(short = 'q')]
    pub quiet: bool,

    /// The .zsync control file, as a URL or local path.
    pub target: String,
}

impl Opts {
    pub fn is_quiet(&self) -> bool {
        self.suppress || self.quiet
    }

    pub fn parsed_auth(&self) -> Result<Vec<(String, String, String)>> {
        self.auth
            .iter()
            .map(|entry| {
                let (host, rest) = entry
                    .split_once('=')
                    .ok_or_else(|| anyhow!("bad -A entry '{entry}', expected host=user:password"))?;
                let (user, pass) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow!("bad -A entry '{entry}', expected host=user:password"))?;
                Ok((host.to_string(), user.to_string(), pass.to_string()))
            })
            .collect()
    }
}
