//! Control-file retrieval: a thin `HTTP/1.0` GET, not the pipelined
//! range-fetch client's job.
//!
//! Grounded on `examples/original_source/c/http.c` (`http_get`), reworked
//! into a single request/response exchange reusing the same blocking
//! `TcpStream` plumbing as `httpfetch.rs` rather than a second transport
//! layer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::error::ZsyncError;
use crate::url::HttpUrl;

const MAX_REDIRECTS: u32 = 5;

pub struct ControlFileResponse {
    pub body: Vec<u8>,
    /// The URL the body was finally retrieved from, after following any
    /// redirects — used as the `Referer:` for subsequent range fetches.
    pub effective_url: String,
    /// `true` on a `304 Not Modified` against `final_target_path`'s mtime;
    /// `body` is empty in that case.
    pub not_modified: bool,
}

/// Fetches the control file at `url`. If `dest_part_path` (the target's
/// resumed `.part`) exists, sends `If-Unmodified-Since` plus a resuming
/// `Range:` header; else if `final_target_path` exists, sends
/// `If-Modified-Since` so an up-to-date target short-circuits with `304`.
pub fn fetch_control_file(
    url: &str,
    user_agent: &str,
    dest_part_path: Option<&Path>,
    final_target_path: Option<&Path>,
) -> Result<ControlFileResponse> {
    let mut current = url.to_string();

    for _ in 0..MAX_REDIRECTS {
        let target = HttpUrl::parse(&current)
            .map_err(|e| anyhow::Error::new(ZsyncError::Configuration(e.to_string())))?;
        let resp = get_once(&target, user_agent, dest_part_path, final_target_path)?;

        match resp.status {
            301 | 302 | 303 | 307 => {
                let location = resp
                    .headers
                    .get("location")
                    .cloned()
                    .ok_or_else(|| anyhow::Error::new(ZsyncError::Transport("redirect with no Location".into())))?;
                current = HttpUrl::resolve(&current, &location)?.to_string();
            }
            304 => {
                return Ok(ControlFileResponse {
                    body: Vec::new(),
                    effective_url: current,
                    not_modified: true,
                });
            }
            412 => {
                // Precondition failed against a resumed Range/If-Unmodified
                // request; retry once with a fresh, unconditional GET.
                let fresh = get_once(&target, user_agent, None, None)?;
                return Ok(ControlFileResponse {
                    body: fresh.body,
                    effective_url: current,
                    not_modified: false,
                });
            }
            200 | 206 => {
                return Ok(ControlFileResponse {
                    body: resp.body,
                    effective_url: current,
                    not_modified: false,
                });
            }
            other => bail!(ZsyncError::Transport(format!(
                "control file fetch got unexpected status {other}"
            ))),
        }
    }

    bail!(ZsyncError::Transport(format!(
        "too many redirects fetching control file (> {MAX_REDIRECTS})"
    )))
}

struct RawResponse {
    status: u32,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn get_once(
    url: &HttpUrl,
    user_agent: &str,
    dest_part_path: Option<&Path>,
    final_target_path: Option<&Path>,
) -> Result<RawResponse> {
    let mut stream = TcpStream::connect((url.host.as_str(), url.port))
        .with_context(|| format!("connecting to {}:{}", url.host, url.port))
        .map_err(|e| anyhow::Error::new(ZsyncError::Transport(e.to_string())))?;

    let mut request = format!(
        "GET {} HTTP/1.0\r\nUser-Agent: {}\r\nHost: {}\r\n",
        url.path, user_agent, url.host
    );

    if let Some(part) = dest_part_path {
        if let Ok(meta) = std::fs::metadata(part) {
            request.push_str(&format!("If-Unmodified-Since: {}\r\n", format_http_date(meta.modified()?)));
            request.push_str(&format!("Range: bytes={}-\r\n", meta.len()));
        }
    } else if let Some(target) = final_target_path {
        if let Ok(meta) = std::fs::metadata(target) {
            request.push_str(&format!("If-Modified-Since: {}\r\n", format_http_date(meta.modified()?)));
        }
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .map_err(|e| anyhow::Error::new(ZsyncError::Transport(e.to_string())))?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .map_err(|e| anyhow::Error::new(ZsyncError::Transport(e.to_string())))?;

    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<RawResponse> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n"))
        .ok_or_else(|| anyhow::Error::new(ZsyncError::Transport("no header terminator in response".into())))?;
    let sep_len = if raw[split..].starts_with(b"\r\n\r\n") { 4 } else { 2 };
    let header_text = String::from_utf8_lossy(&raw[..split]);
    let body = raw[split + sep_len..].to_vec();

    let mut lines = header_text.split("\r\n").flat_map(|l| l.split('\n'));
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow::Error::new(ZsyncError::Transport("empty response".into())))?;
    if !status_line.starts_with("HTTP/1") {
        bail!(ZsyncError::Transport(format!("not an HTTP response: {status_line}")));
    }
    let status: u32 = status_line
        .split(' ')
        .nth(1)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| anyhow::Error::new(ZsyncError::Transport(format!("unparsable status line: {status_line}"))))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(RawResponse { status, headers, body })
}

fn format_http_date(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
