//! Top-level error taxonomy and exit codes.
//!
//! Most plumbing in this crate returns `anyhow::Result` with `.context(..)`
//! breadcrumbs, matching the teacher's style throughout `net.rs`/`main.rs`.
//! `ZsyncError` exists at the driver boundary only, where the taxonomy in
//! the error-handling design (format vs. configuration vs. transport vs.
//! whole-file verification) determines both retry behaviour and the
//! process exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZsyncError {
    /// Control file malformed, missing a required key, or a truncated
    /// binary section. Fails fast, before any network activity.
    #[error("malformed control file: {0}")]
    Format(String),

    /// Zmap inconsistency, a relative URL with no referer to resolve
    /// against, or similar. Per-URL: the caller should try another URL.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection failure, unexpected status, or a protocol violation.
    /// Per-URL: the caller should eliminate this URL and pick another.
    #[error("transport error: {0}")]
    Transport(String),

    /// The assembled file's whole-file SHA-1 didn't match the control
    /// file's declared digest. Fatal; the scratch file is preserved.
    #[error("whole-file checksum mismatch (expected {expected}, got {actual})")]
    Sha1Mismatch { expected: String, actual: String },

    /// Every URL in the pool was exhausted without completing the
    /// transfer.
    #[error("no usable URL remained for {filename}")]
    UrlsExhausted { filename: String },

    /// A local filesystem problem unrelated to the transfer itself:
    /// missing seed file, permission denied, disk full.
    #[error("local file error: {0}")]
    LocalFile(String),
}

impl ZsyncError {
    /// Maps the taxonomy onto the documented process exit codes:
    /// 1 internal error, 2 local file error, 3 unusable control file or
    /// fatal transport failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZsyncError::LocalFile(_) => 2,
            ZsyncError::Format(_)
            | ZsyncError::Configuration(_)
            | ZsyncError::Transport(_)
            | ZsyncError::UrlsExhausted { .. }
            | ZsyncError::Sha1Mismatch { .. } => 3,
        }
    }
}

/// Inspects an `anyhow::Error` chain for a `ZsyncError` and returns its
/// exit code, defaulting to 1 (internal error) for anything else —
/// I/O failures, allocation failures, or bugs that escaped typing.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ZsyncError>()
        .map(ZsyncError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_file_error_maps_to_exit_code_2() {
        let e = ZsyncError::LocalFile("seed file missing".into());
        assert_eq!(e.exit_code(), 2);
    }

    #[test]
    fn transport_and_format_and_sha1_map_to_exit_code_3() {
        assert_eq!(ZsyncError::Transport("refused".into()).exit_code(), 3);
        assert_eq!(ZsyncError::Format("bad header".into()).exit_code(), 3);
        assert_eq!(
            ZsyncError::Sha1Mismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn unrecognised_anyhow_error_defaults_to_internal() {
        let err = anyhow::anyhow!("some io failure");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn wrapped_zsync_error_is_recovered_through_the_chain() {
        let err = anyhow::Error::new(ZsyncError::Configuration("relative URL, no referer".into()))
            .context("resolving URL list");
        assert_eq!(exit_code_for(&err), 3);
    }
}
