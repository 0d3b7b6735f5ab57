//! HTTP URL parsing and relative-to-absolute resolution.
//!
//! Grounded on `examples/original_source/c/url.c` (`get_host_port`,
//! `make_url_absolute`), reworked from raw pointer/`strchr` scanning into
//! `str` slicing, and widened to return `Result` instead of a null
//! pointer on malformed input.

use anyhow::{bail, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    /// Path plus any query string, always starting with `/`.
    pub path: String,
}

impl HttpUrl {
    /// Parses an absolute `http://host[:port][/path]` URL. Only the `http`
    /// scheme is accepted; `https` and anything else are configuration
    /// errors, per the no-TLS scope of this client.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = match s.split_once("://") {
            Some(("http", rest)) => rest,
            Some((scheme, _)) => bail!("unsupported URL scheme '{scheme}' in '{s}'"),
            None => bail!("'{s}' is not an absolute URL (no scheme)"),
        };

        let (hostport, path) = match rest.split_once('/') {
            Some((hp, p)) => (hp, format!("/{p}")),
            None => (rest, "/".to_string()),
        };
        if hostport.is_empty() {
            bail!("'{s}' has an empty host");
        }

        let (host, port) = match hostport.split_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid port '{p}' in '{s}'"))?;
                (h.to_string(), port)
            }
            None => (hostport.to_string(), 80),
        };

        Ok(Self { host, port, path })
    }

    /// Resolves `url` against this URL as a base, following the same rules
    /// as an HTML `<base>`: absolute URLs (have a scheme) pass through,
    /// root-relative paths (`/foo`) keep the base's authority, and
    /// document-relative paths replace everything after the base's last
    /// `/`.
    pub fn resolve(base: &str, url: &str) -> Result<Self> {
        if url.contains("://") {
            return Self::parse(url);
        }

        if let Some(rest) = url.strip_prefix('/') {
            let base_url = Self::parse(base)?;
            return Self::parse(&format!("http://{}:{}/{}", base_url.host, base_url.port, rest));
        }

        let cut = base.rfind('/').ok_or_else(|| {
            anyhow::anyhow!("base URL '{base}' has no path to resolve '{url}' against")
        })?;
        let prefix = &base[..=cut];
        Self::parse(&format!("{prefix}{url}"))
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 80 {
            write!(f, "http://{}{}", self.host, self.path)
        } else {
            write!(f, "http://{}:{}{}", self.host, self.port, self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        let u = HttpUrl::parse("http://example.com:8080/foo/bar.zsync").unwrap();
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 8080);
        assert_eq!(u.path, "/foo/bar.zsync");
    }

    #[test]
    fn defaults_port_and_root_path() {
        let u = HttpUrl::parse("http://example.com").unwrap();
        assert_eq!(u.port, 80);
        assert_eq!(u.path, "/");
    }

    #[test]
    fn rejects_https() {
        assert!(HttpUrl::parse("https://example.com/x").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(HttpUrl::parse("example.com/x").is_err());
    }

    #[test]
    fn resolves_document_relative_url() {
        let resolved = HttpUrl::resolve("http://example.com/dist/pkg.zsync", "pkg.tar.gz").unwrap();
        assert_eq!(resolved.to_string(), "http://example.com/dist/pkg.tar.gz");
    }

    #[test]
    fn resolves_root_relative_url() {
        let resolved = HttpUrl::resolve("http://example.com/dist/pkg.zsync", "/other/pkg.tar.gz").unwrap();
        assert_eq!(resolved.to_string(), "http://example.com/other/pkg.tar.gz");
    }

    #[test]
    fn absolute_url_passes_through_unchanged() {
        let resolved =
            HttpUrl::resolve("http://example.com/dist/pkg.zsync", "http://mirror.example/pkg.tar.gz").unwrap();
        assert_eq!(resolved.to_string(), "http://mirror.example/pkg.tar.gz");
    }
}
