//! Minimal HTTP/1.1 request/response framing for ranged track fetches.
//!
//! The reader speaks raw HTTP over a non-blocking socket, so this module only builds the
//! request text and parses a response head once it has been fully buffered.

use anyhow::{Context, Result, anyhow, bail};
use url::Url;

/// Where a track request goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpTarget {
    url: Url,
}

impl HttpTarget {
    /// Parse an absolute `http://` or `https://` URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid url {raw}"))?;
        Self::from_url(url)
    }

    fn from_url(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            other => bail!("unsupported scheme {other}"),
        }
        if url.host_str().is_none() {
            bail!("url has no host: {url}");
        }
        Ok(Self { url })
    }

    /// Resolve a `Location` header (absolute or relative) against this target.
    pub fn redirect(&self, location: &str) -> Result<Self> {
        let url = self
            .url
            .join(location.trim())
            .with_context(|| format!("invalid redirect location {location}"))?;
        Self::from_url(url)
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }

    /// Request path including the query string.
    pub fn path(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{q}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Ranged GET starting at `offset`.
    pub fn request(&self, offset: u64) -> String {
        let host = match self.url.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        };
        format!(
            "GET {} HTTP/1.1\r\nHost: {host}\r\nRange: bytes={offset}-\r\n\r\n",
            self.path(),
        )
    }
}

/// Parsed status line and the headers the reader cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range_total: Option<u64>,
    pub location: Option<String>,
}

impl ResponseHead {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }

    /// Total track length stated by the response.
    ///
    /// A `206` must carry a numeric `Content-Range` total; an unknown (`*`) or missing total
    /// gives `None`. A `200` covers the whole resource, so its `Content-Length` is the total.
    pub fn total_length(&self) -> Option<u64> {
        if self.status == 206 {
            return self.content_range_total;
        }
        self.content_range_total.or(self.content_length)
    }
}

/// Index just past the `\r\n\r\n` terminating a response head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a complete response head (status line + headers).
pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
    let text = std::str::from_utf8(head).context("response head is not utf-8")?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        bail!("malformed status line: {status_line}");
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed status line: {status_line}"))?;

    let mut out = ResponseHead {
        status,
        ..ResponseHead::default()
    };
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            out.content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("content-range") {
            out.content_range_total = parse_content_range_total(value);
        } else if name.eq_ignore_ascii_case("location") {
            out.location = Some(value.to_string());
        }
    }
    Ok(out)
}

/// Extract the total length from a Content-Range header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
