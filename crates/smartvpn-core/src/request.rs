//! HTTP proxy request-head parsing and the per-connection pending buffer.
//!
//! The ingress listener feeds raw client bytes into a [`RequestAccumulator`]
//! and only acts once a complete head (plus any `Content-Length` body) is
//! buffered, so a request split at arbitrary offsets dispatches exactly
//! once.

use crate::error::{ProxyError, ProxyResult};
use crate::messages::DEFAULT_CONNECT_PORT;
use std::fmt;
use std::net::IpAddr;

/// Default cap on the request head (64 KiB).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Default cap on a buffered `Content-Length` body (1 MiB).
pub const MAX_BODY_SIZE: usize = 1_048_576;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Origin URI scheme, when the request names one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, `[v6]:port`, or a bare IPv6 literal.
    pub fn parse(s: &str, default_port: u16) -> ProxyResult<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ProxyError::Parse(format!("unterminated IPv6 literal: {s}")))?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    ProxyError::Parse(format!("unexpected characters after IPv6 literal: {s}"))
                })?),
            };
            (host, port)
        } else {
            match s.split_once(':') {
                Some((_, rest)) if rest.contains(':') => (s, None),
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(ProxyError::Parse(format!("empty host in {s:?}")));
        }
        if host
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '@' || c.is_control())
        {
            return Err(ProxyError::Parse(format!("invalid host: {host:?}")));
        }

        let port = match port {
            None => default_port,
            Some(p) => match p.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(ProxyError::Parse(format!("invalid port: {p:?}"))),
            },
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the host is the unspecified address or a loopback address.
    ///
    /// Such targets are refused to prevent proxy loops and probing of local
    /// services.
    pub fn is_forbidden(&self) -> bool {
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip.is_unspecified() || ip.is_loopback(),
            Err(_) => false,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed HTTP/1.x request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a head (request line + header lines, CRLF-separated).
    pub fn parse(head: &[u8]) -> ProxyResult<Self> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
            _ => {
                return Err(ProxyError::Parse(format!(
                    "malformed request line: {request_line:?}"
                )))
            }
        };
        if !method.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-' || b == b'_') {
            return Err(ProxyError::Parse(format!("invalid method: {method:?}")));
        }
        if !version.starts_with("HTTP/1.") {
            return Err(ProxyError::Parse(format!("unsupported version: {version:?}")));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::Parse(format!("malformed header line: {line:?}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> ProxyResult<Option<usize>> {
        match self.header("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ProxyError::Parse(format!("invalid Content-Length: {v:?}"))),
        }
    }

    /// Scheme of an absolute-form request target (`http://...`).
    pub fn scheme(&self) -> Option<Scheme> {
        let lower = self.target.to_ascii_lowercase();
        if lower.starts_with("http://") {
            Some(Scheme::Http)
        } else if lower.starts_with("https://") {
            Some(Scheme::Https)
        } else {
            None
        }
    }

    /// Resolve where this request must be routed.
    ///
    /// CONNECT takes `host[:port]` from the request line (default 443).
    /// Other methods take the host from the `Host:` header; the port comes
    /// from that header, else the absolute-form scheme, else 443.
    pub fn route_target(&self) -> ProxyResult<Target> {
        let target = if self.is_connect() {
            Target::parse(&self.target, DEFAULT_CONNECT_PORT)?
        } else {
            let host = self
                .header("Host")
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ProxyError::Parse("missing Host header".into()))?;
            let default_port = self
                .scheme()
                .map(|s| s.default_port())
                .unwrap_or(DEFAULT_CONNECT_PORT);
            Target::parse(host, default_port)?
        };

        if target.is_forbidden() {
            return Err(ProxyError::Parse(format!(
                "refusing local target {}",
                target.host()
            )));
        }
        Ok(target)
    }

    /// Scheme the origin should be spoken to with on the direct path.
    pub fn effective_scheme(&self, target: &Target) -> Scheme {
        match self.scheme() {
            Some(s) => s,
            None if target.port() == 443 => Scheme::Https,
            None => Scheme::Http,
        }
    }
}

/// One complete request taken from the pending buffer.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub head: RequestHead,
    /// Raw bytes of the head plus any `Content-Length` body.
    pub raw: Vec<u8>,
}

/// Per-connection pending buffer.
///
/// Bytes accumulate until a full request is available; nothing is
/// released before that.
#[derive(Debug)]
pub struct RequestAccumulator {
    buffer: Vec<u8>,
    /// Offset up to which the buffer has been searched for the terminator.
    scanned: usize,
    /// Parsed head and its length, while waiting for the body.
    head: Option<(RequestHead, usize)>,
    max_head: usize,
    max_body: usize,
}

impl Default for RequestAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAccumulator {
    pub fn new() -> Self {
        Self::with_limits(MAX_HEAD_SIZE, MAX_BODY_SIZE)
    }

    pub fn with_limits(max_head: usize, max_body: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            head: None,
            max_head,
            max_body,
        }
    }

    /// Append bytes and return the request once it is complete.
    pub fn push(&mut self, data: &[u8]) -> ProxyResult<Option<ParsedRequest>> {
        self.buffer.extend_from_slice(data);
        self.poll()
    }

    fn poll(&mut self) -> ProxyResult<Option<ParsedRequest>> {
        if self.head.is_none() {
            let start = self.scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
            let found = self.buffer[start..]
                .windows(HEAD_TERMINATOR.len())
                .position(|w| w == HEAD_TERMINATOR)
                .map(|p| start + p + HEAD_TERMINATOR.len());
            self.scanned = self.buffer.len();

            let head_len = match found {
                Some(len) => len,
                None => {
                    if self.buffer.len() > self.max_head {
                        return Err(ProxyError::Parse(format!(
                            "request head exceeds {} bytes",
                            self.max_head
                        )));
                    }
                    return Ok(None);
                }
            };
            if head_len > self.max_head {
                return Err(ProxyError::Parse(format!(
                    "request head exceeds {} bytes",
                    self.max_head
                )));
            }

            let head = RequestHead::parse(&self.buffer[..head_len - HEAD_TERMINATOR.len()])?;
            self.head = Some((head, head_len));
        }

        let Some((head, head_len)) = self.head.take() else {
            return Ok(None);
        };
        let body_len = if head.is_connect() {
            0
        } else {
            head.content_length()?.unwrap_or(0)
        };
        if body_len > self.max_body {
            return Err(ProxyError::Parse(format!(
                "request body of {body_len} bytes exceeds {} bytes",
                self.max_body
            )));
        }

        let total = head_len + body_len;
        if self.buffer.len() < total {
            self.head = Some((head, head_len));
            return Ok(None);
        }

        let raw: Vec<u8> = self.buffer.drain(..total).collect();
        self.scanned = 0;
        Ok(Some(ParsedRequest { head, raw }))
    }

    /// Parse the next request from bytes already buffered, if complete.
    ///
    /// Keep-alive clients send follow-up requests on the same connection;
    /// whatever followed a dispatched request stays buffered for this.
    pub fn next_request(&mut self) -> ProxyResult<Option<ParsedRequest>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        self.poll()
    }

    /// Take the bytes received after the dispatched request.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.scanned = 0;
        self.head = None;
        std::mem::take(&mut self.buffer)
    }

    /// Number of buffered bytes.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
