use std::time::Duration;
use thiserror::Error;

/// Errors produced by the SmartVPN relay engine.
///
/// Every per-connection failure maps onto one of these variants so the
/// caller can decide between a 502, an error reply, or a silent close.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request line, missing `Host:` header, or a forbidden target.
    #[error("parse error: {0}")]
    Parse(String),

    /// The TLS peer could not be authenticated against the configured CA.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Origin or relay unreachable, or the relay refused the tunnel.
    #[error("connect error: {0}")]
    Connect(String),

    /// Malformed or unrecognized control message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{stage} timed out after {}ms", after.as_millis())]
    Timeout { stage: &'static str, after: Duration },

    /// Unusable key, certificate, or CA material, or an invalid TLS policy.
    #[error("tls error: {0}")]
    Tls(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Stable lowercase label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Parse(_) => "parse",
            ProxyError::Auth(_) => "auth",
            ProxyError::Connect(_) => "connect",
            ProxyError::Protocol(_) => "protocol",
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::Tls(_) => "tls",
            ProxyError::Config(_) => "config",
            ProxyError::Io(_) => "io",
        }
    }

    /// Whether this error means the far side could not be reached, which
    /// the plain-HTTP path reports to the client as `502 Bad Gateway`.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect(_) | ProxyError::Timeout { .. } | ProxyError::Auth(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for ProxyError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ProxyError::Protocol(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ProxyError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ProxyError::Protocol(e.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
