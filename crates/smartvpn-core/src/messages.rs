//! Relay control message and the fixed replies exchanged around it.
//!
//! A control message is produced by the agent's ingress listener, sent once
//! per logical request over the mutual-TLS relay stream, and consumed by the
//! relay dispatcher. Its wire encoding lives in [`crate::codec`].

use crate::error::{ProxyError, ProxyResult};
use crate::request::Target;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal acknowledgment for an established CONNECT tunnel.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Prefix that marks a successful CONNECT reply from the relay.
pub const CONNECT_OK_PREFIX: &[u8] = b"HTTP/1.1 200";

/// Reply sent on the plain-HTTP path when the origin cannot be reached.
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Default origin port for a CONNECT target without one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Default origin port for an HTTP target without one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// The requested relay action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Open a raw tunnel to the target.
    Connect,
    /// Forward one HTTP request and stream the origin's response back.
    Http,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Connect => "CONNECT",
            ControlKind::Http => "HTTP",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(ControlKind::Connect),
            "HTTP" => Some(ControlKind::Http),
            _ => None,
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated relay control message.
///
/// Construct through [`ControlMessage::connect`] / [`ControlMessage::http`]
/// or by decoding a frame; both paths guarantee a non-empty, parseable
/// `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    kind: ControlKind,
    target: String,
    payload: Option<Vec<u8>>,
}

impl ControlMessage {
    /// Build a CONNECT request for `target` (`host[:port]`).
    pub fn connect(target: impl Into<String>) -> ProxyResult<Self> {
        Self::build(ControlKind::Connect, target.into(), None)
    }

    /// Build an HTTP request carrying the raw request bytes.
    pub fn http(target: impl Into<String>, payload: Vec<u8>) -> ProxyResult<Self> {
        Self::build(ControlKind::Http, target.into(), Some(payload))
    }

    fn build(kind: ControlKind, target: String, payload: Option<Vec<u8>>) -> ProxyResult<Self> {
        let msg = Self {
            kind,
            target,
            payload,
        };
        msg.destination()?;
        Ok(msg)
    }

    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Raw request bytes (HTTP kind only).
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Consume the message, returning its payload.
    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.payload
    }

    /// Parse `target` into host and port, defaulting the port by kind.
    pub fn destination(&self) -> ProxyResult<Target> {
        let default_port = match self.kind {
            ControlKind::Connect => DEFAULT_CONNECT_PORT,
            ControlKind::Http => DEFAULT_HTTP_PORT,
        };
        Target::parse(&self.target, default_port)
            .map_err(|e| ProxyError::Protocol(format!("invalid target {:?}: {e}", self.target)))
    }

    pub(crate) fn to_wire(&self) -> WireControl {
        WireControl {
            kind: Some(self.kind.as_str().to_string()),
            target: Some(self.target.clone()),
            payload: match self.kind {
                ControlKind::Http => self.payload.clone(),
                ControlKind::Connect => None,
            },
        }
    }
}

impl TryFrom<WireControl> for ControlMessage {
    type Error = ProxyError;

    fn try_from(wire: WireControl) -> ProxyResult<Self> {
        let kind_str = wire
            .kind
            .ok_or_else(|| ProxyError::Protocol("missing request kind".into()))?;
        let kind = ControlKind::parse(&kind_str)
            .ok_or_else(|| ProxyError::Protocol(format!("unknown request kind: {kind_str}")))?;

        let target = match wire.target {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(ProxyError::Protocol("missing target".into())),
        };

        let payload = match kind {
            ControlKind::Http => Some(
                wire.payload
                    .ok_or_else(|| ProxyError::Protocol("HTTP request without payload".into()))?,
            ),
            ControlKind::Connect => None,
        };

        let msg = ControlMessage {
            kind,
            target,
            payload,
        };
        msg.destination()?;
        Ok(msg)
    }
}

/// Serialized form of a control message.
///
/// Every field is optional on the wire so a malformed unit decodes far
/// enough to produce a precise protocol error.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireControl {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_bytes")]
    pub payload: Option<Vec<u8>>,
}

/// Error body the relay writes before closing a failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// JSON encoding: `{"error":"<description>"}`.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec())
    }

    /// Try to interpret a relay reply as an error body.
    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Serde helper encoding `Option<Vec<u8>>` as a CBOR byte string rather
/// than an array of integers.
mod opt_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_bytes(bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        deserializer.deserialize_option(OptBytesVisitor)
    }

    struct OptBytesVisitor;

    impl<'de> Visitor<'de> for OptBytesVisitor {
        type Value = Option<Vec<u8>>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an optional byte string")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            deserializer.deserialize_byte_buf(BytesVisitor).map(Some)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}
