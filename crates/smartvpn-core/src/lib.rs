//! smartvpn-core: Shared protocol library for the SmartVPN split proxy.
//!
//! Provides the relay control message and its length-prefixed CBOR codec,
//! the whitelist matcher used for routing, HTTP proxy request-head parsing,
//! the error taxonomy shared by the agent and the relay, certificate
//! fingerprints for logging, and config path helpers.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod paths;
pub mod request;
pub mod whitelist;

// Re-export commonly used items at crate root.
pub use codec::{encode_control, FrameDecoder, MAX_FRAME_SIZE};
pub use error::{ProxyError, ProxyResult};
pub use identity::{certificate_fingerprint, short_fingerprint};
pub use messages::{ControlKind, ControlMessage, ErrorReply};
pub use paths::expand_tilde;
pub use request::{ParsedRequest, RequestAccumulator, RequestHead, Scheme, Target};
pub use whitelist::{is_whitelisted, RoutePolicy, SharedRoutePolicy, Whitelist};
