//! smartvpn-relay: the remote egress side of the split proxy.
//!
//! Accepts mutual-TLS sessions from agents, decodes one control message per
//! session, dials the requested origin and relays bytes back.

pub mod certgen;
pub mod config;
pub mod dispatcher;

pub use certgen::{generate_dev_pki, DevPki};
pub use config::{RelayConfig, RelayOverrides, RelayTimeouts};
pub use dispatcher::RelayServer;
