//! smartvpn-agent: the local side of the split proxy.
//!
//! Listens for plain HTTP proxy clients, decides per request whether to go
//! direct or through the relay, and relays bytes until either side closes.

pub mod config;
pub mod connector;
pub mod ingress;

pub use config::{AgentConfig, AgentOverrides, AgentTimeouts, WhitelistSettings};
pub use connector::RelayConnector;
pub use ingress::{AgentServer, AgentStatus};
