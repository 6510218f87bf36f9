//! smartvpn-transport: async plumbing shared by the agent and the relay.
//!
//! - [`tunnel`]: bidirectional byte pump with idle teardown
//! - [`origin`]: dialing origin servers (pluggable for tests)
//! - [`registry`]: live connection tracking with RAII leases
//! - [`tls`]: rustls client/server configuration from PEM material
//! - [`lifecycle`]: service status, fault monitor, shutdown signals

pub mod lifecycle;
pub mod origin;
pub mod registry;
pub mod tls;
pub mod tunnel;

pub use lifecycle::{shutdown_signal, FaultMonitor, ServiceStatus};
pub use origin::{
    connect_with_timeout, upgrade_to_tls, AsyncStream, BoxedStream, OriginConnector, TcpOriginConnector,
};
pub use registry::{ConnectionEntry, ConnectionLease, ConnectionRegistry, ConnectionRole};
pub use tls::{
    classify_tls_error, client_config, peer_fingerprint, server_config, ClientAuthMode, ClientChainCheck, Identity,
    TlsMaterial, TlsPolicy, TlsVersion,
};
pub use tunnel::{pump, relay_response, PumpOptions, Side, TunnelEnd, TunnelReport};
