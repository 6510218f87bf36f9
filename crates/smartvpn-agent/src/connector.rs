//! Opens mutual-TLS sessions to the relay and sends one control message.

use crate::config::AgentConfig;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use smartvpn_core::messages::CONNECT_OK_PREFIX;
use smartvpn_core::{encode_control, ControlMessage, ErrorReply, ProxyError, ProxyResult, Target};
use smartvpn_transport::{classify_tls_error, client_config, TlsMaterial};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// TLS stream to the relay.
pub type RelayStream = TlsStream<TcpStream>;

const MAX_REPLY_HEAD: usize = 16 * 1024;

/// Dials the relay for each proxied request.
#[derive(Clone)]
pub struct RelayConnector {
    tls: TlsConnector,
    addr: String,
    server_name: ServerName<'static>,
    deadline: Duration,
}

impl std::fmt::Debug for RelayConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnector")
            .field("addr", &self.addr)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl RelayConnector {
    /// Load the agent's certificate material and build the connector.
    pub fn from_config(config: &AgentConfig) -> ProxyResult<Self> {
        let material = TlsMaterial::load(config.cert_path.as_deref(), config.key_path.as_deref(), &config.ca_paths)?;
        if material.identity.is_none() {
            warn!("no client certificate configured, the relay must run in compatibility mode");
        }
        let tls = client_config(material, &config.tls_policy)?;
        Self::new(tls, config.relay_addr(), &config.server_name, config.timeouts.relay_connect)
    }

    pub fn new(tls: Arc<ClientConfig>, addr: String, server_name: &str, deadline: Duration) -> ProxyResult<Self> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ProxyError::Config(format!("invalid relay server name {server_name:?}: {e}")))?;
        Ok(Self {
            tls: TlsConnector::from(tls),
            addr,
            server_name,
            deadline,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Ask the relay for a raw tunnel to `target`.
    ///
    /// Returns the stream positioned after the relay's acknowledgment,
    /// plus any tunnel bytes that arrived together with it.
    pub async fn open_tunnel(&self, target: &Target) -> ProxyResult<(RelayStream, Vec<u8>)> {
        let msg = ControlMessage::connect(target.to_string())?;
        self.within_deadline(async {
            let mut tls = self.handshake().await?;
            send(&mut tls, &msg).await?;
            let leftover = read_ack(&mut tls).await?;
            Ok((tls, leftover))
        })
        .await
    }

    /// Hand the relay one HTTP request; the response follows on the stream.
    pub async fn forward_http(&self, target: &Target, payload: Vec<u8>) -> ProxyResult<RelayStream> {
        let msg = ControlMessage::http(target.to_string(), payload)?;
        self.within_deadline(async {
            let mut tls = self.handshake().await?;
            send(&mut tls, &msg).await?;
            Ok(tls)
        })
        .await
    }

    async fn within_deadline<T>(&self, fut: impl Future<Output = ProxyResult<T>>) -> ProxyResult<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout {
                stage: "relay connect",
                after: self.deadline,
            }),
        }
    }

    async fn handshake(&self) -> ProxyResult<RelayStream> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ProxyError::Connect(format!("relay {}: {e}", self.addr)))?;
        let _ = tcp.set_nodelay(true);
        let tls = self
            .tls
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(classify_tls_error)?;
        debug!(relay = %self.addr, "relay session established");
        Ok(tls)
    }
}

async fn send(tls: &mut RelayStream, msg: &ControlMessage) -> ProxyResult<()> {
    let frame = encode_control(msg)?;
    tls.write_all(&frame).await.map_err(classify_tls_error)?;
    tls.flush().await.map_err(classify_tls_error)?;
    Ok(())
}

/// Read the CONNECT reply head. Returns bytes that followed it.
async fn read_ack(tls: &mut RelayStream) -> ProxyResult<Vec<u8>> {
    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tls.read(&mut chunk).await.map_err(classify_tls_error)?;
        if n == 0 {
            return Err(refused(&reply));
        }
        reply.extend_from_slice(&chunk[..n]);

        let seen = reply.len().min(CONNECT_OK_PREFIX.len());
        if reply[..seen] != CONNECT_OK_PREFIX[..seen] {
            // Not an acknowledgment: collect the rest for the error text.
            drain_reply(tls, &mut reply).await;
            return Err(refused(&reply));
        }
        if let Some(end) = reply.windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(reply.split_off(end + 4));
        }
        if reply.len() > MAX_REPLY_HEAD {
            return Err(ProxyError::Connect("relay reply head too large".into()));
        }
    }
}

async fn drain_reply(tls: &mut RelayStream, reply: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    while reply.len() < MAX_REPLY_HEAD {
        match tls.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => reply.extend_from_slice(&chunk[..n]),
        }
    }
}

fn refused(reply: &[u8]) -> ProxyError {
    if reply.is_empty() {
        return ProxyError::Connect("relay closed without a reply".into());
    }
    match ErrorReply::parse(reply) {
        Some(err) => ProxyError::Connect(format!("relay refused tunnel: {}", err.error)),
        None => {
            let line = String::from_utf8_lossy(reply);
            let line = line.lines().next().unwrap_or_default();
            ProxyError::Connect(format!("relay refused tunnel: {line}"))
        }
    }
}
