//! Relay dispatcher: accept agent sessions and serve one request each.
//!
//! Per session:
//!
//! 1. TLS handshake under the handshake deadline, client certificate
//!    checked according to the configured policy.
//! 2. Read until one control message decodes (idle deadline per read).
//! 3. CONNECT: dial the origin, acknowledge, pump both ways.
//!    HTTP: dial the origin, write the payload, stream the response back.
//!
//! Every failure stays inside its session: a protocol error gets a JSON
//! error reply, an unreachable origin gets an error reply (CONNECT) or
//! `502 Bad Gateway` (HTTP), and the stream is closed.

use crate::config::{RelayConfig, RelayTimeouts};
use smartvpn_core::messages::{BAD_GATEWAY, CONNECT_ESTABLISHED};
use smartvpn_core::{
    short_fingerprint, ControlKind, ControlMessage, ErrorReply, FrameDecoder, ProxyError, ProxyResult,
};
use smartvpn_transport::tls::{classify_tls_error, peer_fingerprint, server_config, ClientChainCheck};
use smartvpn_transport::{
    connect_with_timeout, pump, relay_response, BoxedStream, ClientAuthMode, ConnectionLease, ConnectionRegistry,
    ConnectionRole, OriginConnector, PumpOptions, ServiceStatus, TcpOriginConnector, TlsMaterial,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

type RelayStream = TlsStream<TcpStream>;

/// Shared per-server state handed to every session task.
struct SessionContext {
    acceptor: TlsAcceptor,
    auth_mode: ClientAuthMode,
    /// Set in compatibility mode, where untrusted chains pass the handshake.
    chain_check: Option<ClientChainCheck>,
    connector: Arc<dyn OriginConnector>,
    registry: ConnectionRegistry,
    timeouts: RelayTimeouts,
}

/// A running relay.
pub struct RelayServer {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    started: Instant,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    accepting: watch::Receiver<bool>,
    accept_task: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl RelayServer {
    /// Bind and start accepting with the real TCP origin connector.
    pub async fn start(config: RelayConfig) -> ProxyResult<Self> {
        Self::start_with(config, Arc::new(TcpOriginConnector)).await
    }

    /// Bind and start accepting, dialing origins through `connector`.
    ///
    /// Returns once the listener is bound; bind or certificate errors are
    /// returned to the caller.
    pub async fn start_with(config: RelayConfig, connector: Arc<dyn OriginConnector>) -> ProxyResult<Self> {
        let material = TlsMaterial::load(
            Some(config.cert_path.as_path()),
            Some(config.key_path.as_path()),
            &config.ca_paths,
        )?;
        let auth_mode = config.tls_policy.client_auth();
        let chain_check = match auth_mode {
            ClientAuthMode::Optional => Some(ClientChainCheck::new(material.roots.clone(), &config.tls_policy)?),
            _ => None,
        };
        let tls = server_config(material, &config.tls_policy)?;
        match auth_mode {
            ClientAuthMode::Required => info!("client certificates required"),
            ClientAuthMode::Optional => {
                warn!("compatibility mode: agents without a trusted client certificate will be served")
            }
            ClientAuthMode::None => warn!("client certificates are not requested"),
        }

        let listen = config.listen_addr();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|e| ProxyError::Config(format!("cannot bind {listen}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let registry = ConnectionRegistry::new();
        let ctx = Arc::new(SessionContext {
            acceptor: TlsAcceptor::from(tls),
            auth_mode,
            chain_check,
            connector,
            registry: registry.clone(),
            timeouts: config.timeouts.clone(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let (accepting_tx, accepting) = watch::channel(true);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            config.max_connections,
            stop_rx,
            accepting_tx,
        ));

        let background = vec![
            registry.spawn_sweeper(config.timeouts.sweep_interval),
            spawn_stats(registry.clone(), config.timeouts.stats_interval),
        ];

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            min_tls = %config.tls_policy.min_version,
            "relay listening"
        );

        Ok(Self {
            local_addr,
            registry,
            started: Instant::now(),
            running: Arc::new(AtomicBool::new(true)),
            stop_tx,
            accepting,
            accept_task: Some(accept_task),
            background,
            shutdown_grace: config.timeouts.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::collect(self.running.load(Ordering::Relaxed), &self.registry, self.started)
    }

    /// Resolves if the accept loop ends without `stop()` being called.
    pub async fn accept_stopped(&self) {
        let mut rx = self.accepting.clone();
        let _ = rx.wait_for(|accepting| !*accepting).await;
    }

    /// Stop accepting, close live sessions, wait for the grace period.
    ///
    /// Returns `true` when every session finished in time. Calling it
    /// again is a no-op.
    pub async fn stop(&mut self) -> bool {
        if !self.running.swap(false, Ordering::Relaxed) {
            return true;
        }
        info!(active = self.registry.count(), "relay stopping");
        self.stop_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        for task in self.background.drain(..) {
            task.abort();
        }

        let clean = self.registry.shutdown(self.shutdown_grace).await;
        if clean {
            info!(total = self.registry.total(), "relay stopped");
        } else {
            warn!(remaining = self.registry.count(), "relay stopped with sessions still open");
        }
        clean
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        self.registry.close_all();
        for task in &self.background {
            task.abort();
        }
    }
}

/// Clears the `accepting` flag however the accept loop exits.
struct AcceptingGuard(watch::Sender<bool>);

impl Drop for AcceptingGuard {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    max_connections: usize,
    mut stop_rx: watch::Receiver<bool>,
    accepting: watch::Sender<bool>,
) {
    let _guard = AcceptingGuard(accepting);
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = stop_rx.changed() => break,
        };

        let (tcp, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let active = ctx.registry.count();
        if active >= max_connections {
            warn!(remote = %remote, active, max_connections, "connection limit reached, dropping session");
            drop(tcp);
            continue;
        }

        let session_ctx = ctx.clone();
        ctx.registry.spawn_tracked(remote, ConnectionRole::RelaySession, move |lease| async move {
            let ctx = session_ctx;
            let closed = lease.closed();
            tokio::select! {
                result = serve_session(&ctx, tcp, remote, &lease) => {
                    if let Err(e) = result {
                        warn!(remote = %remote, kind = e.kind(), error = %e, "session failed");
                    }
                }
                _ = closed => debug!(remote = %remote, "session closed by shutdown"),
            }
            drop(lease);
        });
    }
    debug!("accept loop finished");
}

fn spawn_stats(registry: ConnectionRegistry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(active = registry.count(), total = registry.total(), "relay statistics");
        }
    })
}

async fn serve_session(
    ctx: &SessionContext,
    tcp: TcpStream,
    remote: SocketAddr,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    let _ = tcp.set_nodelay(true);
    let mut tls = handshake(ctx, tcp, remote).await?;

    let peer_chain = tls.get_ref().1.peer_certificates();
    let fingerprint = peer_fingerprint(peer_chain);
    let untrusted = match (&ctx.chain_check, peer_chain) {
        (Some(check), Some(chain)) => check.verify(chain).err(),
        _ => None,
    };
    match &fingerprint {
        Some(fp) => {
            lease.set_peer_fingerprint(fp.clone());
            match untrusted {
                None => debug!(remote = %remote, peer = short_fingerprint(fp), "agent authenticated"),
                Some(reason) => warn!(
                    remote = %remote,
                    peer = short_fingerprint(fp),
                    reason = %reason,
                    "agent certificate not trusted, serving in compatibility mode"
                ),
            }
        }
        None if ctx.auth_mode == ClientAuthMode::Optional => {
            warn!(remote = %remote, "agent presented no certificate, serving in compatibility mode");
        }
        None => {}
    }

    let mut decoder = FrameDecoder::new();
    let msg = match read_control(&mut tls, &mut decoder, ctx.timeouts.idle).await {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!(remote = %remote, "agent closed before sending a request");
            return Ok(());
        }
        Err(e @ ProxyError::Protocol(_)) => {
            reply_error(&mut tls, &e).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let target = msg.destination()?;
    if target.is_forbidden() {
        let e = ProxyError::Protocol(format!("refusing local target {}", target.host()));
        reply_error(&mut tls, &e).await;
        return Err(e);
    }
    info!(remote = %remote, kind = %msg.kind(), target = %target, "dispatching");

    let origin = match connect_with_timeout(ctx.connector.as_ref(), &target, ctx.timeouts.origin_connect).await {
        Ok(origin) => origin,
        Err(e) => {
            match msg.kind() {
                ControlKind::Connect => reply_error(&mut tls, &e).await,
                ControlKind::Http => {
                    let _ = tls.write_all(BAD_GATEWAY).await;
                    let _ = tls.shutdown().await;
                }
            }
            return Err(e);
        }
    };

    let early = decoder.take_remaining();
    match msg.kind() {
        ControlKind::Connect => connect_tunnel(ctx, tls, origin, early, lease).await,
        ControlKind::Http => forward_http(ctx, tls, origin, msg, early, lease).await,
    }
}

async fn handshake(ctx: &SessionContext, tcp: TcpStream, remote: SocketAddr) -> ProxyResult<RelayStream> {
    let limit = ctx.timeouts.handshake;
    match tokio::time::timeout(limit, ctx.acceptor.accept(tcp)).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => {
            let err = classify_tls_error(e);
            if let ProxyError::Auth(reason) = &err {
                warn!(remote = %remote, reason = %reason, "rejected unauthorized agent");
            }
            Err(err)
        }
        Err(_) => Err(ProxyError::Timeout {
            stage: "tls handshake",
            after: limit,
        }),
    }
}

/// Read until one control message decodes. `Ok(None)` on EOF first.
async fn read_control(
    tls: &mut RelayStream,
    decoder: &mut FrameDecoder,
    idle: Duration,
) -> ProxyResult<Option<ControlMessage>> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        if let Some(msg) = decoder.next_control()? {
            return Ok(Some(msg));
        }
        let n = match tokio::time::timeout(idle, tls.read(&mut buf)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(ProxyError::Timeout {
                    stage: "control message",
                    after: idle,
                })
            }
        };
        if n == 0 {
            if decoder.pending() > 0 {
                return Err(ProxyError::Protocol("connection closed mid-message".into()));
            }
            return Ok(None);
        }
        decoder.feed(&buf[..n]);
    }
}

async fn reply_error(tls: &mut RelayStream, e: &ProxyError) {
    let body = ErrorReply::new(e.to_string()).to_bytes();
    if let Err(write_err) = tls.write_all(&body).await {
        debug!(error = %write_err, "could not deliver error reply");
    }
    let _ = tls.shutdown().await;
}

async fn connect_tunnel(
    ctx: &SessionContext,
    mut tls: RelayStream,
    mut origin: BoxedStream,
    early: Vec<u8>,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    tls.write_all(CONNECT_ESTABLISHED).await?;
    tls.flush().await?;
    if !early.is_empty() {
        origin.write_all(&early).await?;
    }

    let report = pump(tls, origin, &PumpOptions::with_idle_timeout(ctx.timeouts.idle), lease.closed()).await;
    debug!(
        end = ?report.end,
        up = report.client_to_remote + early.len() as u64,
        down = report.remote_to_client,
        "tunnel closed"
    );
    Ok(())
}

async fn forward_http(
    ctx: &SessionContext,
    tls: RelayStream,
    mut origin: BoxedStream,
    msg: ControlMessage,
    early: Vec<u8>,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    let payload = msg.into_payload().unwrap_or_default();
    origin.write_all(&payload).await?;
    if !early.is_empty() {
        origin.write_all(&early).await?;
    }
    origin.flush().await?;

    let report = relay_response(tls, origin, &PumpOptions::with_idle_timeout(ctx.timeouts.idle), lease.closed()).await;
    debug!(end = ?report.end, down = report.remote_to_client, "http exchange finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certgen::{generate_dev_pki, DevPki};
    use smartvpn_core::{encode_control, Target};
    use smartvpn_transport::{client_config, TlsPolicy};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use tokio_rustls::TlsConnector;

    /// Routes every target to one local address and counts dials.
    struct FixedOrigin {
        addr: SocketAddr,
        dials: AtomicUsize,
    }

    impl OriginConnector for FixedOrigin {
        fn connect<'a>(
            &'a self,
            _target: &'a Target,
        ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let s = TcpStream::connect(self.addr)
                    .await
                    .map_err(|e| ProxyError::Connect(e.to_string()))?;
                Ok(Box::new(s) as BoxedStream)
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pki: DevPki,
        config: RelayConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pki = generate_dev_pki(&["localhost".to_string()]).unwrap();
        pki.write_to(dir.path()).unwrap();
        let config = RelayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cert_path: dir.path().join("server-cert.pem"),
            key_path: dir.path().join("server-key.pem"),
            ca_paths: vec![dir.path().join("ca-cert.pem")],
            tls_policy: TlsPolicy::default(),
            max_connections: 16,
            timeouts: RelayTimeouts {
                origin_connect: Duration::from_millis(500),
                idle: Duration::from_secs(5),
                handshake: Duration::from_secs(5),
                shutdown_grace: Duration::from_secs(2),
                ..RelayTimeouts::default()
            },
        };
        Fixture { _dir: dir, pki, config }
    }

    async fn dial(relay: SocketAddr, pki: &DevPki) -> tokio_rustls::client::TlsStream<TcpStream> {
        let material = TlsMaterial::from_pem(
            Some(pki.client_cert_pem.as_bytes()),
            Some(pki.client_key_pem.as_bytes()),
            &[pki.ca_cert_pem.as_bytes()],
        )
        .unwrap();
        let connector = TlsConnector::from(client_config(material, &TlsPolicy::default()).unwrap());
        let tcp = TcpStream::connect(relay).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        connector.connect(name, tcp).await.unwrap()
    }

    async fn echo_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn connect_is_acknowledged_then_tunneled() {
        let f = fixture();
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin.clone()).await.unwrap();

        let mut tls = dial(relay.local_addr(), &f.pki).await;
        let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
        tls.write_all(&frame).await.unwrap();

        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        tls.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);

        tls.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo me");
        assert_eq!(origin.dials.load(Ordering::SeqCst), 1);
        assert_eq!(relay.status().active_connections, 1);
        let entry = &relay.registry().snapshot()[0];
        assert!(entry.peer_fingerprint.is_some());

        assert!(relay.stop().await);
        assert!(!relay.status().running);
        assert_eq!(relay.status().active_connections, 0);
    }

    #[tokio::test]
    async fn unknown_kind_gets_json_error() {
        let f = fixture();
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin.clone()).await.unwrap();

        let mut tls = dial(relay.local_addr(), &f.pki).await;
        // {"kind": "UDP", "target": "example.com:53"} in CBOR.
        let mut payload = vec![0xa2, 0x64];
        payload.extend_from_slice(b"kind");
        payload.push(0x63);
        payload.extend_from_slice(b"UDP");
        payload.push(0x66);
        payload.extend_from_slice(b"target");
        payload.push(0x6e);
        payload.extend_from_slice(b"example.com:53");
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        tls.write_all(&frame).await.unwrap();

        let mut reply = Vec::new();
        let _ = tls.read_to_end(&mut reply).await;
        let reply = ErrorReply::parse(&reply).unwrap();
        assert!(reply.error.contains("unknown request kind: UDP"));
        assert_eq!(origin.dials.load(Ordering::SeqCst), 0);
        relay.stop().await;
    }

    #[tokio::test]
    async fn http_origin_failure_is_bad_gateway() {
        let f = fixture();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = closed.local_addr().unwrap();
        drop(closed);
        let origin = Arc::new(FixedOrigin {
            addr: dead_addr,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin).await.unwrap();

        let mut tls = dial(relay.local_addr(), &f.pki).await;
        let msg = ControlMessage::http("example.com", b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()).unwrap();
        tls.write_all(&encode_control(&msg).unwrap()).await.unwrap();

        let mut reply = Vec::new();
        let _ = tls.read_to_end(&mut reply).await;
        assert_eq!(reply, BAD_GATEWAY);
        relay.stop().await;
    }

    #[tokio::test]
    async fn http_response_streams_back() {
        let f = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = s.read(&mut buf).await.unwrap();
            let request = buf[..n].to_vec();
            s.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await.unwrap();
            request
        });
        let origin = Arc::new(FixedOrigin {
            addr: origin_addr,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin).await.unwrap();

        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let mut tls = dial(relay.local_addr(), &f.pki).await;
        let msg = ControlMessage::http("example.com", request.clone()).unwrap();
        tls.write_all(&encode_control(&msg).unwrap()).await.unwrap();

        let mut reply = Vec::new();
        let _ = tls.read_to_end(&mut reply).await;
        assert_eq!(reply, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(server.await.unwrap(), request);
        relay.stop().await;
    }

    #[tokio::test]
    async fn connect_timeout_leaves_no_session() {
        struct Blackhole;
        impl OriginConnector for Blackhole {
            fn connect<'a>(
                &'a self,
                _target: &'a Target,
            ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>> {
                Box::pin(std::future::pending())
            }
        }

        let f = fixture();
        let mut relay = RelayServer::start_with(f.config.clone(), Arc::new(Blackhole)).await.unwrap();
        let mut tls = dial(relay.local_addr(), &f.pki).await;
        let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
        tls.write_all(&frame).await.unwrap();

        let mut reply = Vec::new();
        let _ = tls.read_to_end(&mut reply).await;
        let reply = ErrorReply::parse(&reply).unwrap();
        assert!(reply.error.contains("timed out"));

        for _ in 0..50 {
            if relay.registry().count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(relay.registry().count(), 0);
        relay.stop().await;
    }

    #[tokio::test]
    async fn strict_mode_rejects_foreign_client() {
        let f = fixture();
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin.clone()).await.unwrap();

        // Client certificate from another CA; trusts the relay's CA.
        let rogue = generate_dev_pki(&["localhost".to_string()]).unwrap();
        let material = TlsMaterial::from_pem(
            Some(rogue.client_cert_pem.as_bytes()),
            Some(rogue.client_key_pem.as_bytes()),
            &[f.pki.ca_cert_pem.as_bytes()],
        )
        .unwrap();
        let connector = TlsConnector::from(client_config(material, &TlsPolicy::default()).unwrap());
        let tcp = TcpStream::connect(relay.local_addr()).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();

        // TLS 1.3 may finish the client side before the server's verdict
        // arrives; either way no byte of a reply ever comes back.
        if let Ok(mut tls) = connector.connect(name, tcp).await {
            let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
            let _ = tls.write_all(&frame).await;
            let mut buf = Vec::new();
            let _ = tls.read_to_end(&mut buf).await;
            assert!(buf.is_empty());
        }
        assert_eq!(origin.dials.load(Ordering::SeqCst), 0);
        relay.stop().await;
    }

    #[tokio::test]
    async fn compat_mode_serves_anonymous_agent() {
        let mut f = fixture();
        f.config.tls_policy.reject_unauthorized = false;
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin).await.unwrap();

        let material = TlsMaterial::from_pem(None, None, &[f.pki.ca_cert_pem.as_bytes()]).unwrap();
        let connector = TlsConnector::from(client_config(material, &TlsPolicy::default()).unwrap());
        let tcp = TcpStream::connect(relay.local_addr()).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
        tls.write_all(&frame).await.unwrap();
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        tls.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);
        assert!(relay.registry().snapshot()[0].peer_fingerprint.is_none());
        relay.stop().await;
    }

    #[tokio::test]
    async fn compat_mode_serves_agent_with_untrusted_certificate() {
        let mut f = fixture();
        f.config.tls_policy.reject_unauthorized = false;
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin.clone()).await.unwrap();

        let rogue = generate_dev_pki(&["localhost".to_string()]).unwrap();
        let material = TlsMaterial::from_pem(
            Some(rogue.client_cert_pem.as_bytes()),
            Some(rogue.client_key_pem.as_bytes()),
            &[f.pki.ca_cert_pem.as_bytes()],
        )
        .unwrap();
        let connector = TlsConnector::from(client_config(material, &TlsPolicy::default()).unwrap());
        let tcp = TcpStream::connect(relay.local_addr()).await.unwrap();
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
        tls.write_all(&frame).await.unwrap();
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        tls.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, CONNECT_ESTABLISHED);

        tls.write_all(b"still served").await.unwrap();
        let mut buf = [0u8; 12];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still served");
        assert_eq!(origin.dials.load(Ordering::SeqCst), 1);

        // The untrusted certificate is still recorded for the session.
        assert!(relay.registry().snapshot()[0].peer_fingerprint.is_some());
        relay.stop().await;
    }

    #[tokio::test]
    async fn connection_limit_drops_excess() {
        let mut f = fixture();
        f.config.max_connections = 1;
        let origin = Arc::new(FixedOrigin {
            addr: echo_origin().await,
            dials: AtomicUsize::new(0),
        });
        let mut relay = RelayServer::start_with(f.config.clone(), origin).await.unwrap();

        let mut first = dial(relay.local_addr(), &f.pki).await;
        let frame = encode_control(&ControlMessage::connect("example.com:443").unwrap()).unwrap();
        first.write_all(&frame).await.unwrap();
        let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
        first.read_exact(&mut ack).await.unwrap();

        let mut second = TcpStream::connect(relay.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = second.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(relay.registry().count(), 1);
        relay.stop().await;
    }
}
