//! Local ingress listener.
//!
//! Each accepted client is handled by one task:
//!
//! 1. Buffer bytes until a complete request head (and declared body).
//! 2. Resolve the target and ask the route policy.
//! 3. Go direct (dial the origin) or proxied (open a relay session).
//! 4. CONNECT: pump bytes both ways until either side closes.
//!    Plain HTTP: stream the response back while parsing the client's next
//!    request, which is routed on its own.

use crate::config::{AgentConfig, AgentTimeouts};
use crate::connector::RelayConnector;
use smartvpn_core::messages::{BAD_GATEWAY, CONNECT_ESTABLISHED};
use smartvpn_core::{ParsedRequest, ProxyError, ProxyResult, RequestAccumulator, Scheme, SharedRoutePolicy, Target};
use smartvpn_transport::tunnel::DEFAULT_CHUNK_SIZE;
use smartvpn_transport::{
    connect_with_timeout, pump, upgrade_to_tls, BoxedStream, ConnectionLease, ConnectionRegistry, ConnectionRole,
    OriginConnector, PumpOptions, ServiceStatus, TcpOriginConnector,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Agent status: the service view plus routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub service: ServiceStatus,
    pub whitelist_enabled: bool,
    pub local_port: u16,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} whitelist={} port={}",
            self.service, self.whitelist_enabled, self.local_port
        )
    }
}

struct ClientContext {
    routes: SharedRoutePolicy,
    relay: RelayConnector,
    origin: Arc<dyn OriginConnector>,
    timeouts: AgentTimeouts,
}

/// A running agent.
pub struct AgentServer {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    routes: SharedRoutePolicy,
    started: Instant,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    accepting: watch::Receiver<bool>,
    accept_task: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl AgentServer {
    /// Bind and start accepting with the real TCP origin connector.
    pub async fn start(config: AgentConfig) -> ProxyResult<Self> {
        Self::start_with(config, Arc::new(TcpOriginConnector)).await
    }

    /// Bind and start accepting, dialing direct origins through `origin`.
    pub async fn start_with(config: AgentConfig, origin: Arc<dyn OriginConnector>) -> ProxyResult<Self> {
        let relay = RelayConnector::from_config(&config)?;
        let routes = SharedRoutePolicy::new(config.whitelist.policy());

        let listen = config.listen_addr();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|e| ProxyError::Config(format!("cannot bind {listen}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let registry = ConnectionRegistry::new();
        let ctx = Arc::new(ClientContext {
            routes: routes.clone(),
            relay,
            origin,
            timeouts: config.timeouts.clone(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let (accepting_tx, accepting) = watch::channel(true);
        let accept_task = tokio::spawn(accept_loop(listener, ctx, registry.clone(), stop_rx, accepting_tx));
        let sweeper = registry.spawn_sweeper(config.timeouts.sweep_interval);

        let policy = routes.snapshot();
        info!(
            addr = %local_addr,
            relay = %config.relay_addr(),
            whitelist = policy.enabled,
            domains = policy.whitelist.len(),
            "agent listening"
        );

        Ok(Self {
            local_addr,
            registry,
            routes,
            started: Instant::now(),
            running: Arc::new(AtomicBool::new(true)),
            stop_tx,
            accepting,
            accept_task: Some(accept_task),
            sweeper: Some(sweeper),
            shutdown_grace: config.timeouts.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Handle to the live route policy; updates apply to new requests.
    pub fn routes(&self) -> &SharedRoutePolicy {
        &self.routes
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            service: ServiceStatus::collect(self.running.load(Ordering::Relaxed), &self.registry, self.started),
            whitelist_enabled: self.routes.snapshot().enabled,
            local_port: self.local_addr.port(),
        }
    }

    /// Resolves if the accept loop ends without `stop()` being called.
    pub async fn accept_stopped(&self) {
        let mut rx = self.accepting.clone();
        let _ = rx.wait_for(|accepting| !*accepting).await;
    }

    /// Stop accepting, close tracked clients, wait for the grace period.
    pub async fn stop(&mut self) -> bool {
        if !self.running.swap(false, Ordering::Relaxed) {
            return true;
        }
        info!(active = self.registry.count(), "agent stopping");
        self.stop_tx.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }

        let clean = self.registry.shutdown(self.shutdown_grace).await;
        if !clean {
            warn!(remaining = self.registry.count(), "agent stopped with connections still open");
        } else {
            info!("agent stopped");
        }
        clean
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        self.registry.close_all();
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
    }
}

struct AcceptingGuard(watch::Sender<bool>);

impl Drop for AcceptingGuard {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ClientContext>,
    registry: ConnectionRegistry,
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

        let ctx = ctx.clone();
        registry.spawn_tracked(remote, ConnectionRole::Client, move |lease| async move {
            let closed = lease.closed();
            tokio::select! {
                result = handle_client(&ctx, tcp, remote, &lease) => {
                    if let Err(e) = result {
                        debug!(remote = %remote, kind = e.kind(), error = %e, "client connection ended with error");
                    }
                }
                _ = closed => debug!(remote = %remote, "client closed by shutdown"),
            }
            drop(lease);
        });
    }
    debug!("accept loop finished");
}

async fn read_request(tcp: &mut TcpStream, pending: &mut RequestAccumulator) -> ProxyResult<Option<ParsedRequest>> {
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let n = tcp.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(request) = pending.push(&buf[..n])? {
            return Ok(Some(request));
        }
    }
}

/// Resolve where a request goes and log the decision.
fn route(ctx: &ClientContext, remote: SocketAddr, request: &ParsedRequest) -> ProxyResult<(Target, bool)> {
    let target = match request.head.route_target() {
        Ok(target) => target,
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting client request");
            return Err(e);
        }
    };
    let proxied = ctx.routes.should_proxy(target.host());
    info!(
        remote = %remote,
        method = %request.head.method,
        target = %target,
        route = if proxied { "relay" } else { "direct" },
        "routing request"
    );
    Ok((target, proxied))
}

async fn handle_client(
    ctx: &ClientContext,
    mut tcp: TcpStream,
    remote: SocketAddr,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    let _ = tcp.set_nodelay(true);
    let mut pending = RequestAccumulator::new();
    let mut request = match read_request(&mut tcp, &mut pending).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!(remote = %remote, "client closed before a full request");
            return Ok(());
        }
        Err(e) => {
            warn!(remote = %remote, error = %e, "rejecting client request");
            return Err(e);
        }
    };

    // Plain HTTP requests on one connection are routed one by one. A CONNECT
    // turns the rest of the connection into a tunnel.
    let mut upstream: Option<Upstream> = None;
    loop {
        let (target, proxied) = route(ctx, remote, &request)?;
        if request.head.is_connect() {
            drop(upstream.take());
            let leftover = pending.take_remaining();
            return if proxied {
                proxied_connect(ctx, tcp, &target, leftover, lease).await
            } else {
                direct_connect(ctx, tcp, &target, leftover, lease).await
            };
        }

        let mut exchange = match send_request(ctx, target, proxied, request, upstream.take()).await {
            Ok(exchange) => exchange,
            Err(e) => return bad_gateway(tcp, e).await,
        };
        request = match stream_response(&mut tcp, &mut exchange, &mut pending).await? {
            Some(next) => next,
            None => return Ok(()),
        };
        upstream = Some(exchange);
    }
}

async fn direct_connect(
    ctx: &ClientContext,
    mut tcp: TcpStream,
    target: &Target,
    leftover: Vec<u8>,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    let mut origin = connect_with_timeout(ctx.origin.as_ref(), target, ctx.timeouts.origin_connect).await?;
    tcp.write_all(CONNECT_ESTABLISHED).await?;
    if !leftover.is_empty() {
        origin.write_all(&leftover).await?;
    }
    let report = pump(tcp, origin, &PumpOptions::default(), lease.closed()).await;
    debug!(target = %target, end = ?report.end, up = report.client_to_remote, down = report.remote_to_client, "direct tunnel closed");
    Ok(())
}

async fn proxied_connect(
    ctx: &ClientContext,
    mut tcp: TcpStream,
    target: &Target,
    leftover: Vec<u8>,
    lease: &ConnectionLease,
) -> ProxyResult<()> {
    let (mut relay, early) = match ctx.relay.open_tunnel(target).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(target = %target, kind = e.kind(), error = %e, "relay tunnel failed");
            return Err(e);
        }
    };
    tcp.write_all(CONNECT_ESTABLISHED).await?;
    if !early.is_empty() {
        tcp.write_all(&early).await?;
    }
    if !leftover.is_empty() {
        relay.write_all(&leftover).await?;
    }
    let report = pump(tcp, relay, &PumpOptions::default(), lease.closed()).await;
    debug!(target = %target, end = ?report.end, up = report.client_to_remote, down = report.remote_to_client, "relay tunnel closed");
    Ok(())
}

/// Upstream of one plain HTTP exchange.
struct Upstream {
    target: Target,
    proxied: bool,
    https: bool,
    stream: BoxedStream,
    delivered: u64,
}

impl Upstream {
    /// A direct origin connection can carry the client's next request to
    /// the same place. Relay sessions carry exactly one.
    fn reusable_for(&self, target: &Target, proxied: bool, https: bool) -> bool {
        !self.proxied && !proxied && self.https == https && self.target == *target
    }
}

/// Deliver one request upstream, reusing `previous` when it fits.
async fn send_request(
    ctx: &ClientContext,
    target: Target,
    proxied: bool,
    request: ParsedRequest,
    previous: Option<Upstream>,
) -> ProxyResult<Upstream> {
    if proxied {
        drop(previous);
        let relay = match ctx.relay.forward_http(&target, request.raw).await {
            Ok(relay) => relay,
            Err(e) => {
                warn!(target = %target, kind = e.kind(), error = %e, "relay request failed");
                return Err(e);
            }
        };
        return Ok(Upstream {
            target,
            proxied,
            https: false,
            stream: Box::new(relay),
            delivered: 0,
        });
    }

    let https = request.head.effective_scheme(&target) == Scheme::Https;
    let mut upstream = match previous {
        Some(previous) if previous.reusable_for(&target, proxied, https) => {
            debug!(target = %target, "reusing origin connection");
            Upstream { delivered: 0, ..previous }
        }
        _ => {
            let origin = connect_with_timeout(ctx.origin.as_ref(), &target, ctx.timeouts.origin_connect).await?;
            let stream = if https {
                Box::new(upgrade_to_tls(origin, target.host()).await?) as BoxedStream
            } else {
                origin
            };
            Upstream {
                target,
                proxied,
                https,
                stream,
                delivered: 0,
            }
        }
    };
    upstream.stream.write_all(&request.raw).await?;
    upstream.stream.flush().await?;
    Ok(upstream)
}

/// Stream the upstream response to the client while reading what the
/// client sends next.
///
/// Returns the client's next complete request, or `None` once either side
/// has closed. An upstream close ends the client connection too, since the
/// response may be delimited by that close.
async fn stream_response(
    tcp: &mut TcpStream,
    exchange: &mut Upstream,
    pending: &mut RequestAccumulator,
) -> ProxyResult<Option<ParsedRequest>> {
    let mut down = vec![0u8; DEFAULT_CHUNK_SIZE];
    let mut up = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        if let Some(next) = pending.next_request()? {
            return Ok(Some(next));
        }
        tokio::select! {
            read = exchange.stream.read(&mut down) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(target = %exchange.target, error = %e, "upstream read failed");
                        0
                    }
                };
                if n == 0 {
                    debug!(target = %exchange.target, down = exchange.delivered, "upstream closed");
                    let _ = tcp.shutdown().await;
                    return Ok(None);
                }
                tcp.write_all(&down[..n]).await?;
                exchange.delivered += n as u64;
            }
            read = tcp.read(&mut up) => {
                let n = read?;
                if n == 0 {
                    debug!(target = %exchange.target, down = exchange.delivered, "client closed");
                    return Ok(None);
                }
                if let Some(next) = pending.push(&up[..n])? {
                    return Ok(Some(next));
                }
            }
        }
    }
}

/// Tell the client the origin is unreachable, then close.
async fn bad_gateway(mut tcp: TcpStream, cause: ProxyError) -> ProxyResult<()> {
    let _ = tcp.write_all(BAD_GATEWAY).await;
    let _ = tcp.shutdown().await;
    Err(cause)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_includes_routing() {
        let registry = ConnectionRegistry::new();
        let status = AgentStatus {
            service: ServiceStatus::collect(true, &registry, Instant::now()),
            whitelist_enabled: true,
            local_port: 8080,
        };
        let text = status.to_string();
        assert!(text.starts_with("running=true active=0 total=0"));
        assert!(text.ends_with("whitelist=true port=8080"));
    }
}
