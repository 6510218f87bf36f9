//! End-to-end scenarios: a real relay and agent on loopback, with origins
//! served in-process through injected connectors.

use smartvpn_agent::{AgentConfig, AgentServer, AgentTimeouts, WhitelistSettings};
use smartvpn_core::messages::CONNECT_ESTABLISHED;
use smartvpn_core::{ProxyError, ProxyResult, RoutePolicy, Target, Whitelist};
use smartvpn_relay::{generate_dev_pki, RelayConfig, RelayServer, RelayTimeouts};
use smartvpn_transport::{BoxedStream, OriginConnector, TlsPolicy};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// In-process origins keyed by host name.
///
/// A host mapped to `None` never answers; an unknown host is refused.
#[derive(Default)]
struct Origins {
    hosts: HashMap<String, Option<SocketAddr>>,
    dials: Mutex<Vec<String>>,
}

impl Origins {
    fn with(mut self, host: &str, addr: Option<SocketAddr>) -> Self {
        self.hosts.insert(host.to_string(), addr);
        self
    }

    fn dialed(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }
}

impl OriginConnector for Origins {
    fn connect<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>> {
        self.dials.lock().unwrap().push(target.host().to_string());
        Box::pin(async move {
            match self.hosts.get(target.host()) {
                Some(Some(addr)) => {
                    let s = TcpStream::connect(addr)
                        .await
                        .map_err(|e| ProxyError::Connect(e.to_string()))?;
                    Ok(Box::new(s) as BoxedStream)
                }
                Some(None) => std::future::pending().await,
                None => Err(ProxyError::Connect(format!("{target}: connection refused"))),
            }
        })
    }
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

/// Answers one request with a fixed body, then closes.
async fn http_origin(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = s.write_all(response.as_bytes()).await;
                let _ = s.shutdown().await;
            });
        }
    });
    addr
}

/// Answers every request with `body` and keeps the connection open.
/// Request lines are recorded in arrival order.
async fn keep_alive_origin(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut pending = Vec::new();
                loop {
                    while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head: Vec<u8> = pending.drain(..end + 4).collect();
                        let line = String::from_utf8_lossy(&head).lines().next().unwrap_or_default().to_string();
                        log.lock().unwrap().push(line);
                        let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
                        if s.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    match s.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => pending.extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });
    (addr, seen)
}

struct Pki {
    dir: TempDir,
}

impl Pki {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pki = generate_dev_pki(&["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        pki.write_to(dir.path()).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

fn relay_config(pki: &Pki) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        cert_path: pki.path("server-cert.pem"),
        key_path: pki.path("server-key.pem"),
        ca_paths: vec![pki.path("ca-cert.pem")],
        tls_policy: TlsPolicy::default(),
        max_connections: 64,
        timeouts: RelayTimeouts {
            origin_connect: Duration::from_secs(2),
            idle: Duration::from_secs(10),
            handshake: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            ..RelayTimeouts::default()
        },
    }
}

fn agent_config(pki: &Pki, ca: &Path, relay: SocketAddr, whitelist: WhitelistSettings) -> AgentConfig {
    AgentConfig {
        host: "127.0.0.1".into(),
        port: 0,
        relay_host: relay.ip().to_string(),
        relay_port: relay.port(),
        server_name: "localhost".into(),
        cert_path: Some(pki.path("client-cert.pem")),
        key_path: Some(pki.path("client-key.pem")),
        ca_paths: vec![ca.to_path_buf()],
        tls_policy: TlsPolicy::default(),
        whitelist,
        timeouts: AgentTimeouts {
            relay_connect: Duration::from_secs(5),
            origin_connect: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(2),
            ..AgentTimeouts::default()
        },
    }
}

fn whitelist(domains: &[&str]) -> WhitelistSettings {
    WhitelistSettings {
        enabled: true,
        domains: domains.iter().map(|d| d.to_string()).collect(),
    }
}

struct Stack {
    _pki: Pki,
    relay: RelayServer,
    agent: AgentServer,
    relay_origins: Arc<Origins>,
    agent_origins: Arc<Origins>,
}

impl Stack {
    async fn start(relay_origins: Origins, agent_origins: Origins, settings: WhitelistSettings) -> Self {
        Self::start_with(relay_origins, agent_origins, settings, |_| {}).await
    }

    async fn start_with(
        relay_origins: Origins,
        agent_origins: Origins,
        settings: WhitelistSettings,
        tweak: impl FnOnce(&mut RelayConfig),
    ) -> Self {
        let pki = Pki::new();
        let relay_origins = Arc::new(relay_origins);
        let agent_origins = Arc::new(agent_origins);

        let mut cfg = relay_config(&pki);
        tweak(&mut cfg);
        let relay = RelayServer::start_with(cfg, relay_origins.clone()).await.unwrap();
        let agent = AgentServer::start_with(
            agent_config(&pki, &pki.path("ca-cert.pem"), relay.local_addr(), settings),
            agent_origins.clone(),
        )
        .await
        .unwrap();

        Self {
            _pki: pki,
            relay,
            agent,
            relay_origins,
            agent_origins,
        }
    }

    async fn client(&self) -> TcpStream {
        TcpStream::connect(self.agent.local_addr()).await.unwrap()
    }

    async fn shutdown(mut self) {
        assert!(self.agent.stop().await);
        assert!(self.relay.stop().await);
    }
}

async fn read_ack(client: &mut TcpStream) -> Vec<u8> {
    let mut ack = vec![0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut ack).await.unwrap();
    ack
}

async fn read_all(client: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

/// Read one response framed by `Content-Length`.
async fn read_response(client: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..end]).to_string();
            let len: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + len {
                return String::from_utf8(data).unwrap();
            }
        }
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed mid-response");
        data.extend_from_slice(&buf[..n]);
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// Scenario A: whitelist off, CONNECT goes through the relay and the client
// sees the acknowledgment before any tunnel bytes.
#[tokio::test]
async fn connect_through_relay() {
    let origin = echo_origin().await;
    let stack = Stack::start(
        Origins::default().with("example.com", Some(origin)),
        Origins::default(),
        WhitelistSettings::default(),
    )
    .await;

    let mut client = stack.client().await;
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_ack(&mut client).await, CONNECT_ESTABLISHED);

    client.write_all(b"ping over relay").await.unwrap();
    let mut echoed = [0u8; 15];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping over relay");

    assert_eq!(stack.relay_origins.dialed(), vec!["example.com"]);
    assert!(stack.agent_origins.dialed().is_empty());
    assert_eq!(stack.relay.registry().count(), 1);
    assert_eq!(stack.agent.status().service.active_connections, 1);

    drop(client);
    assert!(wait_until(|| stack.relay.registry().count() == 0).await);
    stack.shutdown().await;
}

// Scenario B: whitelist on, a non-matching domain is dialed directly and
// the relay never sees a session for it.
#[tokio::test]
async fn non_whitelisted_goes_direct() {
    let direct = echo_origin().await;
    let proxied = echo_origin().await;
    let stack = Stack::start(
        Origins::default().with("mail.google.com", Some(proxied)),
        Origins::default().with("evil.com", Some(direct)),
        whitelist(&["google.com", "*.google.com"]),
    )
    .await;

    let mut client = stack.client().await;
    client.write_all(b"CONNECT evil.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    assert_eq!(read_ack(&mut client).await, CONNECT_ESTABLISHED);
    client.write_all(b"direct").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"direct");

    assert_eq!(stack.agent_origins.dialed(), vec!["evil.com"]);
    assert!(stack.relay_origins.dialed().is_empty());
    assert_eq!(stack.relay.registry().total(), 0);

    // A whitelisted subdomain uses the relay.
    let mut client = stack.client().await;
    client.write_all(b"CONNECT mail.google.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    assert_eq!(read_ack(&mut client).await, CONNECT_ESTABLISHED);
    assert_eq!(stack.relay_origins.dialed(), vec!["mail.google.com"]);
    assert_eq!(stack.relay.registry().total(), 1);

    stack.shutdown().await;
}

// Scenario C: the agent trusts a different CA, so the relay handshake fails
// and the client is closed without a reply.
#[tokio::test]
async fn untrusted_relay_closes_client() {
    let pki = Pki::new();
    let rogue = Pki::new();
    let relay_origins = Arc::new(Origins::default().with("example.com", Some(echo_origin().await)));
    let mut relay = RelayServer::start_with(relay_config(&pki), relay_origins.clone())
        .await
        .unwrap();

    let mut config = agent_config(&pki, &rogue.path("ca-cert.pem"), relay.local_addr(), WhitelistSettings::default());
    config.cert_path = Some(rogue.path("client-cert.pem"));
    config.key_path = Some(rogue.path("client-key.pem"));
    let mut agent = AgentServer::start_with(config, Arc::new(Origins::default()))
        .await
        .unwrap();

    let mut client = TcpStream::connect(agent.local_addr()).await.unwrap();
    client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_all(&mut client).await.is_empty());
    assert!(relay_origins.dialed().is_empty());

    assert!(wait_until(|| agent.registry().count() == 0 && relay.registry().count() == 0).await);
    assert!(agent.stop().await);
    assert!(relay.stop().await);
}

// Scenario D: the relay's origin dial times out; the client is closed and
// no connection stays registered on either side.
#[tokio::test]
async fn origin_timeout_cleans_up() {
    let stack = Stack::start_with(
        Origins::default().with("slow.example", None),
        Origins::default(),
        WhitelistSettings::default(),
        |cfg| cfg.timeouts.origin_connect = Duration::from_millis(200),
    )
    .await;

    let mut client = stack.client().await;
    client.write_all(b"CONNECT slow.example:443 HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_all(&mut client).await.is_empty());
    assert_eq!(stack.relay_origins.dialed(), vec!["slow.example"]);

    assert!(wait_until(|| stack.agent.registry().count() == 0 && stack.relay.registry().count() == 0).await);
    stack.shutdown().await;
}

// Scenario E: a request without Host is refused before anything is dialed.
#[tokio::test]
async fn missing_host_is_refused() {
    let stack = Stack::start(Origins::default(), Origins::default(), WhitelistSettings::default()).await;

    let mut client = stack.client().await;
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(read_all(&mut client).await.is_empty());

    assert!(stack.agent_origins.dialed().is_empty());
    assert!(stack.relay_origins.dialed().is_empty());
    assert_eq!(stack.relay.registry().total(), 0);
    stack.shutdown().await;
}

#[tokio::test]
async fn byte_by_byte_connect_dispatches_once() {
    let origin = echo_origin().await;
    let stack = Stack::start(
        Origins::default().with("example.com", Some(origin)),
        Origins::default(),
        WhitelistSettings::default(),
    )
    .await;

    let mut client = stack.client().await;
    client.set_nodelay(true).unwrap();
    for byte in b"CONNECT example.com:443 HTTP/1.1\r\n\r\n" {
        client.write_all(&[*byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(read_ack(&mut client).await, CONNECT_ESTABLISHED);
    assert_eq!(stack.relay_origins.dialed(), vec!["example.com"]);
    assert_eq!(stack.relay.registry().total(), 1);
    stack.shutdown().await;
}

#[tokio::test]
async fn http_through_relay_and_direct() {
    let relayed = http_origin("via relay").await;
    let direct = http_origin("direct").await;
    let stack = Stack::start(
        Origins::default().with("proxied.example", Some(relayed)),
        Origins::default().with("plain.example", Some(direct)),
        whitelist(&["proxied.example"]),
    )
    .await;

    let mut client = stack.client().await;
    client
        .write_all(b"GET http://proxied.example/ HTTP/1.1\r\nHost: proxied.example\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_all(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("via relay"));

    let mut client = stack.client().await;
    client
        .write_all(b"GET http://plain.example/ HTTP/1.1\r\nHost: plain.example:80\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_all(&mut client).await).unwrap();
    assert!(response.ends_with("direct"), "{response}");

    assert_eq!(stack.relay_origins.dialed(), vec!["proxied.example"]);
    assert_eq!(stack.agent_origins.dialed(), vec!["plain.example"]);
    stack.shutdown().await;
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let stack = Stack::start(Origins::default(), Origins::default(), whitelist(&["relayed.example"])).await;

    // Direct path.
    let mut client = stack.client().await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.example:80\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_all(&mut client).await, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");

    // Relay path: the relay answers 502 itself.
    let mut client = stack.client().await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: relayed.example:80\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_all(&mut client).await, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    stack.shutdown().await;
}

#[tokio::test]
async fn whitelist_reload_changes_routing() {
    let origin = echo_origin().await;
    let stack = Stack::start(
        Origins::default().with("example.com", Some(origin)),
        Origins::default().with("example.com", Some(origin)),
        whitelist(&[]),
    )
    .await;

    let mut client = stack.client().await;
    client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    read_ack(&mut client).await;
    assert_eq!(stack.agent_origins.dialed().len(), 1);
    assert!(stack.relay_origins.dialed().is_empty());

    stack
        .agent
        .routes()
        .reload(RoutePolicy::new(true, Whitelist::parse_list("example.com")));
    let mut client = stack.client().await;
    client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    read_ack(&mut client).await;
    assert_eq!(stack.relay_origins.dialed().len(), 1);

    stack.agent.routes().set_enabled(false);
    assert!(!stack.agent.status().whitelist_enabled);
    stack.shutdown().await;
}

#[tokio::test]
async fn stop_closes_live_tunnels() {
    let origin = echo_origin().await;
    let mut stack = Stack::start(
        Origins::default().with("example.com", Some(origin)),
        Origins::default(),
        WhitelistSettings::default(),
    )
    .await;

    let mut client = stack.client().await;
    client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
    read_ack(&mut client).await;

    assert!(stack.agent.stop().await);
    assert!(!stack.agent.status().service.running);
    assert_eq!(stack.agent.status().service.active_connections, 0);
    assert!(read_all(&mut client).await.is_empty());
    // Idempotent.
    assert!(stack.agent.stop().await);
    assert!(TcpStream::connect(stack.agent.local_addr()).await.is_err());
    stack.shutdown().await;
}

#[tokio::test]
async fn keep_alive_requests_are_routed_one_by_one() {
    let (direct, direct_seen) = keep_alive_origin("plain").await;
    let (relayed, relayed_seen) = keep_alive_origin("relayed").await;
    let stack = Stack::start(
        Origins::default().with("proxied.example", Some(relayed)),
        Origins::default().with("plain.example", Some(direct)),
        whitelist(&["proxied.example"]),
    )
    .await;
    let within = Duration::from_secs(5);

    let mut client = stack.client().await;
    client
        .write_all(b"GET http://plain.example/one HTTP/1.1\r\nHost: plain.example\r\n\r\n")
        .await
        .unwrap();
    let first = tokio::time::timeout(within, read_response(&mut client)).await.unwrap();
    assert!(first.starts_with("HTTP/1.1 200 OK") && first.ends_with("plain"), "{first}");

    client
        .write_all(b"GET http://plain.example/two HTTP/1.1\r\nHost: plain.example\r\n\r\n")
        .await
        .unwrap();
    let second = tokio::time::timeout(within, read_response(&mut client)).await.unwrap();
    assert!(second.ends_with("plain"), "{second}");
    assert_eq!(
        *direct_seen.lock().unwrap(),
        vec!["GET http://plain.example/one HTTP/1.1", "GET http://plain.example/two HTTP/1.1"]
    );
    // Same origin, same connection.
    assert_eq!(stack.agent_origins.dialed(), vec!["plain.example"]);

    // A follow-up for a whitelisted host switches to the relay.
    client
        .write_all(b"GET http://proxied.example/three HTTP/1.1\r\nHost: proxied.example\r\n\r\n")
        .await
        .unwrap();
    let third = tokio::time::timeout(within, read_response(&mut client)).await.unwrap();
    assert!(third.ends_with("relayed"), "{third}");
    assert_eq!(*relayed_seen.lock().unwrap(), vec!["GET http://proxied.example/three HTTP/1.1"]);
    assert_eq!(stack.relay_origins.dialed(), vec!["proxied.example"]);
    assert_eq!(direct_seen.lock().unwrap().len(), 2);

    drop(client);
    stack.shutdown().await;
}
