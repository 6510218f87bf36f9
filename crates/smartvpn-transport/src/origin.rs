//! Dialing origin servers.
//!
//! Both processes reach origins through the [`OriginConnector`] trait so the
//! end-to-end tests can substitute an in-process origin for real DNS.

use smartvpn_core::{ProxyError, ProxyResult, Target};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Any duplex byte stream an origin connection can be.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased origin connection.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens connections to origin servers.
pub trait OriginConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>>;
}

/// Plain TCP dialer with `TCP_NODELAY` set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpOriginConnector;

impl OriginConnector for TcpOriginConnector {
    fn connect<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>> {
        Box::pin(async move {
            let stream = TcpStream::connect((target.host(), target.port()))
                .await
                .map_err(|e| ProxyError::Connect(format!("{target}: {e}")))?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(target = %target, error = %e, "could not set TCP_NODELAY");
            }
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Dial `target` through `connector`, giving up after `limit`.
pub async fn connect_with_timeout(
    connector: &dyn OriginConnector,
    target: &Target,
    limit: Duration,
) -> ProxyResult<BoxedStream> {
    match tokio::time::timeout(limit, connector.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout {
            stage: "origin connect",
            after: limit,
        }),
    }
}

/// Wrap an origin connection in TLS, verifying against the public web PKI.
pub async fn upgrade_to_tls(stream: BoxedStream, host: &str) -> ProxyResult<TlsStream<BoxedStream>> {
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("invalid server name {host:?}: {e}")))?;
    let connector = TlsConnector::from(web_pki_config()?);
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProxyError::Connect(format!("TLS handshake with {host} failed: {e}")))
}

fn web_pki_config() -> ProxyResult<Arc<rustls::ClientConfig>> {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let mut stream = TcpOriginConnector
            .connect(&Target::new("127.0.0.1", port))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpOriginConnector
            .connect(&Target::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Connect(_)));
    }

    struct NeverConnects;

    impl OriginConnector for NeverConnects {
        fn connect<'a>(
            &'a self,
            _target: &'a Target,
        ) -> Pin<Box<dyn Future<Output = ProxyResult<BoxedStream>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dial_times_out() {
        let err = connect_with_timeout(&NeverConnects, &Target::new("example.com", 443), Duration::from_secs(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Timeout { stage: "origin connect", .. }));
        assert!(err.is_upstream_failure());
    }

    #[test]
    fn web_pki_config_builds() {
        let config = web_pki_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
