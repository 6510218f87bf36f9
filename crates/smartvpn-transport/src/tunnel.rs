//! Bidirectional byte pump between two duplex streams.
//!
//! Each direction reads one chunk and writes it fully before reading again,
//! so a slow reader on one side stalls the other side's reads instead of
//! growing a buffer. The first direction to finish tears down both.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

/// Default read chunk (16 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on a write-half shutdown during teardown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Which end of a tunnel an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted connection (browser, or agent as seen by the relay).
    Client,
    /// The far end (origin, or relay as seen by the agent).
    Remote,
}

/// Why a tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEnd {
    /// Orderly EOF from one side.
    Closed(Side),
    /// Read or write error on the stream coming from this side.
    Failed(Side),
    /// No bytes moved in either direction for the idle timeout.
    Idle,
    /// Closed from outside (registry shutdown).
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PumpOptions {
    pub idle_timeout: Option<Duration>,
    pub chunk_size: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PumpOptions {
    pub fn with_idle_timeout(idle: Duration) -> Self {
        Self {
            idle_timeout: Some(idle),
            ..Self::default()
        }
    }
}

/// Outcome of a finished tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelReport {
    pub end: TunnelEnd,
    pub client_to_remote: u64,
    pub remote_to_client: u64,
}

/// Last-activity clock shared by both copy loops.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    counter: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

async fn idle_watch(limit: Option<Duration>, activity: &Activity) {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Read and drop bytes until EOF or error.
async fn discard<R: AsyncRead + Unpin>(reader: &mut R, activity: &Activity) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        if reader.read(&mut buf).await? == 0 {
            return Ok(());
        }
        activity.touch();
    }
}

fn ended(side: Side, result: io::Result<()>) -> TunnelEnd {
    match result {
        Ok(()) => TunnelEnd::Closed(side),
        Err(e) => {
            debug!(?side, error = %e, "tunnel direction failed");
            TunnelEnd::Failed(side)
        }
    }
}

/// Pump bytes both ways between `client` and `remote` until one side
/// closes, errors, idles out, or `cancel` resolves.
///
/// Both write halves are shut down and both streams dropped before
/// returning.
pub async fn pump<C, R, F>(client: C, remote: R, options: &PumpOptions, cancel: F) -> TunnelReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);
    let activity = Activity::new();

    let end = {
        let forward = copy_half(&mut client_read, &mut remote_write, options.chunk_size, &up, &activity);
        let backward = copy_half(&mut remote_read, &mut client_write, options.chunk_size, &down, &activity);
        let idle = idle_watch(options.idle_timeout, &activity);
        tokio::pin!(forward, backward, idle, cancel);

        tokio::select! {
            r = &mut forward => ended(Side::Client, r),
            r = &mut backward => ended(Side::Remote, r),
            _ = &mut idle => TunnelEnd::Idle,
            _ = &mut cancel => TunnelEnd::Cancelled,
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_WAIT, client_write.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_WAIT, remote_write.shutdown()).await;

    TunnelReport {
        end,
        client_to_remote: up.load(Ordering::Relaxed),
        remote_to_client: down.load(Ordering::Relaxed),
    }
}

/// Half-duplex variant: stream `remote` to `client` until the remote closes.
///
/// Bytes arriving from the client are read and discarded only to notice
/// that it went away; a client close ends the transfer early.
pub async fn relay_response<C, R, F>(
    client: C,
    remote: R,
    options: &PumpOptions,
    cancel: F,
) -> TunnelReport
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let down = AtomicU64::new(0);
    let activity = Activity::new();

    let end = {
        let response = copy_half(&mut remote_read, &mut client_write, options.chunk_size, &down, &activity);
        let watch_client = discard(&mut client_read, &activity);
        let idle = idle_watch(options.idle_timeout, &activity);
        tokio::pin!(response, watch_client, idle, cancel);

        tokio::select! {
            r = &mut response => ended(Side::Remote, r),
            r = &mut watch_client => ended(Side::Client, r),
            _ = &mut idle => TunnelEnd::Idle,
            _ = &mut cancel => TunnelEnd::Cancelled,
        }
    };

    let _ = tokio::time::timeout(SHUTDOWN_WAIT, client_write.shutdown()).await;
    let _ = tokio::time::timeout(SHUTDOWN_WAIT, remote_write.shutdown()).await;

    TunnelReport {
        end,
        client_to_remote: 0,
        remote_to_client: down.load(Ordering::Relaxed),
    }
}
