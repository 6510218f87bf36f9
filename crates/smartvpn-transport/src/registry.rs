//! Registry of live connections.
//!
//! Every accepted connection takes a [`ConnectionLease`]. The lease removes
//! its entry when dropped, so an entry normally exists exactly as long as
//! the task that owns the connection holds it. Connections spawned through
//! [`ConnectionRegistry::spawn_tracked`] also record their task, and
//! [`ConnectionRegistry::sweep`] drops entries whose task has ended while
//! the lease lived on elsewhere. The registry can also ask every holder to
//! close, which is how `stop()` tears down in-flight tunnels.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// What kind of connection an entry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// A proxy client accepted by the agent's ingress listener.
    Client,
    /// An agent session accepted by the relay.
    RelaySession,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Client => f.write_str("client"),
            ConnectionRole::RelaySession => f.write_str("relay-session"),
        }
    }
}

/// Public view of a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub id: u64,
    pub remote: SocketAddr,
    pub role: ConnectionRole,
    pub established_at: Instant,
    /// SHA-256 fingerprint of the peer certificate, when one was presented.
    pub peer_fingerprint: Option<String>,
}

struct Slot {
    entry: ConnectionEntry,
    close: watch::Sender<bool>,
    task: Option<AbortHandle>,
}

impl Slot {
    fn is_stale(&self) -> bool {
        self.close.is_closed() || self.task.as_ref().is_some_and(AbortHandle::is_finished)
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    total: AtomicU64,
    drained: Notify,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        let removed = self.slots().remove(&id).is_some();
        if removed {
            self.drained.notify_waiters();
        }
    }
}

/// Shared handle to the registry. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("active", &self.count())
            .field("total", &self.total())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and hand back the lease that owns it.
    pub fn register(
        &self,
        remote: SocketAddr,
        role: ConnectionRole,
        peer_fingerprint: Option<String>,
    ) -> ConnectionLease {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        let (close, close_rx) = watch::channel(false);
        let entry = ConnectionEntry {
            id,
            remote,
            role,
            established_at: Instant::now(),
            peer_fingerprint,
        };
        self.inner.slots().insert(id, Slot { entry, close, task: None });
        debug!(id, remote = %remote, role = %role, "connection registered");

        ConnectionLease {
            id,
            inner: self.inner.clone(),
            close_rx,
        }
    }

    /// Register a connection and spawn the task that serves it.
    ///
    /// The task owns the lease. The registry keeps the task's handle so a
    /// sweep can drop the entry if the task ends without releasing it.
    pub fn spawn_tracked<F, Fut>(&self, remote: SocketAddr, role: ConnectionRole, serve: F) -> JoinHandle<()>
    where
        F: FnOnce(ConnectionLease) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lease = self.register(remote, role, None);
        let id = lease.id;
        let handle = tokio::spawn(serve(lease));
        if let Some(slot) = self.inner.slots().get_mut(&id) {
            slot.task = Some(handle.abort_handle());
        }
        handle
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.inner.slots().len()
    }

    /// Number of live entries with `role`.
    pub fn count_role(&self, role: ConnectionRole) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|s| s.entry.role == role)
            .count()
    }

    /// Connections registered since creation.
    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Live entries ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        let mut entries: Vec<ConnectionEntry> = self
            .inner
            .slots()
            .values()
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Drop entries whose serving task has finished or whose lease no
    /// longer exists. Returns how many.
    pub fn sweep(&self) -> usize {
        let removed = {
            let mut slots = self.inner.slots();
            let before = slots.len();
            slots.retain(|id, slot| {
                let stale = slot.is_stale();
                if stale {
                    debug!(id, remote = %slot.entry.remote, "dropping stale connection entry");
                }
                !stale
            });
            before - slots.len()
        };
        if removed > 0 {
            self.inner.drained.notify_waiters();
        }
        removed
    }

    /// Ask every lease holder to close its connection.
    pub fn close_all(&self) {
        for slot in self.inner.slots().values() {
            slot.close.send_replace(true);
        }
    }

    /// Close everything and wait up to `grace` for the table to empty.
    ///
    /// Returns `true` when every connection went away in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.close_all();
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            let drained = self.inner.drained.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = drained => {}
                _ = &mut deadline => {
                    self.sweep();
                    return self.count() == 0;
                }
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = registry.sweep();
                if removed > 0 {
                    info!(removed, active = registry.count(), "swept stale connections");
                }
            }
        })
    }
}

/// Ownership of one registry entry.
pub struct ConnectionLease {
    id: u64,
    inner: Arc<Inner>,
    close_rx: watch::Receiver<bool>,
}

impl ConnectionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the registry asks this connection to close.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.close_rx.clone();
        async move {
            let _ = rx.wait_for(|close| *close).await;
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.close_rx.borrow()
    }

    /// Attach the peer certificate fingerprint once the handshake is done.
    pub fn set_peer_fingerprint(&self, fingerprint: String) {
        if let Some(slot) = self.inner.slots().get_mut(&self.id) {
            slot.entry.peer_fingerprint = Some(fingerprint);
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease").field("id", &self.id).finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.inner.remove(self.id);
        debug!(id = self.id, "connection released");
    }
}
