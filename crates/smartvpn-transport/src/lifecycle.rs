//! Service status, fault monitoring and OS shutdown signals.

use crate::registry::ConnectionRegistry;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::error;

/// Point-in-time view of a running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    pub active_connections: usize,
    pub total_connections: u64,
    pub uptime: Duration,
}

impl ServiceStatus {
    pub fn collect(running: bool, registry: &ConnectionRegistry, started: Instant) -> Self {
        Self {
            running,
            active_connections: registry.count(),
            total_connections: registry.total(),
            uptime: if running { started.elapsed() } else { Duration::ZERO },
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running={} active={} total={} uptime={}s",
            self.running,
            self.active_connections,
            self.total_connections,
            self.uptime.as_secs()
        )
    }
}

/// Turns unexpected faults into a graceful shutdown request.
///
/// Once [`install_panic_hook`](Self::install_panic_hook) is called, any
/// panic on any thread is logged and trips the monitor. The binaries
/// select on [`tripped`](Self::tripped) next to the shutdown signal.
#[derive(Clone)]
pub struct FaultMonitor {
    tx: Arc<watch::Sender<Option<String>>>,
    rx: watch::Receiver<Option<String>>,
}

impl Default for FaultMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultMonitor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx: Arc::new(tx), rx }
    }

    /// Route panics into this monitor, keeping the previous hook's output.
    pub fn install_panic_hook(&self) {
        let tx = self.tx.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            error!(fault = %message, location = %location, "unexpected fault, shutting down");
            trip(&tx, message);
            previous(info);
        }));
    }

    /// Record a fault by hand (an accept loop that died, for instance).
    pub fn report(&self, reason: impl Into<String>) {
        trip(&self.tx, reason.into());
    }

    /// The first fault seen, if any.
    pub fn fault(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Wait for a fault and return its description.
    pub async fn tripped(&self) -> String {
        let mut rx = self.rx.clone();
        let fault = rx
            .wait_for(Option::is_some)
            .await
            .map(|fault| fault.clone().unwrap_or_default());
        match fault {
            Ok(fault) => fault,
            // The sender lives as long as `self`.
            Err(_) => std::future::pending().await,
        }
    }
}

/// Keep the first fault; later ones are only logged.
fn trip(tx: &watch::Sender<Option<String>>, fault: String) {
    tx.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(fault);
        true
    });
}

/// Wait for SIGINT (Ctrl+C), SIGTERM or SIGQUIT and return its name.
pub async fn shutdown_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
            _ = sigquit.recv() => Ok("SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "SIGINT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRole;

    #[tokio::test]
    async fn report_trips_monitor() {
        let monitor = FaultMonitor::new();
        assert_eq!(monitor.fault(), None);

        let waiter = monitor.clone();
        let task = tokio::spawn(async move { waiter.tripped().await });
        monitor.report("accept loop died");
        assert_eq!(task.await.unwrap(), "accept loop died");
        assert_eq!(monitor.fault().as_deref(), Some("accept loop died"));
    }

    #[tokio::test]
    async fn panic_in_spawned_task_trips_monitor() {
        let monitor = FaultMonitor::new();
        monitor.install_panic_hook();

        let task = tokio::spawn(async { panic!("connection task blew up") });
        assert!(task.await.unwrap_err().is_panic());

        let fault = tokio::time::timeout(Duration::from_secs(5), monitor.tripped())
            .await
            .unwrap();
        assert_eq!(fault, "connection task blew up");

        monitor.report("second fault");
        assert_eq!(monitor.fault().as_deref(), Some("connection task blew up"));
    }

    #[test]
    fn status_reflects_registry() {
        let registry = ConnectionRegistry::new();
        let _lease = registry.register("127.0.0.1:1".parse().unwrap(), ConnectionRole::Client, None);
        let status = ServiceStatus::collect(true, &registry, Instant::now());
        assert!(status.running);
        assert_eq!(status.active_connections, 1);
        assert_eq!(status.total_connections, 1);

        let stopped = ServiceStatus::collect(false, &registry, Instant::now());
        assert_eq!(stopped.uptime, Duration::ZERO);
        assert!(stopped.to_string().starts_with("running=false active=1"));
    }
}
