//! smartvpn-agent: local HTTP proxy with whitelist routing.
//!
//! Point a browser or `HTTP_PROXY` at the listen port. Whitelisted domains
//! (or everything, when whitelist mode is off) go through the relay.
//! SIGHUP re-reads the whitelist from the config file.

use anyhow::Context;
use clap::Parser;
use smartvpn_agent::{AgentConfig, AgentOverrides, AgentServer};
use smartvpn_core::paths::default_path;
use smartvpn_transport::{shutdown_signal, FaultMonitor};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// smartvpn-agent: SmartVPN local proxy
#[derive(Parser, Debug)]
#[command(name = "smartvpn-agent", version, about = "SmartVPN local proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value_t = default_path("agent.toml"))]
    config: String,

    /// Local listen address
    #[arg(long)]
    host: Option<String>,

    /// Local listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Relay host
    #[arg(long)]
    relay_host: Option<String>,

    /// Relay port
    #[arg(long)]
    relay_port: Option<u16>,

    /// Name to verify in the relay certificate
    #[arg(long)]
    server_name: Option<String>,

    /// Agent certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Agent private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle used to verify the relay (repeatable)
    #[arg(long)]
    ca: Vec<String>,

    /// Enable or disable whitelist mode
    #[arg(long)]
    whitelist: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> AgentOverrides {
        AgentOverrides {
            host: self.host.clone(),
            port: self.port,
            relay_host: self.relay_host.clone(),
            relay_port: self.relay_port,
            server_name: self.server_name.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca: self.ca.clone(),
            whitelist_enabled: self.whitelist,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "agent failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = PathBuf::from(&cli.config);
    let overrides = cli.overrides();
    let config = AgentConfig::load(Some(&config_path), &overrides).context("loading config")?;

    info!(version = env!("CARGO_PKG_VERSION"), addr = %config.listen_addr(), "starting smartvpn-agent");

    let faults = FaultMonitor::new();
    faults.install_panic_hook();

    let mut server = AgentServer::start(config).await.context("starting agent")?;

    let code = loop {
        tokio::select! {
            signal = shutdown_signal() => {
                match signal {
                    Ok(name) => info!(signal = name, "shutdown requested"),
                    Err(e) => warn!(error = %e, "cannot listen for signals, shutting down"),
                }
                break 0;
            }
            _ = reload_requested() => {
                match AgentConfig::load(Some(&config_path), &overrides) {
                    Ok(fresh) => {
                        let policy = fresh.whitelist.policy();
                        info!(enabled = policy.enabled, domains = policy.whitelist.len(), "whitelist reloaded");
                        server.routes().reload(policy);
                    }
                    Err(e) => warn!(error = %e, "whitelist reload failed, keeping current list"),
                }
            }
            fault = faults.tripped() => {
                error!(fault = %fault, "stopping after fault");
                break 1;
            }
            _ = server.accept_stopped() => {
                error!("accept loop ended unexpectedly");
                break 1;
            }
        }
    };

    let status = server.status();
    if !server.stop().await {
        warn!("some connections did not finish within the grace period");
    }
    info!(%status, "agent exited");
    Ok(code)
}

/// Resolves on SIGHUP. Never resolves where SIGHUP does not exist.
async fn reload_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut hup) => {
                hup.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await
}
