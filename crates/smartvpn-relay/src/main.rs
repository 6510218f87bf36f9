//! smartvpn-relay: remote egress for SmartVPN agents.
//!
//! Accepts mutual-TLS sessions from agents and dials origins on their
//! behalf. `--generate-certs <dir>` writes a development PKI and exits.

use anyhow::Context;
use clap::Parser;
use smartvpn_core::paths::default_path;
use smartvpn_relay::{generate_dev_pki, RelayConfig, RelayOverrides, RelayServer};
use smartvpn_transport::{shutdown_signal, FaultMonitor};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// smartvpn-relay: SmartVPN relay server
#[derive(Parser, Debug)]
#[command(name = "smartvpn-relay", version, about = "SmartVPN relay server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value_t = default_path("relay.toml"))]
    config: String,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Relay certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Relay private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// CA bundle used to verify agent certificates (repeatable)
    #[arg(long)]
    ca: Vec<String>,

    /// Maximum concurrent agent sessions
    #[arg(long)]
    max_connections: Option<usize>,

    /// Write a development CA, relay and agent certificate into DIR and exit
    #[arg(long, value_name = "DIR")]
    generate_certs: Option<String>,

    /// Name the generated relay certificate is valid for (repeatable)
    #[arg(long, default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()])]
    server_name: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
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
            error!(error = %format!("{e:#}"), "relay failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Some(dir) = &cli.generate_certs {
        let dir = smartvpn_core::expand_tilde(dir);
        let pki = generate_dev_pki(&cli.server_name).context("generating development certificates")?;
        for path in pki.write_to(&dir).context("writing certificates")? {
            info!(path = %path.display(), "wrote");
        }
        return Ok(0);
    }

    let overrides = RelayOverrides {
        host: cli.host,
        port: cli.port,
        cert: cli.cert,
        key: cli.key,
        ca: cli.ca,
        max_connections: cli.max_connections,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = RelayConfig::load(Some(&config_path), &overrides).context("loading config")?;

    info!(version = env!("CARGO_PKG_VERSION"), addr = %config.listen_addr(), "starting smartvpn-relay");

    let faults = FaultMonitor::new();
    faults.install_panic_hook();

    let mut server = RelayServer::start(config).await.context("starting relay")?;

    let code = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "shutdown requested"),
                Err(e) => warn!(error = %e, "cannot listen for signals, shutting down"),
            }
            0
        }
        fault = faults.tripped() => {
            error!(fault = %fault, "stopping after fault");
            1
        }
        _ = server.accept_stopped() => {
            error!("accept loop ended unexpectedly");
            1
        }
    };

    let status = server.status();
    if !server.stop().await {
        warn!("some sessions did not finish within the grace period");
    }
    info!(%status, "relay exited");
    Ok(code)
}
