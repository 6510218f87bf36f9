//! Relay configuration: TOML file, then environment, then CLI overrides.

use serde::Deserialize;
use smartvpn_core::paths::default_path;
use smartvpn_core::{expand_tilde, ProxyError, ProxyResult};
use smartvpn_transport::{TlsPolicy, TlsVersion};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

/// `[listen]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `[tls]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    #[serde(default = "default_cert")]
    pub cert: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_ca")]
    pub ca: Vec<String>,
    #[serde(default = "default_min_version")]
    pub min_version: String,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    #[serde(default = "default_true")]
    pub request_cert: bool,
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca: default_ca(),
            min_version: default_min_version(),
            cipher_suites: Vec::new(),
            request_cert: true,
            reject_unauthorized: true,
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

/// `[timeouts]` section, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_origin_connect")]
    pub origin_connect_secs: u64,
    #[serde(default = "default_idle")]
    pub idle_secs: u64,
    #[serde(default = "default_handshake")]
    pub handshake_secs: u64,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_sweep")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stats")]
    pub stats_interval_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            origin_connect_secs: default_origin_connect(),
            idle_secs: default_idle(),
            handshake_secs: default_handshake(),
            shutdown_grace_secs: default_grace(),
            sweep_interval_secs: default_sweep(),
            stats_interval_secs: default_stats(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    443
}
fn default_cert() -> String {
    default_path("server-cert.pem")
}
fn default_key() -> String {
    default_path("server-key.pem")
}
fn default_ca() -> Vec<String> {
    vec![default_path("ca-cert.pem")]
}
fn default_min_version() -> String {
    "1.2".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_connections() -> usize {
    1024
}
fn default_origin_connect() -> u64 {
    10
}
fn default_idle() -> u64 {
    30
}
fn default_handshake() -> u64 {
    30
}
fn default_grace() -> u64 {
    10
}
fn default_sweep() -> u64 {
    30
}
fn default_stats() -> u64 {
    60
}

/// Timeouts and periodic-task intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTimeouts {
    pub origin_connect: Duration,
    pub idle: Duration,
    pub handshake: Duration,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutsSection::default())
    }
}

impl From<&TimeoutsSection> for RelayTimeouts {
    fn from(t: &TimeoutsSection) -> Self {
        Self {
            origin_connect: Duration::from_secs(t.origin_connect_secs),
            idle: Duration::from_secs(t.idle_secs),
            handshake: Duration::from_secs(t.handshake_secs),
            shutdown_grace: Duration::from_secs(t.shutdown_grace_secs),
            sweep_interval: Duration::from_secs(t.sweep_interval_secs.max(1)),
            stats_interval: Duration::from_secs(t.stats_interval_secs.max(1)),
        }
    }
}

/// Values given on the command line; `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct RelayOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Vec<String>,
    pub max_connections: Option<usize>,
}

/// Resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_paths: Vec<PathBuf>,
    pub tls_policy: TlsPolicy,
    pub max_connections: usize,
    pub timeouts: RelayTimeouts,
}

impl RelayConfig {
    /// Load from the process environment.
    pub fn load(config_path: Option<&Path>, overrides: &RelayOverrides) -> ProxyResult<Self> {
        Self::load_with_env(config_path, overrides, |name| std::env::var(name).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with_env(
        config_path: Option<&Path>,
        overrides: &RelayOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> ProxyResult<Self> {
        let file = match config_path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };

        let mut host = file.listen.host;
        let mut port = file.listen.port;

        if let Some(h) = env("SERVER_HOST").filter(|h| !h.trim().is_empty()) {
            host = h.trim().to_string();
        }
        if let Some(p) = env("SERVER_PORT") {
            port = p
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("SERVER_PORT is not a valid port: {p:?}")))?;
        }

        if let Some(h) = &overrides.host {
            host = h.clone();
        }
        let port = overrides.port.unwrap_or(port);
        let cert = overrides.cert.clone().unwrap_or(file.tls.cert);
        let key = overrides.key.clone().unwrap_or(file.tls.key);
        let ca = if overrides.ca.is_empty() {
            file.tls.ca
        } else {
            overrides.ca.clone()
        };
        if ca.is_empty() {
            return Err(ProxyError::Config("at least one CA file is required".into()));
        }

        let tls_policy = TlsPolicy {
            min_version: file.tls.min_version.parse::<TlsVersion>()?,
            cipher_suites: file.tls.cipher_suites,
            request_cert: file.tls.request_cert,
            reject_unauthorized: file.tls.reject_unauthorized,
        };

        let max_connections = overrides
            .max_connections
            .unwrap_or(file.limits.max_connections);
        if max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be at least 1".into()));
        }

        Ok(Self {
            host,
            port,
            cert_path: expand_tilde(&cert),
            key_path: expand_tilde(&key),
            ca_paths: ca.iter().map(expand_tilde).collect(),
            tls_policy,
            max_connections,
            timeouts: RelayTimeouts::from(&file.timeouts),
        })
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn read_config_file(path: &Path) -> ProxyResult<ConfigFile> {
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str(&content).map_err(|e| ProxyError::Config(format!("{}: {e}", expanded.display())))
}
