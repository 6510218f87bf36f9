//! Agent configuration at `~/.smartvpn/agent.toml`.
//!
//! Resolution order: file (and its optional standalone whitelist file),
//! then environment, then command-line flags.

use serde::Deserialize;
use smartvpn_core::paths::default_path;
use smartvpn_core::{expand_tilde, ProxyError, ProxyResult, RoutePolicy, Whitelist};
use smartvpn_transport::{TlsPolicy, TlsVersion};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub whitelist: WhitelistSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

/// `[local]`: where proxy clients connect.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalSection {
    #[serde(default = "default_local_host")]
    pub host: String,
    #[serde(default = "default_local_port")]
    pub port: u16,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            host: default_local_host(),
            port: default_local_port(),
        }
    }
}

/// `[relay]`: the remote egress server.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Name to verify in the relay certificate; defaults to `host`.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            server_name: None,
        }
    }
}

/// `[tls]`: agent identity and trust. An empty `cert` connects without a
/// client certificate.
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
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca: default_ca(),
            min_version: default_min_version(),
            cipher_suites: Vec::new(),
        }
    }
}

/// `[whitelist]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhitelistSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Standalone whitelist file; overrides the inline values when present.
    #[serde(default)]
    pub file: Option<String>,
}

/// Contents of a standalone whitelist file.
#[derive(Debug, Clone, Default, Deserialize)]
struct WhitelistFile {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    domains: Option<Vec<String>>,
}

/// `[timeouts]`, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_relay_connect")]
    pub relay_connect_secs: u64,
    #[serde(default = "default_origin_connect")]
    pub origin_connect_secs: u64,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            relay_connect_secs: default_relay_connect(),
            origin_connect_secs: default_origin_connect(),
            shutdown_grace_secs: default_grace(),
            sweep_interval_secs: default_sweep(),
        }
    }
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    8080
}
fn default_relay_host() -> String {
    "localhost".to_string()
}
fn default_relay_port() -> u16 {
    443
}
fn default_cert() -> String {
    default_path("client-cert.pem")
}
fn default_key() -> String {
    default_path("client-key.pem")
}
fn default_ca() -> Vec<String> {
    vec![default_path("ca-cert.pem")]
}
fn default_min_version() -> String {
    "1.2".to_string()
}
fn default_relay_connect() -> u64 {
    30
}
fn default_origin_connect() -> u64 {
    10
}
fn default_grace() -> u64 {
    10
}
fn default_sweep() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTimeouts {
    /// TCP connect plus TLS handshake (plus the CONNECT ack) to the relay.
    pub relay_connect: Duration,
    pub origin_connect: Duration,
    pub shutdown_grace: Duration,
    pub sweep_interval: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutsSection::default())
    }
}

impl From<&TimeoutsSection> for AgentTimeouts {
    fn from(t: &TimeoutsSection) -> Self {
        Self {
            relay_connect: Duration::from_secs(t.relay_connect_secs),
            origin_connect: Duration::from_secs(t.origin_connect_secs),
            shutdown_grace: Duration::from_secs(t.shutdown_grace_secs),
            sweep_interval: Duration::from_secs(t.sweep_interval_secs.max(1)),
        }
    }
}

/// Resolved whitelist mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistSettings {
    pub enabled: bool,
    pub domains: Vec<String>,
}

impl WhitelistSettings {
    pub fn policy(&self) -> RoutePolicy {
        RoutePolicy::new(self.enabled, Whitelist::new(&self.domains))
    }
}

/// Values given on the command line; `None` keeps the file/env value.
#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub relay_host: Option<String>,
    pub relay_port: Option<u16>,
    pub server_name: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Vec<String>,
    pub whitelist_enabled: Option<bool>,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub relay_host: String,
    pub relay_port: u16,
    pub server_name: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_paths: Vec<PathBuf>,
    pub tls_policy: TlsPolicy,
    pub whitelist: WhitelistSettings,
    pub timeouts: AgentTimeouts,
}

impl AgentConfig {
    /// Load from the process environment.
    pub fn load(config_path: Option<&Path>, overrides: &AgentOverrides) -> ProxyResult<Self> {
        Self::load_with_env(config_path, overrides, |name| std::env::var(name).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with_env(
        config_path: Option<&Path>,
        overrides: &AgentOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> ProxyResult<Self> {
        let file = match config_path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };

        let mut port = file.local.port;
        let mut whitelist = resolve_whitelist(&file.whitelist)?;

        if let Some(p) = env("CLIENT_PORT") {
            port = p
                .trim()
                .parse()
                .map_err(|_| ProxyError::Config(format!("CLIENT_PORT is not a valid port: {p:?}")))?;
        }
        if let Some(v) = env("WHITELIST_ENABLED") {
            whitelist.enabled = parse_bool("WHITELIST_ENABLED", &v)?;
        }
        if let Some(list) = env("WHITELIST") {
            whitelist.domains = Whitelist::parse_list(&list).patterns().to_vec();
        }

        if let Some(enabled) = overrides.whitelist_enabled {
            whitelist.enabled = enabled;
        }

        let relay_host = overrides.relay_host.clone().unwrap_or(file.relay.host);
        let server_name = overrides
            .server_name
            .clone()
            .or(file.relay.server_name)
            .unwrap_or_else(|| relay_host.clone());

        let cert = overrides.cert.clone().unwrap_or(file.tls.cert);
        let key = overrides.key.clone().unwrap_or(file.tls.key);
        let (cert_path, key_path) = if cert.trim().is_empty() {
            (None, None)
        } else {
            (Some(expand_tilde(&cert)), Some(expand_tilde(&key)))
        };
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
            ..TlsPolicy::default()
        };

        Ok(Self {
            host: overrides.host.clone().unwrap_or(file.local.host),
            port: overrides.port.unwrap_or(port),
            relay_port: overrides.relay_port.unwrap_or(file.relay.port),
            relay_host,
            server_name,
            cert_path,
            key_path,
            ca_paths: ca.iter().map(expand_tilde).collect(),
            tls_policy,
            whitelist,
            timeouts: AgentTimeouts::from(&file.timeouts),
        })
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// `host:port` of the relay.
    pub fn relay_addr(&self) -> String {
        join_host_port(&self.relay_host, self.relay_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn parse_bool(name: &str, value: &str) -> ProxyResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ProxyError::Config(format!("{name} must be true or false, got {other:?}"))),
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

fn resolve_whitelist(section: &WhitelistSection) -> ProxyResult<WhitelistSettings> {
    let mut settings = WhitelistSettings {
        enabled: section.enabled,
        domains: section.domains.clone(),
    };

    let Some(file) = &section.file else {
        return Ok(settings);
    };
    let path = expand_tilde(file);
    if !path.exists() {
        warn!(path = %path.display(), "whitelist file not found, using inline list");
        return Ok(settings);
    }
    let content = std::fs::read_to_string(&path)?;
    let parsed: WhitelistFile =
        toml::from_str(&content).map_err(|e| ProxyError::Config(format!("{}: {e}", path.display())))?;
    if let Some(enabled) = parsed.enabled {
        settings.enabled = enabled;
    }
    if let Some(domains) = parsed.domains {
        settings.domains = domains;
    }
    debug!(path = %path.display(), domains = settings.domains.len(), "loaded whitelist file");
    Ok(settings)
}
