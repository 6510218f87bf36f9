//! rustls configuration for the agent↔relay channel.
//!
//! Both sides trust only the configured CA bundle. The relay's client
//! authentication mode follows its `request_cert` / `reject_unauthorized`
//! settings:
//!
//! | request_cert | reject_unauthorized | Result                                    |
//! |--------------|---------------------|-------------------------------------------|
//! | false        | any                 | no client certificate requested           |
//! | true         | true                | certificate required and verified         |
//! | true         | false               | checked when presented, never rejected    |
//!
//! In the last mode the handshake still proves the peer holds the key for
//! the certificate it sent. [`ClientChainCheck`] tells the relay afterwards
//! whether that certificate chains to the CA bundle, and why not.

use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use smartvpn_core::{certificate_fingerprint, ProxyError, ProxyResult};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest protocol version either side will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

impl TlsVersion {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::V1_2 => TLS12_AND_UP,
            TlsVersion::V1_3 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = ProxyError;

    fn from_str(s: &str) -> ProxyResult<Self> {
        match s.trim().trim_start_matches("TLSv").trim_start_matches("tls") {
            "1.2" => Ok(TlsVersion::V1_2),
            "1.3" => Ok(TlsVersion::V1_3),
            other => Err(ProxyError::Config(format!(
                "unsupported minimum TLS version {other:?} (expected 1.2 or 1.3)"
            ))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V1_2 => f.write_str("1.2"),
            TlsVersion::V1_3 => f.write_str("1.3"),
        }
    }
}

/// Client certificate handling on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMode {
    None,
    Required,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub min_version: TlsVersion,
    /// rustls suite names such as `TLS13_AES_256_GCM_SHA384`. Empty keeps
    /// the provider defaults.
    pub cipher_suites: Vec<String>,
    pub request_cert: bool,
    pub reject_unauthorized: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::V1_2,
            cipher_suites: Vec::new(),
            request_cert: true,
            reject_unauthorized: true,
        }
    }
}

impl TlsPolicy {
    pub fn client_auth(&self) -> ClientAuthMode {
        match (self.request_cert, self.reject_unauthorized) {
            (false, _) => ClientAuthMode::None,
            (true, true) => ClientAuthMode::Required,
            (true, false) => ClientAuthMode::Optional,
        }
    }

    fn provider(&self) -> ProxyResult<Arc<CryptoProvider>> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !self.cipher_suites.is_empty() {
            let mut selected = Vec::with_capacity(self.cipher_suites.len());
            for name in &self.cipher_suites {
                let suite = provider
                    .cipher_suites
                    .iter()
                    .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name.trim()))
                    .ok_or_else(|| ProxyError::Tls(format!("unknown cipher suite {name:?}")))?;
                selected.push(*suite);
            }
            provider.cipher_suites = selected;
        }
        Ok(Arc::new(provider))
    }
}

/// Certificate chain plus its private key.
pub struct Identity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Parsed PEM material for one side of the channel.
pub struct TlsMaterial {
    pub identity: Option<Identity>,
    pub roots: RootCertStore,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("has_identity", &self.identity.is_some())
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl TlsMaterial {
    /// Parse PEM bytes. `cert_pem`/`key_pem` may be absent only for an
    /// agent that connects without a client certificate.
    pub fn from_pem(
        cert_pem: Option<&[u8]>,
        key_pem: Option<&[u8]>,
        ca_pems: &[&[u8]],
    ) -> ProxyResult<Self> {
        let identity = match (cert_pem, key_pem) {
            (Some(cert), Some(key)) => Some(Identity {
                chain: parse_certs(cert, "certificate")?,
                key: rustls_pemfile::private_key(&mut &key[..])
                    .map_err(|e| ProxyError::Tls(format!("cannot parse private key: {e}")))?
                    .ok_or_else(|| ProxyError::Tls("no private key found in PEM".into()))?,
            }),
            (None, None) => None,
            _ => {
                return Err(ProxyError::Config(
                    "certificate and key must be configured together".into(),
                ))
            }
        };

        let mut roots = RootCertStore::empty();
        for pem in ca_pems {
            for cert in parse_certs(pem, "CA certificate")? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }
        if roots.is_empty() {
            return Err(ProxyError::Tls("no CA certificates configured".into()));
        }

        Ok(Self { identity, roots })
    }

    /// Read and parse PEM files; CA files are concatenated into one bundle.
    pub fn load<P: AsRef<Path>>(cert: Option<&Path>, key: Option<&Path>, ca: &[P]) -> ProxyResult<Self> {
        let cert_pem = cert.map(|p| read_pem(p, "certificate")).transpose()?;
        let key_pem = key.map(|p| read_pem(p, "private key")).transpose()?;
        let ca_pems = ca
            .iter()
            .map(|p| read_pem(p.as_ref(), "CA bundle"))
            .collect::<ProxyResult<Vec<_>>>()?;
        let ca_refs: Vec<&[u8]> = ca_pems.iter().map(Vec::as_slice).collect();
        Self::from_pem(cert_pem.as_deref(), key_pem.as_deref(), &ca_refs)
    }
}

fn read_pem(path: &Path, what: &str) -> ProxyResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| ProxyError::Tls(format!("cannot read {what} {}: {e}", path.display())))
}

fn parse_certs(pem: &[u8], what: &str) -> ProxyResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("cannot parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no {what} found in PEM")));
    }
    Ok(certs)
}

fn tls_err(e: rustls::Error) -> ProxyError {
    ProxyError::Tls(e.to_string())
}

/// Agent-side configuration: trust only the CA bundle, present the
/// identity when one is configured.
pub fn client_config(material: TlsMaterial, policy: &TlsPolicy) -> ProxyResult<Arc<ClientConfig>> {
    let provider = policy.provider()?;
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(material.roots), provider.clone())
        .build()
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(policy.min_version.versions())
        .map_err(tls_err)?
        .with_webpki_verifier(verifier);

    let config = match material.identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain, identity.key)
            .map_err(tls_err)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Relay-side configuration.
pub fn server_config(material: TlsMaterial, policy: &TlsPolicy) -> ProxyResult<Arc<ServerConfig>> {
    let provider = policy.provider()?;
    let identity = material
        .identity
        .ok_or_else(|| ProxyError::Config("relay requires a certificate and key".into()))?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(policy.min_version.versions())
        .map_err(tls_err)?;

    let builder = match policy.client_auth() {
        ClientAuthMode::None => builder.with_no_client_auth(),
        ClientAuthMode::Required => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(material.roots), provider)
                .build()
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        ClientAuthMode::Optional => {
            let inner = WebPkiClientVerifier::builder_with_provider(Arc::new(material.roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(Arc::new(TolerantClientVerifier { inner }))
        }
    };

    let config = builder
        .with_single_cert(identity.chain, identity.key)
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

/// Requests a client certificate and never fails the handshake over its
/// chain. Handshake signatures are still checked against the presented key.
#[derive(Debug)]
struct TolerantClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl ClientCertVerifier for TolerantClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Checks a peer's certificate chain against the CA bundle after the
/// handshake.
#[derive(Clone)]
pub struct ClientChainCheck {
    verifier: Arc<dyn ClientCertVerifier>,
}

impl fmt::Debug for ClientChainCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChainCheck").finish_non_exhaustive()
    }
}

impl ClientChainCheck {
    pub fn new(roots: RootCertStore, policy: &TlsPolicy) -> ProxyResult<Self> {
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), policy.provider()?)
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(Self { verifier })
    }

    /// `Ok` when `chain` (leaf first) is trusted right now; otherwise the
    /// reason it is not.
    pub fn verify(&self, chain: &[CertificateDer<'_>]) -> Result<(), rustls::Error> {
        let (leaf, intermediates) = chain.split_first().ok_or(rustls::Error::NoCertificatesPresented)?;
        self.verifier
            .verify_client_cert(leaf, intermediates, UnixTime::now())
            .map(|_| ())
    }
}

/// Map an I/O error from a TLS stream to the error taxonomy.
///
/// Certificate problems on either side become [`ProxyError::Auth`]; other
/// TLS failures become [`ProxyError::Tls`]; plain socket errors become
/// [`ProxyError::Connect`].
pub fn classify_tls_error(e: io::Error) -> ProxyError {
    use rustls::AlertDescription as Alert;

    let Some(tls) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) else {
        return ProxyError::Connect(e.to_string());
    };
    match tls {
        rustls::Error::InvalidCertificate(_)
        | rustls::Error::NoCertificatesPresented
        | rustls::Error::AlertReceived(
            Alert::BadCertificate
            | Alert::UnsupportedCertificate
            | Alert::CertificateRevoked
            | Alert::CertificateExpired
            | Alert::CertificateUnknown
            | Alert::UnknownCA
            | Alert::AccessDenied
            | Alert::CertificateRequired,
        ) => ProxyError::Auth(tls.to_string()),
        other => ProxyError::Tls(other.to_string()),
    }
}

/// Fingerprint of the first certificate the peer presented.
pub fn peer_fingerprint(certs: Option<&[CertificateDer<'_>]>) -> Option<String> {
    certs
        .and_then(|c| c.first())
        .map(|c| certificate_fingerprint(c.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pki {
        ca_pem: String,
        leaf_cert_pem: String,
        leaf_key_pem: String,
    }

    fn pki() -> Pki {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Pki {
            ca_pem: ca.pem(),
            leaf_cert_pem: leaf.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        }
    }

    fn material(p: &Pki) -> TlsMaterial {
        TlsMaterial::from_pem(
            Some(p.leaf_cert_pem.as_bytes()),
            Some(p.leaf_key_pem.as_bytes()),
            &[p.ca_pem.as_bytes()],
        )
        .unwrap()
    }

    #[test]
    fn version_parsing() {
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::V1_2);
        assert_eq!("TLSv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::V1_3);
        assert!("1.0".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn client_auth_modes() {
        let mut policy = TlsPolicy::default();
        assert_eq!(policy.client_auth(), ClientAuthMode::Required);
        policy.reject_unauthorized = false;
        assert_eq!(policy.client_auth(), ClientAuthMode::Optional);
        policy.request_cert = false;
        assert_eq!(policy.client_auth(), ClientAuthMode::None);
    }

    #[test]
    fn builds_all_server_modes() {
        let p = pki();
        for (request_cert, reject_unauthorized) in [(true, true), (true, false), (false, true)] {
            let policy = TlsPolicy {
                request_cert,
                reject_unauthorized,
                ..TlsPolicy::default()
            };
            server_config(material(&p), &policy).unwrap();
        }
    }

    #[test]
    fn chain_check_reports_foreign_ca() {
        let trusted = pki();
        let foreign = pki();
        let check = ClientChainCheck::new(material(&trusted).roots, &TlsPolicy::default()).unwrap();

        let own = material(&trusted).identity.unwrap();
        check.verify(&own.chain).unwrap();

        let other = material(&foreign).identity.unwrap();
        assert!(matches!(check.verify(&other.chain), Err(rustls::Error::InvalidCertificate(_))));
        assert!(matches!(check.verify(&[]), Err(rustls::Error::NoCertificatesPresented)));
    }

    #[test]
    fn client_config_with_and_without_identity() {
        let p = pki();
        client_config(material(&p), &TlsPolicy::default()).unwrap();
        let anonymous = TlsMaterial::from_pem(None, None, &[p.ca_pem.as_bytes()]).unwrap();
        client_config(anonymous, &TlsPolicy::default()).unwrap();
    }

    #[test]
    fn cipher_suite_selection() {
        let p = pki();
        let policy = TlsPolicy {
            min_version: TlsVersion::V1_3,
            cipher_suites: vec!["TLS13_AES_256_GCM_SHA384".into()],
            ..TlsPolicy::default()
        };
        client_config(material(&p), &policy).unwrap();

        let bad = TlsPolicy {
            cipher_suites: vec!["TLS_NOT_A_SUITE".into()],
            ..TlsPolicy::default()
        };
        assert!(matches!(client_config(material(&p), &bad), Err(ProxyError::Tls(_))));
    }

    #[test]
    fn server_requires_identity() {
        let p = pki();
        let anonymous = TlsMaterial::from_pem(None, None, &[p.ca_pem.as_bytes()]).unwrap();
        assert!(matches!(
            server_config(anonymous, &TlsPolicy::default()),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn rejects_bad_material() {
        assert!(matches!(
            TlsMaterial::from_pem(None, None, &[&b"not pem"[..]]),
            Err(ProxyError::Tls(_))
        ));
        let p = pki();
        assert!(matches!(
            TlsMaterial::from_pem(Some(p.leaf_cert_pem.as_bytes()), None, &[p.ca_pem.as_bytes()]),
            Err(ProxyError::Config(_))
        ));
        assert!(matches!(
            TlsMaterial::from_pem(Some(p.leaf_cert_pem.as_bytes()), Some(&b"garbage"[..]), &[p.ca_pem.as_bytes()]),
            Err(ProxyError::Tls(_))
        ));
    }

    #[test]
    fn classify_errors() {
        let auth = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::NoCertificatesPresented);
        assert!(matches!(classify_tls_error(auth), ProxyError::Auth(_)));

        let alert = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::UnknownCA),
        );
        assert!(matches!(classify_tls_error(alert), ProxyError::Auth(_)));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(classify_tls_error(refused), ProxyError::Connect(_)));
    }

    #[test]
    fn fingerprint_of_first_cert() {
        let der = CertificateDer::from(vec![1u8, 2, 3]);
        let fp = peer_fingerprint(Some(std::slice::from_ref(&der))).unwrap();
        assert_eq!(fp, certificate_fingerprint(&[1, 2, 3]));
        assert_eq!(peer_fingerprint(None), None);
    }
}
