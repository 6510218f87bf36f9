//! Development PKI: one CA plus a relay (server) and an agent (client)
//! certificate signed by it.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use smartvpn_core::{ProxyError, ProxyResult};
use std::path::{Path, PathBuf};

/// PEM-encoded output of [`generate_dev_pki`].
#[derive(Clone)]
pub struct DevPki {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

impl std::fmt::Debug for DevPki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevPki").finish_non_exhaustive()
    }
}

fn rc(e: rcgen::Error) -> ProxyError {
    ProxyError::Tls(format!("certificate generation failed: {e}"))
}

fn named(common_name: &str, sans: Vec<String>) -> ProxyResult<CertificateParams> {
    let mut params = CertificateParams::new(sans).map_err(rc)?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);
    Ok(params)
}

fn leaf(
    common_name: &str,
    sans: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> ProxyResult<(Certificate, KeyPair)> {
    let mut params = named(common_name, sans)?;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().map_err(rc)?;
    let cert = params.signed_by(&key, ca, ca_key).map_err(rc)?;
    Ok((cert, key))
}

/// Generate a CA, a relay certificate valid for `server_names` (DNS names
/// or IP addresses) and an agent client certificate.
pub fn generate_dev_pki(server_names: &[String]) -> ProxyResult<DevPki> {
    if server_names.is_empty() {
        return Err(ProxyError::Config("at least one server name is required".into()));
    }

    let ca_key = KeyPair::generate().map_err(rc)?;
    let mut ca_params = named("SmartVPN Development CA", Vec::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let ca = ca_params.self_signed(&ca_key).map_err(rc)?;

    let (server, server_key) = leaf(
        "smartvpn-relay",
        server_names.to_vec(),
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca,
        &ca_key,
    )?;
    let (client, client_key) = leaf(
        "smartvpn-agent",
        Vec::new(),
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca,
        &ca_key,
    )?;

    Ok(DevPki {
        ca_cert_pem: ca.pem(),
        server_cert_pem: server.pem(),
        server_key_pem: server_key.serialize_pem(),
        client_cert_pem: client.pem(),
        client_key_pem: client_key.serialize_pem(),
    })
}

impl DevPki {
    /// Write the five PEM files into `dir`, creating it if needed.
    ///
    /// Private keys are written with mode 0600 on unix.
    pub fn write_to(&self, dir: &Path) -> ProxyResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let files = [
            ("ca-cert.pem", &self.ca_cert_pem, false),
            ("server-cert.pem", &self.server_cert_pem, false),
            ("server-key.pem", &self.server_key_pem, true),
            ("client-cert.pem", &self.client_cert_pem, false),
            ("client-key.pem", &self.client_key_pem, true),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (name, pem, secret) in files {
            let path = dir.join(name);
            std::fs::write(&path, pem)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if secret {
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                }
            }
            #[cfg(not(unix))]
            let _ = secret;
            written.push(path);
        }
        Ok(written)
    }
}
