//! TLS termination for CONNECT tunnels: root-CA load-or-generate, plus
//! per-SNI leaf certificate minting.
//!
//! Grounded in the MITM CA pattern used by Codex's network proxy (issuing a
//! self-signed CA with `rcgen`, then signing a fresh leaf per intercepted
//! host) — that example builds on `rama`'s TLS stack; here the signed PEM
//! pair feeds a plain `tokio_rustls::TlsAcceptor` instead, since this crate
//! has no `rama` dependency.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Issuer, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::fs;

use crate::core::{ProxyError, ProxyResult};

const CA_CERT_FILE: &str = "veilproxy-ca-cert.pem";
const CA_KEY_FILE: &str = "veilproxy-ca.pem";

/// Owns the root CA and mints per-host server configs on demand.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl CertificateAuthority {
    /// Loads the root CA from `certs_dir`, generating and persisting one if
    /// absent — the root is generated on first startup of the listener.
    pub async fn load_or_generate(certs_dir: impl AsRef<Path>) -> ProxyResult<Self> {
        let certs_dir = certs_dir.as_ref();
        fs::create_dir_all(certs_dir)
            .await
            .map_err(|e| ProxyError::Tls(format!("failed to create certs dir: {e}")))?;

        let cert_path: PathBuf = certs_dir.join(CA_CERT_FILE);
        let key_path: PathBuf = certs_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let ca_cert_pem = fs::read_to_string(&cert_path)
                .await
                .map_err(|e| ProxyError::Tls(format!("failed to read CA cert: {e}")))?;
            let ca_key_pem = fs::read_to_string(&key_path)
                .await
                .map_err(|e| ProxyError::Tls(format!("failed to read CA key: {e}")))?;
            return Ok(CertificateAuthority { ca_cert_pem, ca_key_pem });
        }

        let (ca_cert_pem, ca_key_pem) = generate_ca()?;
        fs::write(&cert_path, &ca_cert_pem)
            .await
            .map_err(|e| ProxyError::Tls(format!("failed to persist CA cert: {e}")))?;
        fs::write(&key_path, &ca_key_pem)
            .await
            .map_err(|e| ProxyError::Tls(format!("failed to persist CA key: {e}")))?;

        Ok(CertificateAuthority { ca_cert_pem, ca_key_pem })
    }

    /// Signs a fresh leaf certificate for `host` and returns a
    /// `rustls::ServerConfig` ready for `TlsAcceptor::from`.
    pub fn server_config_for_host(&self, host: &str) -> ProxyResult<Arc<ServerConfig>> {
        let key_pair = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| ProxyError::Tls(format!("failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, key_pair)
            .map_err(|e| ProxyError::Tls(format!("failed to parse CA cert: {e}")))?;

        let (leaf_cert_der, leaf_key_der) = issue_leaf(host, &issuer)?;

        let cert_chain = vec![CertificateDer::from(leaf_cert_der)];
        let key_der = PrivatePkcs8KeyDer::from(leaf_key_der);

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der.into())
            .map_err(|e| ProxyError::Tls(format!("failed to build rustls server config: {e}")))?;

        Ok(Arc::new(config))
    }
}

fn issue_leaf(host: &str, issuer: &Issuer<'_, KeyPair>) -> ProxyResult<(Vec<u8>, Vec<u8>)> {
    let mut params = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let mut p = CertificateParams::new(Vec::new())
            .map_err(|e| ProxyError::Tls(format!("failed to create leaf cert params: {e}")))?;
        p.subject_alt_names.push(SanType::IpAddress(ip));
        p
    } else {
        CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::Tls(format!("failed to create leaf cert params: {e}")))?
    };

    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::Tls(format!("failed to generate leaf key pair: {e}")))?;
    let cert = params
        .signed_by(&key_pair, issuer)
        .map_err(|e| ProxyError::Tls(format!("failed to sign leaf cert: {e}")))?;

    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

fn generate_ca() -> ProxyResult<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "veilproxy local CA");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::Tls(format!("failed to generate CA key pair: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Tls(format!("failed to self-sign CA cert: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_ca_on_first_load_and_persists_it() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
        assert!(ca.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
    }

    #[tokio::test]
    async fn reloads_existing_ca_instead_of_regenerating() {
        let dir = tempfile::tempdir().unwrap();
        let first = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
        let second = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
        assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
    }

    #[tokio::test]
    async fn issues_server_config_for_arbitrary_host() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).await.unwrap();
        assert!(ca.server_config_for_host("example.com").is_ok());
    }
}
