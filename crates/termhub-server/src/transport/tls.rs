//! TLS material: loading PEM files and generating a development pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use termhub_core::{TermhubError, TermhubResult};

/// Build a rustls server config from PEM certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> TermhubResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        TermhubError::Config(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        TermhubError::Config(format!("cannot read key {}: {e}", key_path.display()))
    })?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TermhubError::Config(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or_else(|| {
        TermhubError::Config(format!("no private key found in {}", key_path.display()))
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TermhubError::Config(format!("TLS setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TermhubError::Config(format!("invalid certificate or key: {e}")))?;

    // WebSocket upgrades ride on HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Write a self-signed certificate for localhost into `dir`.
///
/// Returns the certificate and key paths.
pub fn generate_self_signed_cert(dir: &Path) -> TermhubResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let cert_err =
        |e: rcgen::Error| TermhubError::Config(format!("certificate generation failed: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(cert_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "termhub-server dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(cert_err)?;
    let cert = params.self_signed(&key_pair).map_err(cert_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}
