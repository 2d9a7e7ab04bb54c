//! TLS material loading and config builders for the tunnel.
//!
//! Both sides of a tunnel require TLS 1.3 and mutual authentication: the
//! agent presents a client certificate signed by the shared CA, and the
//! gateway checks the certificate's Subject Common Name against the
//! registry's approved list.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open cert file {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(format!("failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

/// Load a PEM private key (PKCS#1, PKCS#8, or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open key file {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::tls(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::tls(format!("no private key found in {}", path.display())))
}

/// Build a root store from the trusted CA file.
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::tls(format!("bad CA certificate in {}: {e}", path.display())))?;
    }
    Ok(roots)
}

/// TLS config for the agent: trusts only the given CA, presents the agent
/// certificate, TLS 1.3 minimum.
pub fn client_config(ca: &Path, cert: &Path, key: &Path) -> Result<ClientConfig> {
    let roots = load_root_store(ca)?;
    ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| Error::tls(format!("failed to build client tls config: {e}")))
}

/// TLS config for the gateway: requires a client certificate signed by the
/// CA, TLS 1.3 minimum.
pub fn server_config(ca: &Path, cert: &Path, key: &Path) -> Result<ServerConfig> {
    let roots = load_root_store(ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::tls(format!("failed to build client verifier: {e}")))?;
    ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| Error::tls(format!("failed to build server tls config: {e}")))
}

/// Subject Common Name of a peer certificate, if it parses and has one.
pub fn peer_common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_certs_missing_file() {
        assert!(load_certs(Path::new("/nonexistent/ca.pem")).is_err());
    }

    #[test]
    fn test_load_certs_rejects_empty_pem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        assert!(load_certs(file.path()).is_err());
    }

    #[test]
    fn test_load_private_key_rejects_cert_pem() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(file, "AAAA").unwrap();
        writeln!(file, "-----END CERTIFICATE-----").unwrap();
        assert!(load_private_key(file.path()).is_err());
    }
}
