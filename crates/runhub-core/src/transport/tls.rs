//! TLS termination for the control channel.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::errors::HubError;

/// Builds an acceptor from a PEM certificate chain and a PEM private key.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, HubError> {
    let certs = CertificateDer::pem_file_iter(cert)
        .map_err(|e| HubError::Tls(format!("Failed to open {}: {}", cert.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HubError::Tls(format!("Invalid certificate {}: {}", cert.display(), e)))?;
    if certs.is_empty() {
        return Err(HubError::Tls(format!(
            "No certificate found in {}",
            cert.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(key)
        .map_err(|e| HubError::Tls(format!("Invalid private key {}: {}", key.display(), e)))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| HubError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Tls(_)));
    }

    #[test]
    fn test_empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let err = load_acceptor(&cert, &dir.path().join("key.pem")).err().unwrap();
        assert!(err.to_string().contains("No certificate"));
    }
}
