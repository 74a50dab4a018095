//! TLS acceptor construction for HTTPS listeners and intercepted tunnels.

use super::ServerError;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Create TLS acceptor from certificate and key files.
pub fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, ServerError> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| {
        ServerError::Tls(format!("Failed to open certificate file '{cert_path}': {e}"))
    })?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("Failed to parse certificate file: {e}")))?;

    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "No certificates found in certificate file: {cert_path}"
        )));
    }

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        ServerError::Tls(format!("Failed to open private key file '{key_path}': {e}"))
    })?;
    let mut key_reader = std::io::BufReader::new(key_file);

    // PKCS8, RSA or SEC1
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ServerError::Tls(format!("Failed to parse private key file: {e}")))?
        .ok_or_else(|| ServerError::Tls(format!("No private key found in key file: {key_path}")))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(format!("Failed to select TLS versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(format!("Failed to build TLS configuration: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_certificate_file() {
        let err = create_tls_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .err()
            .expect("expected error");
        assert!(matches!(err, ServerError::Tls(ref m) if m.contains("certificate file")));
    }

    #[test]
    fn test_empty_certificate_file() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        let err = create_tls_acceptor(cert.path().to_str().unwrap(), "/nonexistent/key.pem")
            .err()
            .expect("expected error");
        assert!(matches!(err, ServerError::Tls(ref m) if m.contains("No certificates")));
    }
}
