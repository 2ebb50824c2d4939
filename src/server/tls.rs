//! TLS acceptor construction from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio_rustls::TlsAcceptor;

use super::ServerError;
use crate::config::TlsConfig;

/// Loads the certificate chain and private key and builds an acceptor.
///
/// # Errors
///
/// - [`ServerError::TlsFile`]: a PEM file could not be read.
/// - [`ServerError::MissingCertificate`] / [`ServerError::MissingKey`]: a file held no usable entry.
/// - [`ServerError::Tls`]: rustls rejected the certificate/key pair.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(&config.cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| ServerError::TlsFile {
            path: config.cert_path.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ServerError::MissingCertificate(config.cert_path.clone()));
    }

    let key = rustls_pemfile::private_key(&mut open(&config.key_path)?)
        .map_err(|source| ServerError::TlsFile {
            path: config.key_path.clone(),
            source,
        })?
        .ok_or_else(|| ServerError::MissingKey(config.key_path.clone()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ServerError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported_with_their_path() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        };
        match acceptor(&config) {
            Err(ServerError::TlsFile { path, .. }) => assert_eq!(path, config.cert_path),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn empty_pem_has_no_certificate() {
        let dir = std::env::temp_dir().join(format!("servlette-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, "").unwrap();
        let config = TlsConfig {
            cert_path: cert.clone(),
            key_path: cert.clone(),
        };
        assert!(matches!(acceptor(&config), Err(ServerError::MissingCertificate(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
