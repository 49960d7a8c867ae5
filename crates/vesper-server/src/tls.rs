//! TLS termination for the listener.
//!
//! [`build_acceptor`] turns the server configuration into a rustls
//! acceptor. A configured client CA bundle switches on client
//! certificate verification; combined with mTLS mode, certificates
//! become mandatory.

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;

/// Errors from assembling the TLS acceptor. All of them are fatal
/// configuration problems surfaced before the listener binds.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A path the enabled mode needs was not supplied.
    #[error("TLS enabled but no {0} configured")]
    Missing(&'static str),

    /// PEM material could not be read, parsed, or used.
    #[error("{role} '{path}': {detail}")]
    Material {
        role: &'static str,
        path: String,
        detail: String,
    },

    /// rustls rejected the assembled configuration (e.g. a key that
    /// does not match the certificate).
    #[error("TLS configuration rejected: {0}")]
    Rejected(#[from] rustls::Error),
}

impl TlsError {
    fn material(role: &'static str, path: &Path, detail: impl Display) -> Self {
        TlsError::Material {
            role,
            path: path.display().to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Builds the acceptor for the accept loop.
///
/// Requires `cert_file` and `key_file`; mTLS additionally requires
/// `client_ca_file`. A CA bundle without mTLS verifies client
/// certificates only when a client offers one.
pub fn build_acceptor(config: &ServerConfig) -> Result<TlsAcceptor, TlsError> {
    let cert_path = config
        .cert_file
        .as_deref()
        .ok_or(TlsError::Missing("certificate file"))?;
    let key_path = config
        .key_file
        .as_deref()
        .ok_or(TlsError::Missing("private key file"))?;
    if config.mtls && config.client_ca_file.is_none() {
        return Err(TlsError::Missing("client CA bundle"));
    }

    let certs = load_cert_chain(Path::new(cert_path))?;
    let key = PrivateKeyDer::from_pem_file(Path::new(key_path))
        .map_err(|e| TlsError::material("private key file", Path::new(key_path), e))?;

    let server_config = match config.client_ca_file.as_deref() {
        Some(ca_path) => {
            let verifier = client_verifier(Path::new(ca_path), config.mtls)?;
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Reads every certificate in a PEM file. At least one is required.
fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let role = "certificate file";
    let mut certs = Vec::new();
    for cert in
        CertificateDer::pem_file_iter(path).map_err(|e| TlsError::material(role, path, e))?
    {
        certs.push(cert.map_err(|e| TlsError::material(role, path, e))?);
    }
    if certs.is_empty() {
        return Err(TlsError::material(role, path, "contains no certificates"));
    }
    Ok(certs)
}

/// Builds the client certificate verifier from a CA bundle. When
/// `required` is false, clients without a certificate are still
/// admitted; offered certificates are verified either way.
fn client_verifier(
    path: &Path,
    required: bool,
) -> Result<Arc<dyn ClientCertVerifier>, TlsError> {
    let role = "client CA bundle";
    let mut roots = RootCertStore::empty();
    for cert in
        CertificateDer::pem_file_iter(path).map_err(|e| TlsError::material(role, path, e))?
    {
        let cert = cert.map_err(|e| TlsError::material(role, path, e))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::material(role, path, e))?;
    }

    let builder = WebPkiClientVerifier::builder(Arc::new(roots));
    let builder = if required {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder.build().map_err(|e| TlsError::material(role, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_err<T>(result: Result<T, TlsError>) -> TlsError {
        match result {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        }
    }

    fn tls_config(cert: Option<&Path>, key: Option<&Path>, ca: Option<&Path>, mtls: bool) -> ServerConfig {
        ServerConfig {
            tls: true,
            mtls,
            cert_file: cert.map(|p| p.display().to_string()),
            key_file: key.map(|p| p.display().to_string()),
            client_ca_file: ca.map(|p| p.display().to_string()),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn unconfigured_paths_are_missing_errors() {
        let err = expect_err(build_acceptor(&tls_config(None, None, None, false)));
        assert!(matches!(err, TlsError::Missing("certificate file")));

        let cert = Path::new("/nonexistent/cert.pem");
        let err = expect_err(build_acceptor(&tls_config(Some(cert), None, None, false)));
        assert!(matches!(err, TlsError::Missing("private key file")));
    }

    #[test]
    fn mtls_without_ca_is_rejected_before_any_io() {
        let cert = Path::new("/nonexistent/cert.pem");
        let key = Path::new("/nonexistent/key.pem");
        let err = expect_err(build_acceptor(&tls_config(Some(cert), Some(key), None, true)));
        assert!(matches!(err, TlsError::Missing("client CA bundle")));
    }

    #[test]
    fn unreadable_cert_file_names_the_path() {
        let cert = Path::new("/nonexistent/cert.pem");
        let key = Path::new("/nonexistent/key.pem");
        let err = expect_err(build_acceptor(&tls_config(Some(cert), Some(key), None, false)));
        match err {
            TlsError::Material { role, path, .. } => {
                assert_eq!(role, "certificate file");
                assert!(path.contains("cert.pem"));
            }
            other => panic!("expected Material, got {other}"),
        }
    }

    #[test]
    fn garbage_pem_is_a_material_error() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "this is not pem data").unwrap();
        std::fs::write(&key, "neither is this").unwrap();

        let err = expect_err(build_acceptor(&tls_config(
            Some(cert.as_path()),
            Some(key.as_path()),
            None,
            false,
        )));
        assert!(matches!(err, TlsError::Material { .. }));
    }

    #[test]
    fn empty_cert_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "").unwrap();

        let err = load_cert_chain(&cert).unwrap_err();
        match err {
            TlsError::Material { detail, .. } => {
                // an empty file either parses to zero certs or fails
                // at the PEM layer; both are material problems
                assert!(!detail.is_empty());
            }
            other => panic!("expected Material, got {other}"),
        }
    }
}
