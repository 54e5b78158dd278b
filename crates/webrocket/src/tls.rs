use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::EndpointError;

/// Builds a TLS acceptor from PEM-encoded certificate and key files.
pub(crate) fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, EndpointError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
            .collect::<Result<_, _>>()
            .map_err(|err| EndpointError::Tls(format!("invalid certificate: {err}")))?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))
            .map_err(|err| EndpointError::Tls(format!("invalid private key: {err}")))?
            .ok_or_else(|| EndpointError::Tls("no private key found".into()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| EndpointError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
