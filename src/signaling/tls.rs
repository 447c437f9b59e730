//! TLS setup for serving the relay over wss://

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;
use tokio_rustls::TlsAcceptor;

use crate::error::CallError;

fn open_pem(path: &Path) -> Result<BufReader<File>, CallError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| CallError::Signaling(format!("Cannot open {}: {}", path.display(), e)))
}

/// Read every certificate in a PEM file, leaf first
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CallError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CallError::Signaling(format!("Bad certificate in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(CallError::Signaling(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CallError> {
    let mut reader = open_pem(path)?;

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item
            .map_err(|e| CallError::Signaling(format!("Bad key file {}: {}", path.display(), e)))?;
        let key = match item {
            Item::Pkcs1Key(key) => PrivateKeyDer::Pkcs1(key),
            Item::Pkcs8Key(key) => PrivateKeyDer::Pkcs8(key),
            Item::Sec1Key(key) => PrivateKeyDer::Sec1(key),
            _ => continue,
        };
        return Ok(key);
    }

    Err(CallError::Signaling(format!(
        "No private key found in {}",
        path.display()
    )))
}

/// Build the acceptor handed to [`RelayServer::serve_tls`](super::RelayServer::serve_tls)
pub fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, CallError> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CallError::Signaling(format!("Invalid TLS configuration: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
