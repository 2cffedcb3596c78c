//! TLS for the standard listener.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{AgentError, Result};
use crate::util::expand_tilde;

/// Build an acceptor from PEM certificate chain and key files.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AgentError::Config(format!("invalid TLS certificate/key: {e}")))?;

    info!("TLS enabled with certificate {cert_path}");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &str) -> Result<BufReader<File>> {
    let path = expand_tilde(path);
    File::open(&*path)
        .map(BufReader::new)
        .map_err(|e| AgentError::Config(format!("opening {path}: {e}")))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).filter_map(|c| c.ok()).collect();
    if certs.is_empty() {
        return Err(AgentError::Config(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    private_key(&mut reader)
        .map_err(|e| AgentError::Config(format!("reading {path}: {e}")))?
        .ok_or_else(|| AgentError::Config(format!("no private key found in {path}")))
}
