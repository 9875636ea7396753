//! TLS support for the chat listener.
//!
//! Reads a PEM certificate chain and private key and produces a
//! `TlsAcceptor` that the server wraps around each accepted TCP stream.

use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFiles;

/// Errors that can occur when loading TLS material.
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read the certificate file.
    CertRead(std::io::Error),
    /// Failed to read the private key file.
    KeyRead(std::io::Error),
    /// No certificates found in the PEM file.
    NoCerts,
    /// No private key found in the PEM file.
    NoKey,
    /// rustls refused the certificate/key pair.
    Config(tokio_rustls::rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CertRead(e) => write!(f, "failed to read TLS certificate file: {}", e),
            Self::KeyRead(e) => write!(f, "failed to read TLS key file: {}", e),
            Self::NoCerts => write!(f, "no certificates found in PEM file"),
            Self::NoKey => write!(f, "no private key found in PEM file"),
            Self::Config(e) => write!(f, "failed to build TLS config: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

/// Build an acceptor from the configured certificate and key files.
pub fn acceptor(files: &TlsFiles) -> Result<TlsAcceptor, TlsError> {
    load_tls_config(&files.cert_file, &files.key_file)
}

/// Load a certificate chain and private key from PEM files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_data = std::fs::read(cert_path).map_err(TlsError::CertRead)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertRead)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }

    // PKCS8, RSA and SEC1 keys are all accepted
    let key_data = std::fs::read(key_path).map_err(TlsError::KeyRead)?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(TlsError::KeyRead)?
        .ok_or(TlsError::NoKey)?;

    // Idempotent when a provider is already installed.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
