//! C11: TLS config loading (§15).
//!
//! Both server and client configs are built from PEM files via
//! `rustls-pemfile`; a client config with no configured CA bundle falls
//! back to the bundled Mozilla root store (`webpki-roots`) rather than the
//! platform trust store.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse certificate(s) in {path}: {source}")]
    ParseCert {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("failed to parse private key in {path}: {source}")]
    ParseKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CA certificate: {0}")]
    InvalidCa(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] rustls::Error),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::ParseCert {
            path: path.display().to_string(),
            source,
        })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.display().to_string(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| Error::ParseKey {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| Error::NoPrivateKey(path.display().to_string()))
}

fn load_ca_store(ca_path: &Path) -> Result<rustls::RootCertStore, Error> {
    let mut store = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        store
            .add(cert)
            .map_err(|e| Error::InvalidCa(e.to_string()))?;
    }
    Ok(store)
}

/// Server-side TLS config (inbound TLS-accepting listeners, §4.4's TLS
/// variant and `Inbound/Server/TLS.py`'s `FromConfig`).
pub struct TlsServerConfig;

impl TlsServerConfig {
    /// `client_ca_path` enables mutual TLS: when set, client certificates
    /// are required and verified against that bundle.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
    ) -> Result<Arc<rustls::ServerConfig>, Error> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let builder = rustls::ServerConfig::builder();
        let config = match client_ca_path {
            Some(ca_path) => {
                let roots = load_ca_store(ca_path)?;
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| Error::InvalidCa(e.to_string()))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(certs, key)?,
        };
        Ok(Arc::new(config))
    }
}

/// Client-side TLS config (outbound TLS dials, C3's TLS variant and
/// `tls_repeat`).
pub struct TlsClientConfig;

impl TlsClientConfig {
    /// `client_cert_path`/`client_key_path` must both be set or neither
    /// (mutual TLS for the outbound leg); `ca_path` missing falls back to
    /// the bundled Mozilla roots.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Arc<rustls::ClientConfig>, Error> {
        let roots = match ca_path {
            Some(path) => load_ca_store(path)?,
            None => {
                let mut store = rustls::RootCertStore::empty();
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                store
            }
        };
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let config = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                builder.with_client_auth_cert(certs, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::InvalidCa(
                    "client_cert_path and client_key_path must both be set or neither"
                        .to_string(),
                ))
            }
        };
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_rejects_half_specified_client_cert() {
        let result = TlsClientConfig::load(None, Some(Path::new("/tmp/cert.pem")), None);
        assert!(result.is_err());
    }

    #[test]
    fn client_config_falls_back_to_webpki_roots_when_no_ca_given() {
        assert!(TlsClientConfig::load(None, None, None).is_ok());
    }
}
