//! Loading of certificate and key files referenced by a profile.
//!
//! Everything is parsed here, before the protocol client sees it, so broken
//! material surfaces as [`TransportError::TlsMaterial`] instead of a failed
//! handshake.

use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::TlsSettings;
use super::error::TransportError;

/// Private key encodings, in the order they are tried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEncoding {
    Rsa,
    Ec,
    Pkcs8,
}

/// Parsed TLS setup for one profile.
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    pub config: Arc<ClientConfig>,
    /// `false` means the platform trust store
    pub custom_ca: bool,
    pub key_encoding: Option<KeyEncoding>,
}

pub async fn load_material(settings: &TlsSettings) -> Result<TlsMaterial, TransportError> {
    let (roots, custom_ca) = match non_empty(&settings.ca_cert_path) {
        Some(ca_path) => {
            let pem = read_pem(ca_path).await?;
            let certs = parse_certs(ca_path, &pem)?;
            let mut roots = RootCertStore::empty();
            let (added, ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(tls_error(ca_path, "no usable CA certificate"));
            }
            debug!(path = %ca_path.display(), added, ignored, "Loaded CA certificate");
            (roots, true)
        }
        None => (platform_roots(), false),
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let (config, key_encoding) = match (
        non_empty(&settings.client_cert_path),
        non_empty(&settings.client_key_path),
    ) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = read_pem(cert_path).await?;
            let chain = parse_certs(cert_path, &cert_pem)?;
            let key_pem = read_pem(key_path).await?;
            let (encoding, key) = parse_key(key_path, &key_pem)?;
            debug!(path = %key_path.display(), ?encoding, "Loaded client key");
            let config = builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| tls_error(key_path, &e.to_string()))?;
            (config, Some(encoding))
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!("Client certificate and key must both be set, ignoring client authentication");
            (builder.with_no_client_auth(), None)
        }
        (None, None) => (builder.with_no_client_auth(), None),
    };

    Ok(TlsMaterial {
        config: Arc::new(config),
        custom_ca,
        key_encoding,
    })
}

fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "Loaded platform trust store");
        }
        Err(e) => warn!("Platform trust store unavailable: {}", e),
    }
    roots
}

fn parse_certs(path: &Path, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, &format!("invalid PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_error(path, "no PEM certificate found"));
    }
    Ok(certs)
}

/// Picks the first private key in the file, preferring RSA, then EC, then
/// PKCS#8 when several are present.
pub fn parse_key(path: &Path, pem: &[u8]) -> Result<(KeyEncoding, PrivateKeyDer<'static>), TransportError> {
    let mut reader = pem;
    let mut found = Vec::new();
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::Pkcs1Key(key))) => found.push((KeyEncoding::Rsa, PrivateKeyDer::from(key))),
            Ok(Some(Item::Sec1Key(key))) => found.push((KeyEncoding::Ec, PrivateKeyDer::from(key))),
            Ok(Some(Item::Pkcs8Key(key))) => found.push((KeyEncoding::Pkcs8, PrivateKeyDer::from(key))),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => return Err(tls_error(path, &format!("invalid PEM: {}", e))),
        }
    }

    [KeyEncoding::Rsa, KeyEncoding::Ec, KeyEncoding::Pkcs8]
        .into_iter()
        .find_map(|wanted| {
            let index = found.iter().position(|(encoding, _)| *encoding == wanted)?;
            Some(found.swap_remove(index))
        })
        .ok_or_else(|| tls_error(path, "failed to load private key (tried RSA, EC and PKCS#8)"))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| tls_error(path, &e.to_string()))
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn tls_error(path: &Path, reason: &str) -> TransportError {
    TransportError::TlsMaterial {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
