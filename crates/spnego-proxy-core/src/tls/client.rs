//! TLS client configuration for outbound backend connections.
//!
//! Builds the rustls `ClientConfig` handed to the hyper-rustls connector when
//! the target URL is `https`.

use std::io::BufReader;
use std::path::Path;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::config::TargetTlsConfig;
use crate::error::{TlsError, TlsResult};

/// Install the ring crypto provider if not already installed.
fn ensure_crypto_provider() {
    // Fails harmlessly when a provider is already installed.
    let _ = CryptoProvider::install_default(default_provider());
}

/// Build the rustls `ClientConfig` for the backend connection.
///
/// Without settings the bundled webpki roots are trusted and no client
/// certificate is presented.
///
/// # Errors
///
/// Returns an error if:
/// - Certificate files cannot be loaded
/// - Private key files cannot be loaded
/// - The client certificate and key do not match
pub fn build_client_config(config: Option<&TargetTlsConfig>) -> TlsResult<ClientConfig> {
    ensure_crypto_provider();

    let default_config = TargetTlsConfig::default();
    let config = config.unwrap_or(&default_config);
    let root_store = build_root_store(config)?;

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let client_config = match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            debug!("loading client certificate for backend mTLS");
            let certs = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(TlsError::Config(
                "cert_path and key_path must be set together".to_string(),
            ))
        }
    };

    Ok(client_config)
}

/// Build the root certificate store.
fn build_root_store(config: &TargetTlsConfig) -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = &config.ca_cert_path {
        debug!(path = %ca_path.display(), "loading custom CA certificate");
        let certs = load_certificates(ca_path)?;
        let (added, ignored) = root_store.add_parsable_certificates(certs);
        debug!(added, ignored, "added CA certificates to trust store");

        if added == 0 {
            return Err(TlsError::NoCertificates(ca_path.display().to_string()));
        }
    } else {
        debug!("using webpki root certificates");
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(root_store)
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}
