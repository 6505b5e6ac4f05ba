//! TLS configuration and trust material
//!
use crate::ca::LeafCertificate;
use crate::error::{Error, Result};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

/// ALPN identifier offered by the interception listener; only HTTP/1.1 is spoken.
const HTTP11_ALPN: &[u8] = b"http/1.1";

/// Represents a trusted X509 certificate.
#[derive(Clone, Debug)]
pub struct Certificate {
  der: CertificateDer<'static>,
}

impl Certificate {
  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem_bundle);
    let certs = rustls_pemfile::certs(&mut reader)
      .map(|result| {
        result
          .map(|der| Certificate { der })
          .map_err(|e| Error::certificate_error(format!("invalid certificate encoding: {}", e)))
      })
      .collect::<Result<Vec<_>>>()?;
    if certs.is_empty() {
      return Err(Error::certificate_error("no certificate found in PEM bundle"));
    }
    Ok(certs)
  }

  /// Read a PEM bundle from disk
  pub async fn from_pem_file(path: impl AsRef<Path>) -> Result<Vec<Certificate>> {
    let path = path.as_ref();
    let pem = tokio::fs::read(path).await.map_err(|e| {
      Error::certificate_error(format!("cannot read CA bundle {}: {}", path.display(), e))
    })?;
    Self::from_pem_bundle(&pem)
  }

  pub(crate) fn add_to_tls(self, root_cert_store: &mut RootCertStore) -> Result<()> {
    root_cert_store
      .add(self.der)
      .map_err(|e| Error::certificate_error(format!("unusable trust anchor: {}", e)))
  }
}

/// The process-wide crypto provider, falling back to ring.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server context presenting `leaf` (chained to its root) to the client.
pub(crate) fn server_config(leaf: &LeafCertificate) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.chain(), leaf.private_key())
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_bundle_is_rejected() {
    assert!(Certificate::from_pem_bundle(b"").is_err());
    assert!(Certificate::from_pem_bundle(b"not a pem").is_err());
  }
}
