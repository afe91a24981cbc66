//! TLS engines used by the proxy.
//!
//! Inbound TLS (client to proxy) comes from an [`SslEngineSource`]. Upstream engines are rustls
//! client configs trusting either the platform roots or, for testing setups, anything.
use crate::errors::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, ServerConfig,
  SignatureScheme,
};

/// Source of the TLS engine wrapped around accepted client connections.
pub trait SslEngineSource: Send + Sync {
  /// Server side config; `authenticate_clients` requires a client certificate.
  fn server_config(&self, authenticate_clients: bool) -> Result<Arc<ServerConfig>>;
}

/// The process default crypto provider, or ring.
pub(crate) fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Server config presenting `cert_chain` without client authentication.
pub(crate) fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;
  Ok(config)
}

/// Client config for connections to origin servers.
///
/// `trust_all` disables certificate verification entirely; otherwise the platform roots are
/// used.
pub fn upstream_client_config(trust_all: bool) -> Result<ClientConfig> {
  let builder =
    ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let config = if trust_all {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    builder
      .with_root_certificates(native_roots())
      .with_no_client_auth()
  };
  Ok(config)
}

fn native_roots() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for e in &native.errors {
    tracing::warn!("unable to load a platform certificate: {}", e);
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!("loaded {} platform roots, ignored {}", added, ignored);
  roots
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let certs = rustls_pemfile::certs(&mut &pem[..])
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::certificate_error(format!("invalid certificate PEM: {}", e)))?;
  if certs.is_empty() {
    return Err(Error::certificate_error("no certificate found in PEM"));
  }
  Ok(certs)
}

/// [`SslEngineSource`] backed by a PEM certificate chain and private key.
pub struct PemSslEngineSource {
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  client_roots: Option<Arc<RootCertStore>>,
}

impl PemSslEngineSource {
  /// Load the chain and key from PEM text
  pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
    let cert_chain = read_certs(cert_pem)?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
      .map_err(|e| Error::certificate_error(format!("invalid key PEM: {}", e)))?
      .ok_or_else(|| Error::certificate_error("no private key found in PEM"))?;
    Ok(Self {
      cert_chain,
      key,
      client_roots: None,
    })
  }

  /// Trust anchors for client certificates
  pub fn with_client_roots(mut self, roots_pem: &[u8]) -> Result<Self> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(roots_pem)? {
      roots.add(cert)?;
    }
    self.client_roots = Some(Arc::new(roots));
    Ok(self)
  }
}

impl SslEngineSource for PemSslEngineSource {
  fn server_config(&self, authenticate_clients: bool) -> Result<Arc<ServerConfig>> {
    if !authenticate_clients {
      return server_config(self.cert_chain.clone(), self.key.clone_key()).map(Arc::new);
    }
    let roots = self.client_roots.clone().ok_or_else(|| {
      Error::config_error("client authentication requires client trust anchors")
    })?;
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
      .build()
      .map_err(|e| Error::config_error(format!("invalid client verifier: {}", e)))?;
    let config = ServerConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()?
      .with_client_cert_verifier(verifier)
      .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
    Ok(Arc::new(config))
  }
}

/// Accepts any server certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn self_signed() -> (String, String) {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
  }

  #[test]
  fn pem_source_builds_server_config() {
    let (cert, key) = self_signed();
    let source = PemSslEngineSource::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
    assert!(source.server_config(false).is_ok());
    // no client roots configured
    assert!(matches!(source.server_config(true), Err(Error::Config(_))));

    let source = source.with_client_roots(cert.as_bytes()).unwrap();
    assert!(source.server_config(true).is_ok());
  }

  #[test]
  fn pem_source_rejects_garbage() {
    assert!(PemSslEngineSource::from_pem(b"not pem", b"not pem").is_err());
  }

  #[test]
  fn trust_all_client_config() {
    let config = upstream_client_config(true).unwrap();
    assert!(config.alpn_protocols.is_empty());
  }
}
