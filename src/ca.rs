//! Certificate authority used to impersonate intercepted hosts.
//!
//! The root certificate is derived from an [`Authority`] and stored next to its key under the
//! authority's storage directory, so clients only need to trust it once.
use crate::authority::Authority;
use crate::errors::{Error, Result};
use crate::mitm::MitmManager;
use crate::tls::{server_config, upstream_client_config};
use moka::sync::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

/// Leaf validity in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cached leaves are dropped after half their validity
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Leaves are backdated to tolerate clock skew
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity in days
const CA_VALIDITY_DAYS: i64 = 3650;

/// Root CA plus the identity it was derived from.
pub struct CertificateAuthority {
  authority: Authority,
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the root stored for `authority`, generating and saving one when absent.
  ///
  /// Empty placeholder files count as absent. The key is stored unencrypted; the
  /// authority's passphrase is not applied to it.
  pub fn new(authority: Authority) -> Result<Self> {
    let cert_path = authority.artifact_path(".pem");
    let key_path = authority.artifact_path(".key");
    let (issuer, ca_cert_der) = if has_content(&cert_path) && has_content(&key_path) {
      tracing::debug!("loading CA from {}", cert_path.display());
      load_ca(&cert_path, &key_path)?
    } else {
      tracing::info!("generating CA {} in {}", authority.alias(), cert_path.display());
      generate_ca(&authority, &cert_path, &key_path)?
    };
    Ok(Self {
      authority,
      issuer,
      ca_cert_der,
      ca_cert_path: cert_path,
    })
  }

  /// Identity this CA was derived from
  pub fn authority(&self) -> &Authority {
    &self.authority
  }

  /// Issue a leaf for `domain`, returning the chain `[leaf, root]` and the leaf key.
  pub fn generate_server_cert(
    &self,
    domain: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, self.authority.cert_organization());
    dn.push(
      DnType::OrganizationalUnitName,
      self.authority.cert_organizational_unit_name(),
    );
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(domain)?;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf for {}: {}", domain, e)))?;
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize leaf key"))?;
    Ok((
      vec![CertificateDer::from(cert.der().to_vec()), self.ca_cert_der.clone()],
      key_der,
    ))
  }

  /// Root certificate in PEM, as stored on disk
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(&self.ca_cert_path)
      .map_err(|e| Error::certificate_error(format!("failed to read CA cert: {}", e)))
  }

  /// Root certificate in DER
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Where the root certificate is stored
  pub fn ca_cert_path(&self) -> &Path {
    &self.ca_cert_path
  }
}

fn has_content(path: &Path) -> bool {
  std::fs::metadata(path)
    .map(|m| m.is_file() && m.len() > 0)
    .unwrap_or(false)
}

fn subject_alt_names(domain: &str) -> Result<Vec<SanType>> {
  let dns = || {
    domain
      .try_into()
      .map(SanType::DnsName)
      .map_err(|_| Error::certificate_error(format!("invalid domain name: {}", domain)))
  };
  match domain.parse::<IpAddr>() {
    Ok(ip) => {
      let mut sans = vec![SanType::IpAddress(ip)];
      // some clients only look at dNSName
      if let Ok(name) = dns() {
        sans.push(name);
      }
      Ok(sans)
    }
    Err(_) => Ok(vec![dns()?]),
  }
}

fn load_ca(
  cert_path: &Path,
  key_path: &Path,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
  let cert_pem = std::fs::read_to_string(cert_path)?;
  let key_pem = std::fs::read_to_string(key_path)?;
  let key_pair = KeyPair::from_pem(&key_pem)
    .map_err(|e| Error::certificate_error(format!("failed to parse CA key: {}", e)))?;
  let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
    .map_err(|e| Error::certificate_error(format!("failed to load CA cert: {}", e)))?;
  let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
    .next()
    .ok_or_else(|| Error::certificate_error("no certificate found in CA PEM"))?
    .map_err(|e| Error::certificate_error(format!("failed to parse CA PEM: {}", e)))?;
  Ok((issuer, cert_der))
}

fn generate_ca(
  authority: &Authority,
  cert_path: &Path,
  key_path: &Path,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, authority.common_name());
  dn.push(DnType::OrganizationName, authority.organization());
  dn.push(
    DnType::OrganizationalUnitName,
    authority.organizational_unit_name(),
  );
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
    KeyUsagePurpose::DigitalSignature,
  ];
  params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

  let key_pair = KeyPair::generate()
    .map_err(|e| Error::certificate_error(format!("failed to generate key pair: {}", e)))?;
  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::certificate_error(format!("failed to generate CA: {}", e)))?;
  let cert_pem = cert.pem();
  std::fs::write(cert_path, cert_pem.as_bytes())?;
  std::fs::write(key_path, key_pair.serialize_pem().as_bytes())?;

  let cert_der = CertificateDer::from(cert.der().to_vec());
  let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
    .map_err(|e| Error::certificate_error(format!("failed to create issuer: {}", e)))?;
  Ok((issuer, cert_der))
}

/// [`MitmManager`] impersonating every host with a leaf issued by a [`CertificateAuthority`].
///
/// Leaf engines are cached per host. Wrap it in an
/// [`AllowListMitmManager`](crate::AllowListMitmManager) to intercept selectively.
pub struct CertificateSniffingMitmManager {
  ca: CertificateAuthority,
  engines: Cache<String, Arc<ServerConfig>>,
  upstream: Arc<ClientConfig>,
}

impl CertificateSniffingMitmManager {
  /// Manager using the CA stored for `authority`, verifying origins against platform roots.
  pub fn new(authority: Authority) -> Result<Self> {
    Ok(Self::with_ca(
      CertificateAuthority::new(authority)?,
      upstream_client_config(false)?,
    ))
  }

  fn with_ca(ca: CertificateAuthority, upstream: ClientConfig) -> Self {
    let engines = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Self {
      ca,
      engines,
      upstream: Arc::new(upstream),
    }
  }

  /// Stop verifying origin certificates.
  pub fn trust_all_servers(self) -> Result<Self> {
    Ok(Self::with_ca(self.ca, upstream_client_config(true)?))
  }

  /// The underlying CA
  pub fn ca(&self) -> &CertificateAuthority {
    &self.ca
  }

  /// Root certificate in PEM for client installation
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Where the root certificate is stored
  pub fn ca_cert_path(&self) -> &Path {
    self.ca.ca_cert_path()
  }
}

impl MitmManager for CertificateSniffingMitmManager {
  fn client_ssl_engine_for(&self, peer_host: &str) -> Result<Arc<ServerConfig>> {
    let host = peer_host
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_ascii_lowercase();
    if let Some(engine) = self.engines.get(&host) {
      return Ok(engine);
    }
    let (chain, key) = self.ca.generate_server_cert(&host)?;
    let engine = Arc::new(server_config(chain, key)?);
    self.engines.insert(host, engine.clone());
    Ok(engine)
  }

  fn server_ssl_engine(&self, _peer_host: &str, _peer_port: u16) -> Result<Arc<ClientConfig>> {
    Ok(self.upstream.clone())
  }
}
