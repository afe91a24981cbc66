//! Identity of the certificate authority used for interception.
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const DEFAULT_ALIAS: &str = "slinger-proxy-mitm";
const DEFAULT_PASSWORD: &str = "Be Your Own Lantern";
const DEFAULT_ORGANIZATION: &str = "Slinger Proxy";

/// Where the CA lives on disk and how it and its leaves are named.
///
/// Immutable once built. `alias` names the files under `storage_directory`.
#[derive(Clone, PartialEq, Eq)]
pub struct Authority {
  storage_directory: PathBuf,
  alias: String,
  password: String,
  common_name: String,
  organization: String,
  organizational_unit_name: String,
  cert_organization: String,
  cert_organizational_unit_name: String,
}

impl Default for Authority {
  fn default() -> Self {
    Self {
      storage_directory: PathBuf::from("."),
      alias: DEFAULT_ALIAS.to_string(),
      password: DEFAULT_PASSWORD.to_string(),
      common_name: "Slinger Proxy MITM, describe proxy here".to_string(),
      organization: DEFAULT_ORGANIZATION.to_string(),
      organizational_unit_name: "Certificate Authority".to_string(),
      cert_organization: DEFAULT_ORGANIZATION.to_string(),
      cert_organizational_unit_name: "Slinger Proxy, describe proxy purpose here".to_string(),
    }
  }
}

impl Authority {
  /// Authority stored under `storage_directory` as `alias`, with default subject names.
  pub fn new(
    storage_directory: impl Into<PathBuf>,
    alias: impl Into<String>,
    password: impl Into<String>,
  ) -> Self {
    Self {
      storage_directory: storage_directory.into(),
      alias: alias.into(),
      password: password.into(),
      ..Self::default()
    }
  }

  /// Set the subject of the root certificate
  pub fn with_subject(
    mut self,
    common_name: impl Into<String>,
    organization: impl Into<String>,
    organizational_unit_name: impl Into<String>,
  ) -> Self {
    self.common_name = common_name.into();
    self.organization = organization.into();
    self.organizational_unit_name = organizational_unit_name.into();
    self
  }

  /// Set the organization fields of generated leaf certificates
  pub fn with_cert_subject(
    mut self,
    cert_organization: impl Into<String>,
    cert_organizational_unit_name: impl Into<String>,
  ) -> Self {
    self.cert_organization = cert_organization.into();
    self.cert_organizational_unit_name = cert_organizational_unit_name.into();
    self
  }

  /// Path of the artifact `<storage_directory>/<alias><extension>`.
  ///
  /// The first call creates the directory and an empty placeholder file. Failures are logged
  /// and the path is returned anyway.
  pub fn artifact_path(&self, extension: &str) -> PathBuf {
    let path = self
      .storage_directory
      .join(format!("{}{}", self.alias, extension));
    if !self.storage_directory.exists() {
      if let Err(e) = std::fs::create_dir_all(&self.storage_directory) {
        tracing::error!(
          "unable to create storage directory {}: {}",
          self.storage_directory.display(),
          e
        );
        return path;
      }
      create_placeholder(&path);
    }
    path
  }

  /// Directory holding the CA files
  pub fn storage_directory(&self) -> &Path {
    &self.storage_directory
  }
  /// Base name of the CA files
  pub fn alias(&self) -> &str {
    &self.alias
  }
  /// Passphrase protecting the stored key
  pub fn password(&self) -> &str {
    &self.password
  }
  /// CN of the root certificate
  pub fn common_name(&self) -> &str {
    &self.common_name
  }
  /// O of the root certificate
  pub fn organization(&self) -> &str {
    &self.organization
  }
  /// OU of the root certificate
  pub fn organizational_unit_name(&self) -> &str {
    &self.organizational_unit_name
  }
  /// O of generated leaves
  pub fn cert_organization(&self) -> &str {
    &self.cert_organization
  }
  /// OU of generated leaves
  pub fn cert_organizational_unit_name(&self) -> &str {
    &self.cert_organizational_unit_name
  }
}

fn create_placeholder(path: &Path) {
  match OpenOptions::new().write(true).create_new(true).open(path) {
    Ok(_) => {}
    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
    Err(e) => tracing::error!("unable to create {}: {}", path.display(), e),
  }
}

impl fmt::Debug for Authority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Authority")
      .field("storage_directory", &self.storage_directory)
      .field("alias", &self.alias)
      .field("password", &"<redacted>")
      .field("common_name", &self.common_name)
      .field("organization", &self.organization)
      .field("organizational_unit_name", &self.organizational_unit_name)
      .field("cert_organization", &self.cert_organization)
      .field(
        "cert_organizational_unit_name",
        &self.cert_organizational_unit_name,
      )
      .finish()
  }
}
