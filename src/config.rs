//! Proxy server configuration
use crate::auth::ProxyAuthenticator;
use crate::errors::{Error, Result};
use crate::filters::HttpFiltersSource;
use crate::mitm::MitmManager;
use crate::tls::SslEngineSource;
use crate::upstream::{ChainedProxyManager, HostResolver};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum length of the request line.
pub const DEFAULT_MAX_INITIAL_LINE_LENGTH: usize = 8192;
/// Default maximum size of the request header block.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192 * 2;
/// Default maximum size of a relayed chunk.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8192 * 2;
/// Default idle timeout for client and server connections.
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(70);
/// Default timeout when connecting to an upstream server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(40_000);
/// Alias used in the Via header when the local hostname cannot be resolved.
pub const FALLBACK_PROXY_ALIAS: &str = "slinger-proxy";

/// Transport used by the listening socket and the upstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportProtocol {
  /// Reliable byte stream (TCP)
  #[default]
  Tcp,
  /// Message oriented but reliable transport (one-to-one SCTP)
  Sctp,
}

impl fmt::Display for TransportProtocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TransportProtocol::Tcp => f.write_str("TCP"),
      TransportProtocol::Sctp => f.write_str("SCTP"),
    }
  }
}

impl FromStr for TransportProtocol {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "tcp" => Ok(TransportProtocol::Tcp),
      "sctp" => Ok(TransportProtocol::Sctp),
      _ => Err(Error::UnknownTransportProtocol(s.to_string())),
    }
  }
}

/// Limits applied while decoding client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolLimits {
  max_initial_line_length: usize,
  max_header_size: usize,
  max_chunk_size: usize,
}

impl Default for ProtocolLimits {
  fn default() -> Self {
    Self {
      max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
      max_header_size: DEFAULT_MAX_HEADER_SIZE,
      max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
    }
  }
}

impl ProtocolLimits {
  /// Create limits, every value must be positive.
  pub fn new(
    max_initial_line_length: usize,
    max_header_size: usize,
    max_chunk_size: usize,
  ) -> Result<Self> {
    for (name, value) in [
      ("max_initial_line_length", max_initial_line_length),
      ("max_header_size", max_header_size),
      ("max_chunk_size", max_chunk_size),
    ] {
      if value == 0 {
        return Err(Error::config_error(format!("{} must be positive", name)));
      }
    }
    Ok(Self {
      max_initial_line_length,
      max_header_size,
      max_chunk_size,
    })
  }
  /// Maximum length of the request line
  pub fn max_initial_line_length(&self) -> usize {
    self.max_initial_line_length
  }
  /// Maximum size of the header block
  pub fn max_header_size(&self) -> usize {
    self.max_header_size
  }
  /// Maximum size of a relayed chunk
  pub fn max_chunk_size(&self) -> usize {
    self.max_chunk_size
  }
}

/// Bandwidth limits in bytes per second, 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThrottleSetting {
  /// proxy-to-server read limit
  pub read_bytes_per_second: u64,
  /// proxy-to-server write limit
  pub write_bytes_per_second: u64,
}

impl ThrottleSetting {
  /// Create a throttle setting
  pub fn new(read_bytes_per_second: u64, write_bytes_per_second: u64) -> Self {
    Self {
      read_bytes_per_second,
      write_bytes_per_second,
    }
  }
  /// At least one direction is limited.
  pub fn is_enabled(&self) -> bool {
    self.read_bytes_per_second > 0 || self.write_bytes_per_second > 0
  }
}

/// Everything a proxy server needs to bind and serve connections.
///
/// Built through [`ProxyServerBuilder`](crate::ProxyServerBuilder). The timeouts stored here are
/// the initial values; the running server keeps its own mutable copy.
#[derive(Clone)]
pub struct ProxyServerConfig {
  pub(crate) transport_protocol: TransportProtocol,
  pub(crate) requested_address: SocketAddr,
  pub(crate) ssl_engine_source: Option<Arc<dyn SslEngineSource>>,
  pub(crate) authenticate_ssl_clients: bool,
  pub(crate) proxy_authenticator: Option<Arc<dyn ProxyAuthenticator>>,
  pub(crate) chain_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
  pub(crate) mitm_manager: Option<Arc<dyn MitmManager>>,
  pub(crate) filters_source: Arc<dyn HttpFiltersSource>,
  pub(crate) transparent: bool,
  pub(crate) idle_connection_timeout: Duration,
  pub(crate) connect_timeout: Duration,
  pub(crate) server_resolver: Arc<dyn HostResolver>,
  pub(crate) throttle: ThrottleSetting,
  pub(crate) local_address: Option<SocketAddr>,
  pub(crate) proxy_alias: String,
  pub(crate) limits: ProtocolLimits,
  pub(crate) allow_requests_to_origin_server: bool,
}

impl ProxyServerConfig {
  /// Transport used by the listener
  pub fn transport_protocol(&self) -> TransportProtocol {
    self.transport_protocol
  }
  /// Address the server attempts to bind to
  pub fn requested_address(&self) -> SocketAddr {
    self.requested_address
  }
  /// Source of TLS engines for client connections
  pub fn ssl_engine_source(&self) -> Option<&Arc<dyn SslEngineSource>> {
    self.ssl_engine_source.as_ref()
  }
  /// Require client certificates on inbound TLS
  pub fn authenticate_ssl_clients(&self) -> bool {
    self.authenticate_ssl_clients
  }
  /// Proxy credential validation
  pub fn proxy_authenticator(&self) -> Option<&Arc<dyn ProxyAuthenticator>> {
    self.proxy_authenticator.as_ref()
  }
  /// Upstream proxy selection
  pub fn chain_proxy_manager(&self) -> Option<&Arc<dyn ChainedProxyManager>> {
    self.chain_proxy_manager.as_ref()
  }
  /// Interception capability for CONNECT requests
  pub fn mitm_manager(&self) -> Option<&Arc<dyn MitmManager>> {
    self.mitm_manager.as_ref()
  }
  /// Request filters
  pub fn filters_source(&self) -> &Arc<dyn HttpFiltersSource> {
    &self.filters_source
  }
  /// Run without Via headers
  pub fn is_transparent(&self) -> bool {
    self.transparent
  }
  /// Initial idle timeout
  pub fn idle_connection_timeout(&self) -> Duration {
    self.idle_connection_timeout
  }
  /// Initial upstream connect timeout
  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }
  /// Upstream address resolution
  pub fn server_resolver(&self) -> &Arc<dyn HostResolver> {
    &self.server_resolver
  }
  /// Initial throttle
  pub fn throttle(&self) -> ThrottleSetting {
    self.throttle
  }
  /// Interface used for outbound connections
  pub fn local_address(&self) -> Option<SocketAddr> {
    self.local_address
  }
  /// Alias used in the Via header
  pub fn proxy_alias(&self) -> &str {
    &self.proxy_alias
  }
  /// Request decoding limits
  pub fn limits(&self) -> ProtocolLimits {
    self.limits
  }
  /// Accept origin-form request targets
  pub fn allow_requests_to_origin_server(&self) -> bool {
    self.allow_requests_to_origin_server
  }
}

impl fmt::Debug for ProxyServerConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProxyServerConfig")
      .field("transport_protocol", &self.transport_protocol)
      .field("requested_address", &self.requested_address)
      .field("ssl_engine_source", &self.ssl_engine_source.is_some())
      .field("authenticate_ssl_clients", &self.authenticate_ssl_clients)
      .field("proxy_authenticator", &self.proxy_authenticator.is_some())
      .field("chain_proxy_manager", &self.chain_proxy_manager.is_some())
      .field("mitm_manager", &self.mitm_manager.is_some())
      .field("transparent", &self.transparent)
      .field("idle_connection_timeout", &self.idle_connection_timeout)
      .field("connect_timeout", &self.connect_timeout)
      .field("throttle", &self.throttle)
      .field("local_address", &self.local_address)
      .field("proxy_alias", &self.proxy_alias)
      .field("limits", &self.limits)
      .field(
        "allow_requests_to_origin_server",
        &self.allow_requests_to_origin_server,
      )
      .finish()
  }
}

/// Resolve the local hostname, falling back to [`FALLBACK_PROXY_ALIAS`].
pub(crate) fn default_proxy_alias() -> String {
  match hostname::get().map(|name| name.into_string()) {
    Ok(Ok(name)) if !name.trim().is_empty() => name.trim().to_string(),
    Ok(Ok(_)) => FALLBACK_PROXY_ALIAS.to_string(),
    Ok(Err(raw)) => {
      tracing::debug!("hostname {:?} is not UTF-8, using {}", raw, FALLBACK_PROXY_ALIAS);
      FALLBACK_PROXY_ALIAS.to_string()
    }
    Err(e) => {
      tracing::debug!("unable to resolve hostname, using {}: {}", FALLBACK_PROXY_ALIAS, e);
      FALLBACK_PROXY_ALIAS.to_string()
    }
  }
}
