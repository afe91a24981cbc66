//! Builder for [`ProxyServer`].
use crate::auth::ProxyAuthenticator;
use crate::config::{
  default_proxy_alias, ProtocolLimits, ProxyServerConfig, ThrottleSetting, TransportProtocol,
  DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_CONNECTION_TIMEOUT, DEFAULT_MAX_CHUNK_SIZE,
  DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_INITIAL_LINE_LENGTH,
};
use crate::errors::Result;
use crate::filters::{HttpFiltersSource, HttpFiltersSourceAdapter};
use crate::mitm::MitmManager;
use crate::server::ProxyServer;
use crate::server_group::ServerGroup;
use crate::tls::SslEngineSource;
use crate::upstream::{ChainedProxyManager, DefaultHostResolver, HostResolver};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;

/// Configures and creates a [`ProxyServer`].
///
/// Inbound TLS (`ssl_engine_source`) and interception (`mitm_manager`) exclude each other;
/// setting one clears the other.
pub struct ProxyServerBuilder {
  server_group: Option<ServerGroup>,
  transport_protocol: TransportProtocol,
  address: SocketAddr,
  ssl_engine_source: Option<Arc<dyn SslEngineSource>>,
  authenticate_ssl_clients: bool,
  proxy_authenticator: Option<Arc<dyn ProxyAuthenticator>>,
  chain_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
  mitm_manager: Option<Arc<dyn MitmManager>>,
  filters_source: Arc<dyn HttpFiltersSource>,
  transparent: bool,
  idle_connection_timeout: Duration,
  connect_timeout: Duration,
  server_resolver: Arc<dyn HostResolver>,
  throttle: ThrottleSetting,
  local_address: Option<SocketAddr>,
  proxy_alias: Option<String>,
  max_initial_line_length: usize,
  max_header_size: usize,
  max_chunk_size: usize,
  allow_requests_to_origin_server: bool,
}

impl Default for ProxyServerBuilder {
  fn default() -> Self {
    Self {
      server_group: None,
      transport_protocol: TransportProtocol::Tcp,
      address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
      ssl_engine_source: None,
      authenticate_ssl_clients: false,
      proxy_authenticator: None,
      chain_proxy_manager: None,
      mitm_manager: None,
      filters_source: Arc::new(HttpFiltersSourceAdapter),
      transparent: false,
      idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
      connect_timeout: DEFAULT_CONNECT_TIMEOUT,
      server_resolver: Arc::new(DefaultHostResolver),
      throttle: ThrottleSetting::default(),
      local_address: None,
      proxy_alias: None,
      max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
      max_header_size: DEFAULT_MAX_HEADER_SIZE,
      max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
      allow_requests_to_origin_server: false,
    }
  }
}

impl ProxyServerBuilder {
  /// Share runtimes with other servers of `group`
  pub fn server_group(mut self, group: ServerGroup) -> Self {
    self.server_group = Some(group);
    self
  }

  /// Transport of the listener and upstream connections
  pub fn transport_protocol(mut self, protocol: TransportProtocol) -> Self {
    self.transport_protocol = protocol;
    self
  }

  /// Address to listen on
  pub fn address(mut self, address: SocketAddr) -> Self {
    self.address = address;
    self
  }

  /// Port to listen on, keeping the current IP. 0 picks an ephemeral port.
  pub fn port(mut self, port: u16) -> Self {
    self.address.set_port(port);
    self
  }

  /// Wrap client connections in TLS
  pub fn ssl_engine_source(mut self, source: Arc<dyn SslEngineSource>) -> Self {
    if self.mitm_manager.take().is_some() {
      tracing::warn!("enabling inbound TLS disables the configured MITM manager");
    }
    self.ssl_engine_source = Some(source);
    self
  }

  /// Require client certificates on inbound TLS
  pub fn authenticate_ssl_clients(mut self, authenticate: bool) -> Self {
    self.authenticate_ssl_clients = authenticate;
    self
  }

  /// Require proxy credentials
  pub fn proxy_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
    self.proxy_authenticator = Some(authenticator);
    self
  }

  /// Route requests through upstream proxies
  pub fn chain_proxy_manager(mut self, manager: Arc<dyn ChainedProxyManager>) -> Self {
    self.chain_proxy_manager = Some(manager);
    self
  }

  /// Intercept CONNECT tunnels
  pub fn mitm_manager(mut self, manager: Arc<dyn MitmManager>) -> Self {
    if self.ssl_engine_source.take().is_some() {
      tracing::warn!("enabling MITM disables the configured inbound TLS");
    }
    self.mitm_manager = Some(manager);
    self
  }

  /// Request filters
  pub fn filters_source(mut self, filters: Arc<dyn HttpFiltersSource>) -> Self {
    self.filters_source = filters;
    self
  }

  /// Omit Via headers
  pub fn transparent(mut self, transparent: bool) -> Self {
    self.transparent = transparent;
    self
  }

  /// Idle timeout of client and server connections, 0 disables it
  pub fn idle_connection_timeout(mut self, timeout: Duration) -> Self {
    self.idle_connection_timeout = timeout;
    self
  }

  /// Timeout for connecting upstream, 0 disables it
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Resolver for origin hosts
  pub fn server_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
    self.server_resolver = resolver;
    self
  }

  /// Initial bandwidth limits in bytes per second
  pub fn throttling(mut self, read_bytes_per_second: u64, write_bytes_per_second: u64) -> Self {
    self.throttle = ThrottleSetting::new(read_bytes_per_second, write_bytes_per_second);
    self
  }

  /// Bind upstream connections to this local address
  pub fn network_interface(mut self, local_address: SocketAddr) -> Self {
    self.local_address = Some(local_address);
    self
  }

  /// Alias used in Via headers, defaults to the host name
  pub fn proxy_alias(mut self, alias: impl Into<String>) -> Self {
    self.proxy_alias = Some(alias.into());
    self
  }

  /// Maximum request line length
  pub fn max_initial_line_length(mut self, length: usize) -> Self {
    self.max_initial_line_length = length;
    self
  }

  /// Maximum header block size
  pub fn max_header_size(mut self, size: usize) -> Self {
    self.max_header_size = size;
    self
  }

  /// Maximum relayed chunk size
  pub fn max_chunk_size(mut self, size: usize) -> Self {
    self.max_chunk_size = size;
    self
  }

  /// Accept origin-form requests, routing them by `Host`
  pub fn allow_requests_to_origin_server(mut self, allow: bool) -> Self {
    self.allow_requests_to_origin_server = allow;
    self
  }

  /// Create the server without starting it.
  ///
  /// Without an explicit group the server gets its own group on the current tokio runtime.
  pub fn build(self) -> Result<ProxyServer> {
    let limits = ProtocolLimits::new(
      self.max_initial_line_length,
      self.max_header_size,
      self.max_chunk_size,
    )?;
    let server_group = match self.server_group {
      Some(group) => group,
      None => ServerGroup::new(format!("slinger-proxy-{}", self.address))?,
    };
    let proxy_alias = self
      .proxy_alias
      .filter(|alias| !alias.trim().is_empty())
      .unwrap_or_else(default_proxy_alias);
    let config = ProxyServerConfig {
      transport_protocol: self.transport_protocol,
      requested_address: self.address,
      ssl_engine_source: self.ssl_engine_source,
      authenticate_ssl_clients: self.authenticate_ssl_clients,
      proxy_authenticator: self.proxy_authenticator,
      chain_proxy_manager: self.chain_proxy_manager,
      mitm_manager: self.mitm_manager,
      filters_source: self.filters_source,
      transparent: self.transparent,
      idle_connection_timeout: self.idle_connection_timeout,
      connect_timeout: self.connect_timeout,
      server_resolver: self.server_resolver,
      throttle: self.throttle,
      local_address: self.local_address,
      proxy_alias,
      limits,
      allow_requests_to_origin_server: self.allow_requests_to_origin_server,
    };
    Ok(ProxyServer::new(server_group, config))
  }

  /// Build and start the server
  pub fn start(self) -> Result<ProxyServer> {
    let server = self.build()?;
    server.start()?;
    Ok(server)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::Error;

  #[tokio::test]
  async fn defaults() {
    let server = ProxyServerBuilder::default().build().unwrap();
    let config = server.config();
    assert_eq!(
      config.requested_address(),
      "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(config.transport_protocol(), TransportProtocol::Tcp);
    assert_eq!(config.idle_connection_timeout(), Duration::from_secs(70));
    assert_eq!(config.connect_timeout(), Duration::from_secs(40));
    match hostname::get().map(|name| name.into_string()) {
      Ok(Ok(name)) if !name.trim().is_empty() => assert_eq!(config.proxy_alias(), name.trim()),
      _ => assert_eq!(config.proxy_alias(), crate::config::FALLBACK_PROXY_ALIAS),
    }
    assert!(server.traffic_shaper().is_none());
  }

  #[tokio::test]
  async fn zero_limits_are_rejected() {
    let result = ProxyServerBuilder::default().max_chunk_size(0).build();
    assert!(matches!(result, Err(Error::Config(_))));
  }

  #[tokio::test]
  async fn throttling_creates_shaper() {
    let server = ProxyServerBuilder::default()
      .throttling(100, 0)
      .proxy_alias("edge")
      .build()
      .unwrap();
    assert_eq!(server.read_throttle(), 100);
    assert_eq!(server.proxy_alias(), "edge");
  }
}
