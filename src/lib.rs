#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-proxy
//!
//! An intercepting HTTP/HTTPS proxy server built on tokio and rustls.
//!
//! - Plain HTTP forwarding and CONNECT tunnelling
//! - Selective man-in-the-middle interception with a generated certificate authority
//! - Chained upstream proxies
//! - Global bandwidth throttling
//! - Lifecycle control: start, graceful stop, abort
//!
//! ## Starting a proxy
//!
//! ```no_run
//! # async fn run() -> slinger_proxy::Result<()> {
//! let server = slinger_proxy::ProxyServer::bootstrap()
//!   .port(0)
//!   .proxy_alias("edge")
//!   .start()?;
//! println!("listening on {:?}", server.listen_address());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Process exit
//!
//! Every started server installs an exit hook that calls [`ProxyServer::abort`], and an
//! explicit stop or abort removes it again. The first start in a process spawns a Ctrl-C
//! listener which runs the hooks and exits with status 130. Applications with other exit
//! paths call [`run_shutdown_hooks`] themselves.
//!
//! ## Interception
//!
//! Interception is enabled with a [`MitmManager`]. [`CertificateSniffingMitmManager`]
//! impersonates hosts with leaves issued by a CA derived from an [`Authority`]; wrapping it in
//! an [`AllowListMitmManager`] limits interception to chosen `host:port` peers.
//!
//! ```no_run
//! # async fn run() -> slinger_proxy::Result<()> {
//! use slinger_proxy::{AllowListMitmManager, Authority, CertificateSniffingMitmManager};
//! use slinger_proxy::SelectiveMitmManager;
//! use std::sync::Arc;
//!
//! let authority = Authority::new("./ca", "my-proxy", "secret");
//! let manager = AllowListMitmManager::new(CertificateSniffingMitmManager::new(authority)?);
//! manager.add_allowed("example.com:443");
//! let server = slinger_proxy::ProxyServer::bootstrap()
//!   .mitm_manager(Arc::new(manager))
//!   .start()?;
//! # server.abort();
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **serde**: serialization of the plain configuration value types.
//!
mod auth;
mod authority;
mod builder;
mod ca;
mod config;
mod connection;
mod errors;
mod filters;
mod head;
mod mitm;
/// Tracking of open channels
pub mod registry;
mod server;
mod server_group;
mod shutdown_hook;
mod throttle;
mod tls;
/// Transport protocol to socket mapping
pub mod transport;
mod tunnel;
mod upstream;

pub use auth::{basic_credentials, ProxyAuthenticator};
pub use authority::Authority;
pub use builder::ProxyServerBuilder;
pub use ca::{CertificateAuthority, CertificateSniffingMitmManager};
pub use config::{
  ProtocolLimits, ProxyServerConfig, ThrottleSetting, TransportProtocol, DEFAULT_CONNECT_TIMEOUT,
  DEFAULT_IDLE_CONNECTION_TIMEOUT, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_HEADER_SIZE,
  DEFAULT_MAX_INITIAL_LINE_LENGTH, FALLBACK_PROXY_ALIAS,
};
pub use errors::{Error, Result};
pub use filters::{HttpFiltersSource, HttpFiltersSourceAdapter, ShortCircuit};
pub use head::{parse_host_port, RequestHead};
pub use mitm::{should_intercept, AllowListMitmManager, MitmManager, SelectiveMitmManager};
pub use server::ProxyServer;
pub use server_group::{ServerGroup, ServerId, WorkerPools};
pub use shutdown_hook::{
  add_shutdown_hook, remove_shutdown_hook, run_shutdown_hooks, shutdown_hook_count,
  spawn_signal_listener, HookId,
};
pub use throttle::GlobalTrafficShaper;
pub use tls::{upstream_client_config, PemSslEngineSource, SslEngineSource};
pub use tokio_rustls::rustls;
pub use upstream::{ChainedProxy, ChainedProxyManager, DefaultHostResolver, HostResolver};
