//! Interception policy for CONNECT tunnels.
//!
//! A [`MitmManager`] supplies the two TLS engines needed to intercept a tunnel: one presented
//! to the client and one used toward the origin. A [`SelectiveMitmManager`] also decides, per
//! peer, whether a tunnel is intercepted at all.
use crate::errors::Result;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

/// Supplies the TLS engines used to intercept a tunnel.
pub trait MitmManager: Send + Sync {
  /// Engine presented to the client, impersonating `peer_host`.
  fn client_ssl_engine_for(&self, peer_host: &str) -> Result<Arc<ServerConfig>>;

  /// Engine used for the connection to the origin.
  fn server_ssl_engine(&self, peer_host: &str, peer_port: u16) -> Result<Arc<ClientConfig>>;

  /// Selective view of this manager, when it has one.
  fn as_selective(&self) -> Option<&dyn SelectiveMitmManager> {
    None
  }
}

/// A [`MitmManager`] that intercepts only some peers.
pub trait SelectiveMitmManager: MitmManager {
  /// Whether a tunnel to `host:port` is intercepted. Must not block.
  fn should_mitm_peer(&self, host: &str, port: u16) -> bool;

  /// Add a peer, given as `host:port`, to the intercepted set.
  fn add_allowed(&self, host_and_port: &str);

  /// Remove a peer, given as `host:port`, from the intercepted set.
  fn remove_allowed(&self, host_and_port: &str);
}

/// Decide whether a CONNECT tunnel to `host:port` is intercepted by `manager`.
///
/// Managers without a selective view intercept every tunnel.
pub fn should_intercept(manager: &dyn MitmManager, host: &str, port: u16) -> bool {
  match manager.as_selective() {
    Some(selective) => selective.should_mitm_peer(host, port),
    None => true,
  }
}

/// Normalize a peer to the lowercase `host:port` key used by the allow-list.
pub(crate) fn peer_key(host: &str, port: u16) -> String {
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.contains(':') {
    format!("[{}]:{}", host.to_ascii_lowercase(), port)
  } else {
    format!("{}:{}", host.to_ascii_lowercase(), port)
  }
}

/// Selective manager intercepting only allow-listed peers.
///
/// The list is empty by default, so nothing is intercepted until a peer is added. Changes are
/// visible to the next decision.
pub struct AllowListMitmManager<M> {
  inner: M,
  allowed: RwLock<HashSet<String>>,
}

impl<M: MitmManager> AllowListMitmManager<M> {
  /// Wrap `inner` with an empty allow-list
  pub fn new(inner: M) -> Self {
    Self {
      inner,
      allowed: RwLock::new(HashSet::new()),
    }
  }

  /// Wrap `inner` with an initial allow-list
  pub fn with_allowed<I, S>(inner: M, peers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let manager = Self::new(inner);
    for peer in peers {
      manager.add_allowed(peer.as_ref());
    }
    manager
  }

  /// Snapshot of the allow-list
  pub fn allowed(&self) -> Vec<String> {
    let mut peers: Vec<String> = self.allowed.read().iter().cloned().collect();
    peers.sort();
    peers
  }

  /// The wrapped manager
  pub fn inner(&self) -> &M {
    &self.inner
  }
}

fn normalize(host_and_port: &str) -> String {
  let value = host_and_port.trim();
  match value.rsplit_once(':') {
    Some((host, port)) => match port.parse::<u16>() {
      Ok(port) => peer_key(host, port),
      Err(_) => value.to_ascii_lowercase(),
    },
    None => value.to_ascii_lowercase(),
  }
}

impl<M: MitmManager> MitmManager for AllowListMitmManager<M> {
  fn client_ssl_engine_for(&self, peer_host: &str) -> Result<Arc<ServerConfig>> {
    self.inner.client_ssl_engine_for(peer_host)
  }

  fn server_ssl_engine(&self, peer_host: &str, peer_port: u16) -> Result<Arc<ClientConfig>> {
    self.inner.server_ssl_engine(peer_host, peer_port)
  }

  fn as_selective(&self) -> Option<&dyn SelectiveMitmManager> {
    Some(self)
  }
}

impl<M: MitmManager> SelectiveMitmManager for AllowListMitmManager<M> {
  fn should_mitm_peer(&self, host: &str, port: u16) -> bool {
    self.allowed.read().contains(&peer_key(host, port))
  }

  fn add_allowed(&self, host_and_port: &str) {
    let key = normalize(host_and_port);
    tracing::debug!("intercepting {}", key);
    self.allowed.write().insert(key);
  }

  fn remove_allowed(&self, host_and_port: &str) {
    let key = normalize(host_and_port);
    tracing::debug!("no longer intercepting {}", key);
    self.allowed.write().remove(&key);
  }
}
