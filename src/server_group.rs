//! Runtime handles shared by a group of proxy servers.
use crate::config::TransportProtocol;
use crate::errors::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a proxy server inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(u64);

impl ServerId {
  pub(crate) fn next() -> Self {
    ServerId(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for ServerId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "proxy-{}", self.0)
  }
}

/// The three runtimes a server uses for one transport.
#[derive(Debug, Clone)]
pub struct WorkerPools {
  /// runs accept loops
  pub acceptor: Handle,
  /// serves client connections
  pub client_to_proxy: Handle,
  /// drives upstream work such as the traffic shaper
  pub proxy_to_server: Handle,
}

impl WorkerPools {
  /// Use `handle` for every role
  pub fn single(handle: Handle) -> Self {
    Self {
      acceptor: handle.clone(),
      client_to_proxy: handle.clone(),
      proxy_to_server: handle,
    }
  }
}

struct GroupInner {
  name: String,
  tcp: WorkerPools,
  sctp: WorkerPools,
  registered: Mutex<Vec<ServerId>>,
  stopped: AtomicBool,
}

/// Shared pools for proxy servers.
///
/// Servers register on start and unregister on stop; the group stops once its last server
/// is gone and refuses new registrations afterwards.
#[derive(Clone)]
pub struct ServerGroup {
  inner: Arc<GroupInner>,
}

impl ServerGroup {
  /// Create a group running on the current tokio runtime
  pub fn new(name: impl Into<String>) -> Result<Self> {
    let handle = Handle::try_current().map_err(|e| {
      Error::Runtime(format!("a tokio runtime is required to run a proxy server: {}", e))
    })?;
    let pools = WorkerPools::single(handle);
    Ok(Self::with_pools(name, pools.clone(), pools))
  }

  /// Create a group with explicit runtimes for each transport
  pub fn with_pools(name: impl Into<String>, tcp: WorkerPools, sctp: WorkerPools) -> Self {
    Self {
      inner: Arc::new(GroupInner {
        name: name.into(),
        tcp,
        sctp,
        registered: Mutex::new(Vec::new()),
        stopped: AtomicBool::new(false),
      }),
    }
  }

  /// Group name used in logs
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Pools serving `protocol`
  pub fn pools_for(&self, protocol: TransportProtocol) -> &WorkerPools {
    match protocol {
      TransportProtocol::Tcp => &self.inner.tcp,
      TransportProtocol::Sctp => &self.inner.sctp,
    }
  }

  /// The group has shut down
  pub fn is_stopped(&self) -> bool {
    self.inner.stopped.load(Ordering::Acquire)
  }

  /// Record a starting server
  pub fn register_proxy_server(&self, id: ServerId) -> Result<()> {
    let mut registered = self.inner.registered.lock();
    if self.is_stopped() {
      return Err(Error::ServerGroupStopped(self.inner.name.clone()));
    }
    if !registered.contains(&id) {
      registered.push(id);
    }
    Ok(())
  }

  /// Remove a stopping server, stopping the group when it was the last one.
  pub fn unregister_proxy_server(&self, id: ServerId, graceful: bool) {
    let mut registered = self.inner.registered.lock();
    let before = registered.len();
    registered.retain(|server| *server != id);
    if registered.len() == before {
      tracing::warn!(
        "{} was not registered with server group {}",
        id,
        self.inner.name
      );
      return;
    }
    if registered.is_empty() {
      self.inner.stopped.store(true, Ordering::Release);
      tracing::info!(
        "server group {} stopped ({})",
        self.inner.name,
        if graceful { "graceful" } else { "abrupt" }
      );
    }
  }

  /// Servers currently registered
  pub fn registered_servers(&self) -> Vec<ServerId> {
    self.inner.registered.lock().clone()
  }
}

impl fmt::Debug for ServerGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServerGroup")
      .field("name", &self.inner.name)
      .field("registered", &self.registered_servers())
      .field("stopped", &self.is_stopped())
      .finish()
  }
}
