//! Proxy server lifecycle: bind, accept, and exactly-once shutdown.
use crate::builder::ProxyServerBuilder;
use crate::config::{ProxyServerConfig, ThrottleSetting};
use crate::connection::ClientToProxyConnection;
use crate::errors::{Error, Result};
use crate::registry::{ChannelGuard, ChannelInfo, ChannelKind, ConnectionRegistry};
use crate::server_group::{ServerGroup, ServerId, WorkerPools};
use crate::shutdown_hook::{add_shutdown_hook, remove_shutdown_hook, spawn_signal_listener, HookId};
use crate::throttle::GlobalTrafficShaper;
use crate::transport::{listener_strategy, ListenerStrategy};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// How long a graceful stop waits for open channels to close.
const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Window of the global traffic shaper.
const TRAFFIC_SHAPING_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A running (or runnable) proxy server.
///
/// Cloning yields another handle to the same server. Create one through
/// [`ProxyServer::bootstrap`].
///
/// ```no_run
/// # async fn run() -> slinger_proxy::Result<()> {
/// let server = slinger_proxy::ProxyServer::bootstrap().port(0).start()?;
/// println!("listening on {:?}", server.listen_address());
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProxyServer {
  inner: Arc<ServerInner>,
}

struct ServerInner {
  id: ServerId,
  server_group: ServerGroup,
  config: Arc<ProxyServerConfig>,
  idle_timeout_ms: AtomicU64,
  connect_timeout_ms: AtomicU64,
  traffic_shaper: Mutex<Option<Arc<GlobalTrafficShaper>>>,
  all_channels: ConnectionRegistry,
  bound_address: Mutex<Option<SocketAddr>>,
  stopped: AtomicBool,
  finished: AtomicBool,
  shutdown_hook: Mutex<Option<HookId>>,
}

fn millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ProxyServer {
  /// Start configuring a new server
  pub fn bootstrap() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  pub(crate) fn new(server_group: ServerGroup, config: ProxyServerConfig) -> Self {
    let id = ServerId::next();
    let throttle = config.throttle();
    let inner = ServerInner {
      id,
      idle_timeout_ms: AtomicU64::new(millis(config.idle_connection_timeout())),
      connect_timeout_ms: AtomicU64::new(millis(config.connect_timeout())),
      traffic_shaper: Mutex::new(None),
      all_channels: ConnectionRegistry::new(format!("{} channels", id)),
      bound_address: Mutex::new(None),
      stopped: AtomicBool::new(false),
      finished: AtomicBool::new(false),
      shutdown_hook: Mutex::new(None),
      server_group,
      config: Arc::new(config),
    };
    let server = Self {
      inner: Arc::new(inner),
    };
    if throttle.is_enabled() {
      server.set_throttle(throttle.read_bytes_per_second, throttle.write_bytes_per_second);
    }
    server
  }

  /// Register with the server group, install the exit hook and bind.
  ///
  /// Fails when the group is stopped or the address cannot be bound. After a bind failure
  /// the server is unusable.
  pub fn start(&self) -> Result<()> {
    let group = &self.inner.server_group;
    if group.is_stopped() {
      return Err(Error::ServerGroupStopped(group.name().to_string()));
    }
    tracing::info!(
      "starting proxy at {} ({})",
      self.inner.config.requested_address(),
      self.inner.config.transport_protocol()
    );
    group.register_proxy_server(self.inner.id)?;

    let weak: Weak<ServerInner> = Arc::downgrade(&self.inner);
    let hook = add_shutdown_hook(format!("{} exit hook", self.inner.id), move || {
      if let Some(inner) = weak.upgrade() {
        inner.abort();
      }
    })?;
    *self.inner.shutdown_hook.lock() = Some(hook);
    spawn_signal_listener(&self.pools().acceptor);

    if let Err(e) = self.inner.bind() {
      if let Some(hook) = self.inner.shutdown_hook.lock().take() {
        let _ = remove_shutdown_hook(hook);
      }
      return Err(e);
    }
    Ok(())
  }

  /// Stop gracefully, waiting up to 10 seconds for open channels to close.
  ///
  /// Returns true iff this call performed the shutdown. The shutdown runs on the group's
  /// acceptor runtime, so it completes even if the returned future is dropped.
  pub async fn stop(&self) -> bool {
    self.inner.stop().await
  }

  /// Stop immediately without waiting for channels to close.
  ///
  /// Returns true iff this call performed the shutdown.
  pub fn abort(&self) -> bool {
    self.inner.abort()
  }

  /// Shutdown has begun or completed
  pub fn is_stopped(&self) -> bool {
    self.inner.stopped.load(Ordering::Acquire)
  }

  /// Set the bandwidth limits in bytes per second, 0 meaning unlimited.
  ///
  /// The shaper is created on the first positive value and reconfigured in place afterwards.
  pub fn set_throttle(&self, read_bytes_per_second: u64, write_bytes_per_second: u64) {
    let mut shaper = self.inner.traffic_shaper.lock();
    match shaper.as_ref() {
      Some(existing) => existing.configure(write_bytes_per_second, read_bytes_per_second),
      None if read_bytes_per_second > 0 || write_bytes_per_second > 0 => {
        let handle = &self.pools().proxy_to_server;
        *shaper = Some(Arc::new(GlobalTrafficShaper::new(
          handle,
          write_bytes_per_second,
          read_bytes_per_second,
          TRAFFIC_SHAPING_CHECK_INTERVAL,
          Duration::MAX,
        )));
      }
      None => {}
    }
  }

  /// Current read limit, 0 when unthrottled
  pub fn read_throttle(&self) -> u64 {
    self
      .traffic_shaper()
      .map(|shaper| shaper.read_limit())
      .unwrap_or(0)
  }

  /// Current write limit, 0 when unthrottled
  pub fn write_throttle(&self) -> u64 {
    self
      .traffic_shaper()
      .map(|shaper| shaper.write_limit())
      .unwrap_or(0)
  }

  /// The shaper, once throttling has been enabled
  pub fn traffic_shaper(&self) -> Option<Arc<GlobalTrafficShaper>> {
    self.inner.traffic_shaper.lock().clone()
  }

  /// An unstarted server on the same group with the next port.
  ///
  /// A port of 0 stays 0. Current timeouts and throttle values are carried over.
  pub fn clone_with_next_port(&self) -> Result<ProxyServer> {
    let mut config = (*self.inner.config).clone();
    let requested = config.requested_address;
    let port = match requested.port() {
      0 => 0,
      port => port
        .checked_add(1)
        .ok_or_else(|| Error::config_error(format!("no port after {}", port)))?,
    };
    config.requested_address = SocketAddr::new(requested.ip(), port);
    config.idle_connection_timeout = self.idle_connection_timeout();
    config.connect_timeout = self.connect_timeout();
    config.throttle = ThrottleSetting::new(self.read_throttle(), self.write_throttle());
    Ok(ProxyServer::new(self.inner.server_group.clone(), config))
  }

  /// Idle timeout applied to new connections
  pub fn idle_connection_timeout(&self) -> Duration {
    Duration::from_millis(self.inner.idle_timeout_ms.load(Ordering::Acquire))
  }

  /// Change the idle timeout for new connections
  pub fn set_idle_connection_timeout(&self, timeout: Duration) {
    self
      .inner
      .idle_timeout_ms
      .store(millis(timeout), Ordering::Release);
  }

  /// Upstream connect timeout applied to new connections
  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.inner.connect_timeout_ms.load(Ordering::Acquire))
  }

  /// Change the upstream connect timeout for new connections
  pub fn set_connect_timeout(&self, timeout: Duration) {
    self
      .inner
      .connect_timeout_ms
      .store(millis(timeout), Ordering::Release);
  }

  /// Address actually bound, once started
  pub fn listen_address(&self) -> Option<SocketAddr> {
    *self.inner.bound_address.lock()
  }

  /// Address requested in the configuration
  pub fn requested_address(&self) -> SocketAddr {
    self.inner.config.requested_address()
  }

  /// Alias used in Via headers
  pub fn proxy_alias(&self) -> &str {
    self.inner.config.proxy_alias()
  }

  /// Configuration the server was built with
  pub fn config(&self) -> &ProxyServerConfig {
    &self.inner.config
  }

  /// Group providing this server's runtimes
  pub fn server_group(&self) -> &ServerGroup {
    &self.inner.server_group
  }

  /// Identity within the group
  pub fn id(&self) -> ServerId {
    self.inner.id
  }

  /// Channels currently open, listener included
  pub fn open_channels(&self) -> Vec<ChannelInfo> {
    self.inner.all_channels.channels()
  }

  fn pools(&self) -> &WorkerPools {
    self.inner.pools()
  }
}

impl ServerInner {
  fn pools(&self) -> &WorkerPools {
    self
      .server_group
      .pools_for(self.config.transport_protocol())
  }

  fn bind(self: &Arc<Self>) -> Result<()> {
    let protocol = self.config.transport_protocol();
    let strategy = listener_strategy(protocol);
    let addr = self.config.requested_address();
    let std_listener = strategy
      .bind(addr)
      .map_err(|source| Error::Bind { addr, source })?;
    let pools = self.pools().clone();
    let listener = {
      let _runtime = pools.acceptor.enter();
      TcpListener::from_std(std_listener)?
    };
    let local = listener.local_addr()?;
    *self.bound_address.lock() = Some(local);
    let guard = self
      .all_channels
      .register(ChannelKind::Listener, local, None);
    tracing::info!("proxy {} listening on {} ({})", self.id, local, protocol);
    let server = self.clone();
    pools
      .acceptor
      .spawn(server.accept_loop(listener, guard, strategy, pools.clone()));
    Ok(())
  }

  async fn accept_loop(
    self: Arc<Self>,
    listener: TcpListener,
    mut guard: ChannelGuard,
    strategy: ListenerStrategy,
    pools: WorkerPools,
  ) {
    let local = guard.info().local;
    loop {
      tokio::select! {
        _ = guard.closed() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, remote)) => self.init_channel(stream, remote, strategy, &pools),
          Err(e) => {
            tracing::warn!("accept on {} failed: {}", local, e);
            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
          }
        },
      }
    }
    drop(listener);
    drop(guard);
    tracing::debug!("stopped listening on {}", local);
  }

  fn init_channel(
    &self,
    stream: TcpStream,
    remote: SocketAddr,
    strategy: ListenerStrategy,
    pools: &WorkerPools,
  ) {
    let local = match stream.local_addr() {
      Ok(local) => local,
      Err(e) => {
        tracing::debug!("dropping connection from {}: {}", remote, e);
        return;
      }
    };
    let mut guard = self
      .all_channels
      .register(ChannelKind::Connection, local, Some(remote));
    if guard.is_closed() {
      tracing::debug!("server stopping, dropping connection from {}", remote);
      return;
    }
    let connection = ClientToProxyConnection {
      config: self.config.clone(),
      strategy,
      idle_timeout: Duration::from_millis(self.idle_timeout_ms.load(Ordering::Acquire)),
      connect_timeout: Duration::from_millis(self.connect_timeout_ms.load(Ordering::Acquire)),
      shaper: self.traffic_shaper.lock().clone(),
      client: remote,
    };
    pools.client_to_proxy.spawn(async move {
      tokio::select! {
        result = connection.serve(stream) => {
          if let Err(e) = result {
            tracing::debug!("connection from {} ended: {}", remote, e);
          }
        }
        _ = guard.closed() => tracing::debug!("closing connection from {}", remote),
      }
      drop(guard);
    });
  }

  fn begin_stop(&self) -> bool {
    self
      .stopped
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  async fn stop(self: &Arc<Self>) -> bool {
    if !self.begin_stop() {
      return false;
    }
    tracing::info!("shutting down proxy {} gracefully", self.id);
    let pending = self.all_channels.close_all();
    let inner = self.clone();
    let shutdown = self.pools().acceptor.spawn(async move {
      let unclosed = pending.wait(CHANNEL_CLOSE_TIMEOUT).await;
      for channel in unclosed {
        tracing::info!("unable to close channel {}", channel);
      }
      inner.finish_stop(true);
    });
    if let Err(e) = shutdown.await {
      tracing::warn!("graceful shutdown of {} interrupted: {}", self.id, e);
      self.finish_stop(true);
    }
    true
  }

  fn abort(&self) -> bool {
    if !self.begin_stop() {
      return false;
    }
    tracing::info!("shutting down proxy {} immediately", self.id);
    drop(self.all_channels.close_all());
    self.finish_stop(false);
    true
  }

  /// Unregister and drop the exit hook. Runs once even if called again.
  fn finish_stop(&self, graceful: bool) {
    if self.finished.swap(true, Ordering::AcqRel) {
      return;
    }
    self
      .server_group
      .unregister_proxy_server(self.id, graceful);
    if let Some(hook) = self.shutdown_hook.lock().take() {
      match remove_shutdown_hook(hook) {
        Ok(_) | Err(Error::ShutdownInProgress) => {}
        Err(e) => tracing::warn!("unable to remove exit hook of {}: {}", self.id, e),
      }
    }
    tracing::info!("done shutting down proxy {}", self.id);
  }
}

impl fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProxyServer")
      .field("id", &self.inner.id)
      .field("group", &self.inner.server_group.name())
      .field("listen_address", &self.listen_address())
      .field("stopped", &self.is_stopped())
      .field("config", &self.inner.config)
      .finish()
  }
}
