//! Tracks every channel opened by a proxy server so it can be closed on shutdown.
//!
//! Each registered channel is represented by a [`ChannelGuard`] held by the task serving it.
//! The guard carries the close signal sent by [`ConnectionRegistry::close_all`] and removes
//! the entry from the registry when it is dropped, whoever closed the channel.
//!
//! Once `close_all` has been called the registry is closing: later registrations receive a
//! guard that is already closed and are never inserted.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// What kind of socket a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
  /// listening socket
  Listener,
  /// accepted client connection
  Connection,
}

/// Endpoints of a registered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
  /// registry assigned id
  pub id: u64,
  /// listener or connection
  pub kind: ChannelKind,
  /// local endpoint
  pub local: SocketAddr,
  /// remote endpoint, `None` for listeners
  pub remote: Option<SocketAddr>,
}

impl fmt::Display for ChannelInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.remote {
      Some(remote) => write!(f, "#{} {} <- {}", self.id, self.local, remote),
      None => write!(f, "#{} listening on {}", self.id, self.local),
    }
  }
}

struct Entry {
  info: ChannelInfo,
  close_tx: watch::Sender<bool>,
  done_rx: oneshot::Receiver<()>,
}

#[derive(Default)]
struct RegistryState {
  next_id: u64,
  closing: bool,
  channels: HashMap<u64, Entry>,
}

#[derive(Default)]
struct RegistryInner {
  name: String,
  state: Mutex<RegistryState>,
}

/// Set of live channels created by one server.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
  inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
  /// Create an empty registry
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        name: name.into(),
        state: Mutex::new(RegistryState::default()),
      }),
    }
  }

  /// Register a live channel.
  ///
  /// Never blocks on I/O and never fails. If the registry is already closing the returned
  /// guard is closed and the caller is expected to drop the channel.
  pub fn register(
    &self,
    kind: ChannelKind,
    local: SocketAddr,
    remote: Option<SocketAddr>,
  ) -> ChannelGuard {
    let (close_tx, close_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();
    let mut state = self.inner.state.lock();
    state.next_id += 1;
    let info = ChannelInfo {
      id: state.next_id,
      kind,
      local,
      remote,
    };
    if state.closing {
      tracing::debug!("{} is closing, rejecting channel {}", self.inner.name, info);
      let _ = close_tx.send(true);
    } else {
      state.channels.insert(
        info.id,
        Entry {
          info: info.clone(),
          close_tx,
          done_rx,
        },
      );
    }
    ChannelGuard {
      info,
      registry: Arc::downgrade(&self.inner),
      close_rx,
      _done: done_tx,
    }
  }

  /// Request closure of every registered channel and stop accepting registrations.
  ///
  /// Dropping the returned [`PendingClose`] does not cancel the close requests.
  pub fn close_all(&self) -> PendingClose {
    let drained: Vec<Entry> = {
      let mut state = self.inner.state.lock();
      state.closing = true;
      state.channels.drain().map(|(_, entry)| entry).collect()
    };
    let mut pending = Vec::with_capacity(drained.len());
    for entry in drained {
      // the guard may already be gone, in which case the channel is closed anyway
      let _ = entry.close_tx.send(true);
      pending.push((entry.info, entry.done_rx));
    }
    PendingClose { pending }
  }

  /// Number of channels currently open
  pub fn len(&self) -> usize {
    self.inner.state.lock().channels.len()
  }

  /// No channel is open
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// `close_all` has been called
  pub fn is_closing(&self) -> bool {
    self.inner.state.lock().closing
  }

  /// Snapshot of the open channels
  pub fn channels(&self) -> Vec<ChannelInfo> {
    let state = self.inner.state.lock();
    let mut channels: Vec<ChannelInfo> = state.channels.values().map(|e| e.info.clone()).collect();
    channels.sort_by_key(|c| c.id);
    channels
  }
}

impl fmt::Debug for ConnectionRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionRegistry")
      .field("name", &self.inner.name)
      .field("open", &self.len())
      .field("closing", &self.is_closing())
      .finish()
  }
}

/// Handle held by the task that owns a registered channel.
pub struct ChannelGuard {
  info: ChannelInfo,
  registry: Weak<RegistryInner>,
  close_rx: watch::Receiver<bool>,
  _done: oneshot::Sender<()>,
}

impl ChannelGuard {
  /// Endpoints of this channel
  pub fn info(&self) -> &ChannelInfo {
    &self.info
  }

  /// Closure has been requested
  pub fn is_closed(&self) -> bool {
    *self.close_rx.borrow()
  }

  /// Resolves once closure is requested.
  pub async fn closed(&mut self) {
    // a dropped sender means the registry entry is gone, close as well
    let _ = self.close_rx.wait_for(|closed| *closed).await;
  }
}

impl Drop for ChannelGuard {
  fn drop(&mut self) {
    if let Some(inner) = self.registry.upgrade() {
      inner.state.lock().channels.remove(&self.info.id);
    }
  }
}

/// Channels that were asked to close by [`ConnectionRegistry::close_all`].
pub struct PendingClose {
  pending: Vec<(ChannelInfo, oneshot::Receiver<()>)>,
}

impl PendingClose {
  /// Number of channels that were asked to close
  pub fn len(&self) -> usize {
    self.pending.len()
  }

  /// Nothing was open
  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Wait up to `timeout` for every channel to close, returning the ones that did not.
  pub async fn wait(self, timeout: Duration) -> Vec<ChannelInfo> {
    let deadline = Instant::now() + timeout;
    let mut unclosed = Vec::new();
    for (info, done) in self.pending {
      if tokio::time::timeout_at(deadline, done).await.is_err() {
        unclosed.push(info);
      }
    }
    unclosed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
  }

  #[test]
  fn guard_drop_removes_entry() {
    let registry = ConnectionRegistry::new("test");
    let listener = registry.register(ChannelKind::Listener, addr(8080), None);
    let conn = registry.register(ChannelKind::Connection, addr(8080), Some(addr(50000)));
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.channels()[0].kind, ChannelKind::Listener);
    drop(conn);
    assert_eq!(registry.len(), 1);
    drop(listener);
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn close_all_signals_and_waits() {
    let registry = ConnectionRegistry::new("test");
    let mut guard = registry.register(ChannelKind::Connection, addr(1), Some(addr(2)));
    let task = tokio::spawn(async move {
      guard.closed().await;
      drop(guard);
    });
    let pending = registry.close_all();
    assert_eq!(pending.len(), 1);
    let unclosed = pending.wait(Duration::from_secs(5)).await;
    assert!(unclosed.is_empty());
    task.await.unwrap();
    assert!(registry.is_empty());
  }

  #[tokio::test]
  async fn graceful_wait_reports_stuck_channels() {
    let registry = ConnectionRegistry::new("test");
    let stuck = registry.register(ChannelKind::Connection, addr(1), Some(addr(3)));
    let pending = registry.close_all();
    assert!(stuck.is_closed());
    let unclosed = pending.wait(Duration::from_millis(50)).await;
    assert_eq!(unclosed.len(), 1);
    assert_eq!(unclosed[0].remote, Some(addr(3)));
    drop(stuck);
  }

  #[test]
  fn register_after_close_all_is_closed() {
    let registry = ConnectionRegistry::new("test");
    drop(registry.close_all());
    assert!(registry.is_closing());
    let late = registry.register(ChannelKind::Connection, addr(1), Some(addr(4)));
    assert!(late.is_closed());
    assert!(registry.is_empty());
  }

  #[test]
  fn display_channel_info() {
    let info = ChannelInfo {
      id: 7,
      kind: ChannelKind::Listener,
      local: addr(8080),
      remote: None,
    };
    assert_eq!(info.to_string(), "#7 listening on 127.0.0.1:8080");
  }
}
