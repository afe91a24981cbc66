//! Global bandwidth shaping shared by every connection of one proxy server.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

struct ShaperState {
  read_limit: AtomicU64,
  write_limit: AtomicU64,
  read_window: AtomicU64,
  write_window: AtomicU64,
  check_interval: Duration,
  max_time: Duration,
}

/// Bandwidth limiter applied to the proxy-to-server direction.
///
/// Bytes are counted per check interval; when a window overflows the caller sleeps long
/// enough for the average rate to fall back under the limit. A limit of 0 disables that
/// direction.
pub struct GlobalTrafficShaper {
  state: Arc<ShaperState>,
}

impl GlobalTrafficShaper {
  /// Create a shaper whose window resets are driven by a task on `handle`.
  ///
  /// The task stops once the shaper is dropped.
  pub fn new(
    handle: &Handle,
    write_limit: u64,
    read_limit: u64,
    check_interval: Duration,
    max_time: Duration,
  ) -> Self {
    let state = Arc::new(ShaperState {
      read_limit: AtomicU64::new(read_limit),
      write_limit: AtomicU64::new(write_limit),
      read_window: AtomicU64::new(0),
      write_window: AtomicU64::new(0),
      check_interval,
      max_time,
    });
    let weak: Weak<ShaperState> = Arc::downgrade(&state);
    handle.spawn(async move {
      let mut ticker = tokio::time::interval(check_interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match weak.upgrade() {
          Some(state) => {
            state.read_window.store(0, Ordering::Release);
            state.write_window.store(0, Ordering::Release);
          }
          None => break,
        }
      }
      tracing::trace!("traffic shaper ticker stopped");
    });
    tracing::debug!(
      "traffic shaper created, read {} B/s write {} B/s",
      read_limit,
      write_limit
    );
    Self { state }
  }

  /// Change both limits in place.
  pub fn configure(&self, write_limit: u64, read_limit: u64) {
    self.state.write_limit.store(write_limit, Ordering::Release);
    self.state.read_limit.store(read_limit, Ordering::Release);
    tracing::debug!(
      "traffic shaper reconfigured, read {} B/s write {} B/s",
      read_limit,
      write_limit
    );
  }

  /// Read limit in bytes per second
  pub fn read_limit(&self) -> u64 {
    self.state.read_limit.load(Ordering::Acquire)
  }

  /// Write limit in bytes per second
  pub fn write_limit(&self) -> u64 {
    self.state.write_limit.load(Ordering::Acquire)
  }

  /// Interval between window resets
  pub fn check_interval(&self) -> Duration {
    self.state.check_interval
  }

  /// Account `bytes` read from servers and wait if the read limit is exceeded.
  pub async fn throttle_read(&self, bytes: usize) {
    let delay = self.account(&self.state.read_window, self.read_limit(), bytes);
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }

  /// Account `bytes` written to servers and wait if the write limit is exceeded.
  pub async fn throttle_write(&self, bytes: usize) {
    let delay = self.account(&self.state.write_window, self.write_limit(), bytes);
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
  }

  fn account(&self, window: &AtomicU64, limit: u64, bytes: usize) -> Duration {
    if limit == 0 {
      return Duration::ZERO;
    }
    let used = window.fetch_add(bytes as u64, Ordering::AcqRel) + bytes as u64;
    throttle_delay(limit, used, self.state.check_interval).min(self.state.max_time)
  }
}

impl std::fmt::Debug for GlobalTrafficShaper {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("GlobalTrafficShaper")
      .field("read_limit", &self.read_limit())
      .field("write_limit", &self.write_limit())
      .field("check_interval", &self.state.check_interval)
      .finish()
  }
}

/// Time to wait after `used` bytes were transferred within one `interval` at `limit` B/s.
pub(crate) fn throttle_delay(limit: u64, used: u64, interval: Duration) -> Duration {
  if limit == 0 {
    return Duration::ZERO;
  }
  let allowed = (limit as u128 * interval.as_millis()) / 1000;
  let used = used as u128;
  if used <= allowed {
    return Duration::ZERO;
  }
  let millis = (used - allowed) * 1000 / limit as u128;
  Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}
