//! Process-exit hooks.
//!
//! Hooks are named callbacks run once when the process is asked to exit, either through
//! [`run_shutdown_hooks`] or the Ctrl-C listener started by [`spawn_signal_listener`].
//! Starting a proxy server starts that listener, so its hook runs on interrupt without any
//! wiring by the application.
use crate::errors::{Error, Result};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::runtime::Handle;

type Hook = Box<dyn FnOnce() + Send>;

/// Handle returned by [`add_shutdown_hook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct HookTable {
  next_id: u64,
  running: bool,
  hooks: HashMap<u64, (String, Hook)>,
}

static HOOKS: Lazy<Mutex<HookTable>> = Lazy::new(|| Mutex::new(HookTable::default()));

/// Install a hook run at process exit.
pub fn add_shutdown_hook<F>(name: impl Into<String>, hook: F) -> Result<HookId>
where
  F: FnOnce() + Send + 'static,
{
  let mut table = HOOKS.lock();
  if table.running {
    return Err(Error::ShutdownInProgress);
  }
  table.next_id += 1;
  let id = table.next_id;
  table.hooks.insert(id, (name.into(), Box::new(hook)));
  Ok(HookId(id))
}

/// Remove a hook, returning whether it was still installed.
///
/// Fails with [`Error::ShutdownInProgress`] while the hooks are running.
pub fn remove_shutdown_hook(id: HookId) -> Result<bool> {
  let mut table = HOOKS.lock();
  if table.running {
    return Err(Error::ShutdownInProgress);
  }
  Ok(table.hooks.remove(&id.0).is_some())
}

/// Run and clear every installed hook.
pub fn run_shutdown_hooks() {
  let hooks: Vec<(u64, (String, Hook))> = {
    let mut table = HOOKS.lock();
    table.running = true;
    table.hooks.drain().collect()
  };
  let mut hooks = hooks;
  hooks.sort_by_key(|(id, _)| *id);
  for (_, (name, hook)) in hooks {
    tracing::info!("running shutdown hook {}", name);
    hook();
  }
  HOOKS.lock().running = false;
}

/// Exit status after an interrupt, as a shell reports SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

static SIGNAL_LISTENER: OnceCell<()> = OnceCell::new();

/// Run the hooks when the process receives Ctrl-C, then exit with status 130.
///
/// Listening replaces the default interrupt action, hence the explicit exit. Only the first
/// call per process spawns the listener; it returns whether this call did.
pub fn spawn_signal_listener(handle: &Handle) -> bool {
  let mut spawned = false;
  SIGNAL_LISTENER.get_or_init(|| {
    spawned = true;
    handle.spawn(async {
      match tokio::signal::ctrl_c().await {
        Ok(()) => {
          tracing::info!("interrupt received, shutting down");
          run_shutdown_hooks();
          std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        Err(e) => tracing::warn!("unable to listen for interrupt: {}", e),
      }
    });
  });
  spawned
}

/// Number of hooks currently installed
pub fn shutdown_hook_count() -> usize {
  HOOKS.lock().hooks.len()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_then_remove() {
    let id = add_shutdown_hook("noop", || {}).unwrap();
    assert!(remove_shutdown_hook(id).unwrap());
    assert!(!remove_shutdown_hook(id).unwrap());
  }

  #[tokio::test]
  async fn signal_listener_spawned_once() {
    let handle = Handle::current();
    spawn_signal_listener(&handle);
    assert!(!spawn_signal_listener(&handle));
    assert!(SIGNAL_LISTENER.get().is_some());
  }
}
