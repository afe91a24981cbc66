use slinger_proxy::{
  add_shutdown_hook, remove_shutdown_hook, run_shutdown_hooks, shutdown_hook_count, Error,
  ProxyServer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

// the hook table is process wide, so tests touching it take turns
static SERIAL: parking_lot::Mutex<()> = parking_lot::const_mutex(());

const WAIT: Duration = Duration::from_secs(5);

fn start_proxy() -> ProxyServer {
  ProxyServer::bootstrap()
    .port(0)
    .proxy_alias("hook-test")
    .start()
    .unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
  let deadline = Instant::now() + WAIT;
  while !done() {
    assert!(Instant::now() < deadline, "condition not reached in time");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[test]
fn hooks_run_once_and_cannot_be_removed_while_running() {
  let _serial = SERIAL.lock();
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  let removed_during_run = Arc::new(parking_lot::Mutex::new(None));
  let observed = removed_during_run.clone();
  let first = add_shutdown_hook("count", move || {
    counter.fetch_add(1, Ordering::SeqCst);
  })
  .unwrap();
  add_shutdown_hook("remove while running", move || {
    *observed.lock() = Some(remove_shutdown_hook(first));
  })
  .unwrap();

  run_shutdown_hooks();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(matches!(
    removed_during_run.lock().take(),
    Some(Err(Error::ShutdownInProgress))
  ));

  // the table is empty once the hooks ran
  run_shutdown_hooks();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(!remove_shutdown_hook(first).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_hook_aborts_started_server() {
  let _serial = SERIAL.lock();
  let server = start_proxy();
  let group = server.server_group().clone();
  assert_eq!(shutdown_hook_count(), 1);

  let mut client = TcpStream::connect(server.listen_address().unwrap())
    .await
    .unwrap();
  wait_until(|| server.open_channels().len() == 2).await;

  run_shutdown_hooks();
  assert!(server.is_stopped());
  assert!(group.registered_servers().is_empty());
  assert!(group.is_stopped());
  assert_eq!(shutdown_hook_count(), 0);

  let mut buf = [0u8; 1];
  let read = tokio::time::timeout(WAIT, client.read(&mut buf))
    .await
    .expect("client was not disconnected");
  assert!(matches!(read, Ok(0) | Err(_)));
  wait_until(|| server.open_channels().is_empty()).await;
  assert!(!server.abort());
  assert!(!server.stop().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_stop_and_abort_remove_exit_hook() {
  let _serial = SERIAL.lock();
  let stopped = start_proxy();
  let aborted = start_proxy();
  assert_eq!(shutdown_hook_count(), 2);

  assert!(stopped.stop().await);
  assert_eq!(shutdown_hook_count(), 1);
  assert!(aborted.abort());
  assert_eq!(shutdown_hook_count(), 0);

  // running the hooks afterwards finds nothing of theirs
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  add_shutdown_hook("marker", move || {
    counter.fetch_add(1, Ordering::SeqCst);
  })
  .unwrap();
  run_shutdown_hooks();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(shutdown_hook_count(), 0);
}
