//! Integration tests for slinger-proxy

use slinger_proxy::rustls::pki_types::ServerName;
use slinger_proxy::rustls::{ClientConfig, RootCertStore, ServerConfig};
use slinger_proxy::{
  AllowListMitmManager, Authority, CertificateAuthority, CertificateSniffingMitmManager, Error,
  HostResolver, HttpFiltersSource, MitmManager, ProxyAuthenticator, ProxyServer, RequestHead,
  SelectiveMitmManager, ServerGroup, ShortCircuit,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const WAIT: Duration = Duration::from_secs(5);

fn ring() -> Arc<slinger_proxy::rustls::crypto::CryptoProvider> {
  Arc::new(slinger_proxy::rustls::crypto::ring::default_provider())
}

async fn echo_server() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut read, mut write) = stream.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
      });
    }
  });
  addr
}

async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = tokio::time::timeout(WAIT, stream.read(&mut byte))
      .await
      .expect("timed out reading head")
      .unwrap();
    assert_eq!(n, 1, "connection closed before end of head");
    head.push(byte[0]);
  }
  String::from_utf8(head).unwrap()
}

async fn connect_through(proxy: SocketAddr, target: &str) -> (TcpStream, String) {
  let mut client = TcpStream::connect(proxy).await.unwrap();
  let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
  client.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  (client, head)
}

fn start_proxy() -> ProxyServer {
  ProxyServer::bootstrap()
    .port(0)
    .proxy_alias("test-proxy")
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

#[tokio::test(flavor = "multi_thread")]
async fn test_start_on_ephemeral_port_and_stop() {
  let server = start_proxy();
  let addr = server.listen_address().unwrap();
  assert_ne!(addr.port(), 0);
  let client = TcpStream::connect(addr).await.unwrap();
  drop(client);

  let started = Instant::now();
  assert!(server.stop().await);
  assert!(started.elapsed() < Duration::from_secs(11));
  assert!(server.is_stopped());
  assert!(server.server_group().is_stopped());
  assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_tunnel_relays_bytes() {
  let echo = echo_server().await;
  let server = start_proxy();
  let (mut client, head) = connect_through(server.listen_address().unwrap(), &echo.to_string()).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  assert!(head.contains("Via: 1.1 test-proxy\r\n"), "{}", head);

  client.write_all(b"hello").await.unwrap();
  let mut buf = [0u8; 5];
  tokio::time::timeout(WAIT, client.read_exact(&mut buf))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&buf, b"hello");
  assert!(server.abort());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_closes_open_connections() {
  let echo = echo_server().await;
  let server = start_proxy();
  let (mut client, head) = connect_through(server.listen_address().unwrap(), &echo.to_string()).await;
  assert!(head.starts_with("HTTP/1.1 200"));
  assert_eq!(server.open_channels().len(), 2);

  assert!(server.abort());
  let mut buf = [0u8; 16];
  let read = tokio::time::timeout(WAIT, client.read(&mut buf))
    .await
    .expect("client was not disconnected");
  assert!(matches!(read, Ok(0) | Err(_)));
  wait_until(|| server.open_channels().is_empty()).await;

  assert!(!server.abort());
  assert!(!server.stop().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_stop_still_completes() {
  let echo = echo_server().await;
  let server = start_proxy();
  let group = server.server_group().clone();
  let (mut client, head) = connect_through(server.listen_address().unwrap(), &echo.to_string()).await;
  assert!(head.starts_with("HTTP/1.1 200"));

  // poll stop() once, then drop it mid-wait
  tokio::select! {
    biased;
    _ = server.stop() => {}
    _ = std::future::ready(()) => {}
  }
  assert!(server.is_stopped());

  let mut buf = [0u8; 16];
  let read = tokio::time::timeout(WAIT, client.read(&mut buf))
    .await
    .expect("client was not disconnected");
  assert!(matches!(read, Ok(0) | Err(_)));
  wait_until(|| group.is_stopped()).await;
  assert!(group.registered_servers().is_empty());
  assert!(server.open_channels().is_empty());
  assert!(!server.stop().await);
  assert!(!server.abort());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_stop_and_abort_single_winner() {
  let server = start_proxy();
  let mut tasks = Vec::new();
  for i in 0..8 {
    let server = server.clone();
    tasks.push(tokio::spawn(async move {
      if i % 2 == 0 {
        server.stop().await
      } else {
        server.abort()
      }
    }));
  }
  let mut winners = 0;
  for task in tasks {
    if task.await.unwrap() {
      winners += 1;
    }
  }
  assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_stops_with_last_server() {
  let group = ServerGroup::new("shared").unwrap();
  let first = ProxyServer::bootstrap()
    .server_group(group.clone())
    .port(0)
    .start()
    .unwrap();
  let second = ProxyServer::bootstrap()
    .server_group(group.clone())
    .port(0)
    .start()
    .unwrap();
  assert_eq!(group.registered_servers().len(), 2);

  assert!(first.stop().await);
  assert!(!group.is_stopped());
  assert!(second.stop().await);
  assert!(group.is_stopped());

  let late = ProxyServer::bootstrap()
    .server_group(group)
    .port(0)
    .build()
    .unwrap();
  assert!(matches!(late.start(), Err(Error::ServerGroupStopped(ref name)) if name == "shared"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_propagates() {
  let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let port = occupied.local_addr().unwrap().port();
  let server = ProxyServer::bootstrap().port(port).build().unwrap();
  match server.start() {
    Err(Error::Bind { addr, .. }) => assert_eq!(addr.port(), port),
    other => panic!("expected bind error, got {:?}", other.map(|_| ())),
  }
  assert!(server.listen_address().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_origin_form_rejected() {
  let server = start_proxy();
  let mut client = TcpStream::connect(server.listen_address().unwrap())
    .await
    .unwrap();
  client
    .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 400"), "{}", head);
  server.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_http_forwarded_in_origin_form() {
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
    let _ = seen_tx.send(head);
  });

  let server = start_proxy();
  let mut client = TcpStream::connect(server.listen_address().unwrap())
    .await
    .unwrap();
  let request = format!(
    "GET http://{0}/path?q=1 HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n\r\n",
    origin_addr
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let response = read_head(&mut client).await;
  assert!(response.starts_with("HTTP/1.1 200 OK"));

  let seen = tokio::time::timeout(WAIT, seen_rx).await.unwrap().unwrap();
  assert!(seen.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{}", seen);
  assert!(seen.contains("Via: 1.1 test-proxy\r\n"), "{}", seen);
  assert!(!seen.contains("Proxy-Connection"), "{}", seen);
  server.abort();
}

struct FixedCredentials;

impl ProxyAuthenticator for FixedCredentials {
  fn authenticate(&self, username: &str, password: &str) -> bool {
    username == "user" && password == "pass"
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_credentials_get_407() {
  let echo = echo_server().await;
  let server = ProxyServer::bootstrap()
    .port(0)
    .proxy_authenticator(Arc::new(FixedCredentials))
    .start()
    .unwrap();
  let proxy = server.listen_address().unwrap();

  let (_client, head) = connect_through(proxy, &echo.to_string()).await;
  assert!(head.starts_with("HTTP/1.1 407"), "{}", head);
  assert!(head.contains("Proxy-Authenticate: Basic realm=\"Restricted Files\"\r\n"));

  let mut client = TcpStream::connect(proxy).await.unwrap();
  // base64("user:pass")
  let request = format!(
    "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
    echo
  );
  client.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  server.abort();
}

struct BlockPath;

impl HttpFiltersSource for BlockPath {
  fn filter_request(&self, head: &mut RequestHead, _client: SocketAddr) -> Option<ShortCircuit> {
    if head.uri.contains("/blocked") {
      Some(ShortCircuit::new(http::StatusCode::FORBIDDEN, "no"))
    } else {
      None
    }
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_filter_short_circuits() {
  let server = ProxyServer::bootstrap()
    .port(0)
    .filters_source(Arc::new(BlockPath))
    .start()
    .unwrap();
  let mut client = TcpStream::connect(server.listen_address().unwrap())
    .await
    .unwrap();
  client
    .write_all(b"GET http://example.invalid/blocked HTTP/1.1\r\nHost: example.invalid\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 403 Forbidden"), "{}", head);
  server.abort();
}

struct Refusing;

impl MitmManager for Refusing {
  fn client_ssl_engine_for(&self, peer_host: &str) -> slinger_proxy::Result<Arc<ServerConfig>> {
    Err(Error::Certificate(format!("refusing {}", peer_host)))
  }
  fn server_ssl_engine(
    &self,
    peer_host: &str,
    _peer_port: u16,
  ) -> slinger_proxy::Result<Arc<ClientConfig>> {
    Err(Error::Certificate(format!("refusing {}", peer_host)))
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_allow_list_tunnels() {
  let echo = echo_server().await;
  let server = ProxyServer::bootstrap()
    .port(0)
    .mitm_manager(Arc::new(AllowListMitmManager::new(Refusing)))
    .start()
    .unwrap();
  let (mut client, head) = connect_through(server.listen_address().unwrap(), &echo.to_string()).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
  client.write_all(b"raw bytes").await.unwrap();
  let mut buf = [0u8; 9];
  tokio::time::timeout(WAIT, client.read_exact(&mut buf))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&buf, b"raw bytes");
  server.abort();
}

struct Loopback;

impl HostResolver for Loopback {
  fn resolve(&self, _host: &str, port: u16) -> std::io::Result<SocketAddr> {
    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allow_listed_peer_is_intercepted() {
  let temp_dir = std::env::temp_dir().join("slinger-proxy-test-intercept");
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }
  let authority = Authority::new(&temp_dir, "intercept-ca", "secret");

  // origin speaking TLS with its own leaf from the same CA
  let ca = CertificateAuthority::new(authority.clone()).unwrap();
  let (origin_chain, origin_key) = ca.generate_server_cert("localhost").unwrap();
  let origin_leaf = origin_chain[0].clone();
  let origin_config = ServerConfig::builder_with_provider(ring())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(origin_chain, origin_key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(origin_config));
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_port = origin.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = origin.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          let (mut read, mut write) = tokio::io::split(tls);
          let _ = tokio::io::copy(&mut read, &mut write).await;
        }
      });
    }
  });

  let manager = AllowListMitmManager::new(
    CertificateSniffingMitmManager::new(authority)
      .unwrap()
      .trust_all_servers()
      .unwrap(),
  );
  manager.add_allowed(&format!("localhost:{}", origin_port));
  let server = ProxyServer::bootstrap()
    .port(0)
    .server_resolver(Arc::new(Loopback))
    .mitm_manager(Arc::new(manager))
    .start()
    .unwrap();

  let target = format!("localhost:{}", origin_port);
  let (client, head) = connect_through(server.listen_address().unwrap(), &target).await;
  assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

  let mut roots = RootCertStore::empty();
  roots.add(ca.ca_cert_der().clone()).unwrap();
  let client_config = ClientConfig::builder_with_provider(ring())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let mut tls = tokio::time::timeout(
    WAIT,
    connector.connect(ServerName::try_from("localhost").unwrap(), client),
  )
  .await
  .unwrap()
  .unwrap();

  let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
  assert_ne!(presented, origin_leaf, "origin certificate reached the client");

  tls.write_all(b"secret").await.unwrap();
  let mut buf = [0u8; 6];
  tokio::time::timeout(WAIT, tls.read_exact(&mut buf))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&buf, b"secret");

  server.abort();
  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeouts_change_at_runtime() {
  let server = start_proxy();
  server.set_idle_connection_timeout(Duration::from_secs(1));
  server.set_connect_timeout(Duration::from_millis(500));
  assert_eq!(server.idle_connection_timeout(), Duration::from_secs(1));
  assert_eq!(server.connect_timeout(), Duration::from_millis(500));

  // idle clients are dropped once the new timeout elapses
  let mut client = TcpStream::connect(server.listen_address().unwrap())
    .await
    .unwrap();
  let mut buf = [0u8; 1];
  let read = tokio::time::timeout(WAIT, client.read(&mut buf))
    .await
    .expect("idle client was not disconnected");
  assert!(matches!(read, Ok(0) | Err(_)));
  server.abort();
}
