//! Serving one accepted client connection.
use crate::auth::basic_credentials;
use crate::config::ProxyServerConfig;
use crate::errors::{Error, Result};
use crate::head::{simple_response, RequestHead};
use crate::mitm::{should_intercept, MitmManager};
use crate::throttle::GlobalTrafficShaper;
use crate::transport::ListenerStrategy;
use crate::tunnel::{relay, RelaySettings};
use crate::upstream::ChainedProxy;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Largest response head accepted from a chained proxy
const MAX_CHAINED_RESPONSE_HEAD: usize = 16 * 1024;

/// State captured when a client connection is accepted.
///
/// Timeouts and the shaper are read once here, so runtime changes only affect later
/// connections.
pub(crate) struct ClientToProxyConnection {
  pub(crate) config: Arc<ProxyServerConfig>,
  pub(crate) strategy: ListenerStrategy,
  pub(crate) idle_timeout: Duration,
  pub(crate) connect_timeout: Duration,
  pub(crate) shaper: Option<Arc<GlobalTrafficShaper>>,
  pub(crate) client: SocketAddr,
}

impl ClientToProxyConnection {
  pub(crate) async fn serve(self, stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    match self.config.ssl_engine_source() {
      Some(source) => {
        let tls_config = source.server_config(self.config.authenticate_ssl_clients())?;
        let stream = TlsAcceptor::from(tls_config).accept(stream).await?;
        self.serve_stream(stream).await
      }
      None => self.serve_stream(stream).await,
    }
  }

  async fn serve_stream<S>(&self, client: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    // bytes buffered past the head are relayed along with the rest of the stream
    let mut client = BufReader::new(client);
    let mut head = match self.read_head(&mut client).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e @ Error::InvalidRequest(_)) => {
        respond(&mut client, StatusCode::BAD_REQUEST, &[]).await;
        return Err(e);
      }
      Err(e) => return Err(e),
    };
    tracing::debug!("{} {} from {}", head.method, head.uri, self.client);

    if !self.authenticated(&head) {
      let realm = self
        .config
        .proxy_authenticator()
        .map(|auth| auth.realm().to_string())
        .unwrap_or_default();
      let challenge = [("Proxy-Authenticate", format!("Basic realm=\"{}\"", realm))];
      respond(&mut client, StatusCode::PROXY_AUTHENTICATION_REQUIRED, &challenge).await;
      return Ok(());
    }

    if let Some(short) = self
      .config
      .filters_source()
      .filter_request(&mut head, self.client)
    {
      let bytes = simple_response(short.status, &[("Connection", "close".to_string())], &short.body);
      client.write_all(&bytes).await?;
      client.flush().await?;
      return Ok(());
    }

    if head.is_connect() {
      self.connect(client, head).await
    } else {
      self.forward(client, head).await
    }
  }

  async fn read_head<S>(&self, client: &mut S) -> Result<Option<RequestHead>>
  where
    S: AsyncBufRead + Unpin,
  {
    let limits = self.config.limits();
    if self.idle_timeout.is_zero() {
      return RequestHead::read_from(client, &limits).await;
    }
    tokio::time::timeout(self.idle_timeout, RequestHead::read_from(client, &limits))
      .await
      .map_err(|_| Error::connection_error(format!("{} sent no request in time", self.client)))?
  }

  fn authenticated(&self, head: &RequestHead) -> bool {
    match self.config.proxy_authenticator() {
      None => true,
      Some(auth) => head
        .header("Proxy-Authorization")
        .and_then(basic_credentials)
        .map(|(user, password)| auth.authenticate(&user, &password))
        .unwrap_or(false),
    }
  }

  async fn connect<S>(&self, mut client: S, head: RequestHead) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let (host, port) = match head.target() {
      Ok(target) => target,
      Err(e) => {
        respond(&mut client, StatusCode::BAD_REQUEST, &[]).await;
        return Err(e);
      }
    };
    let (upstream, _) = match self.connect_upstream(&head, &host, port).await {
      Ok(connected) => connected,
      Err(e) => {
        respond(&mut client, StatusCode::BAD_GATEWAY, &[]).await;
        return Err(e);
      }
    };

    let mut established = b"HTTP/1.1 200 Connection established\r\n".to_vec();
    if !self.config.is_transparent() {
      established.extend_from_slice(format!("Via: {}\r\n", self.via(&head.version)).as_bytes());
    }
    established.extend_from_slice(b"\r\n");
    client.write_all(&established).await?;
    client.flush().await?;

    match self.config.mitm_manager() {
      Some(manager) if should_intercept(manager.as_ref(), &host, port) => {
        tracing::debug!("intercepting {}:{} for {}", host, port, self.client);
        self
          .intercept(client, upstream, manager.as_ref(), &host, port)
          .await
      }
      _ => {
        tracing::debug!("tunnelling {}:{} for {}", host, port, self.client);
        relay(client, upstream, self.relay_settings()).await.map(|_| ())
      }
    }
  }

  async fn intercept<S>(
    &self,
    client: S,
    upstream: TcpStream,
    manager: &dyn MitmManager,
    host: &str,
    port: u16,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|_| Error::invalid_request(format!("invalid server name: {}", host)))?;
    let upstream = TlsConnector::from(manager.server_ssl_engine(host, port)?)
      .connect(server_name, upstream)
      .await
      .map_err(|e| Error::connection_error(format!("TLS to {}:{} failed: {}", host, port, e)))?;
    let client = TlsAcceptor::from(manager.client_ssl_engine_for(host)?)
      .accept(client)
      .await
      .map_err(|e| Error::connection_error(format!("client TLS for {} failed: {}", host, e)))?;
    relay(client, upstream, self.relay_settings()).await.map(|_| ())
  }

  async fn forward<S>(&self, mut client: S, mut head: RequestHead) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send,
  {
    if head.is_origin_form() && !self.config.allow_requests_to_origin_server() {
      respond(&mut client, StatusCode::BAD_REQUEST, &[]).await;
      return Err(Error::invalid_request(format!(
        "origin-form request {} not allowed",
        head.uri
      )));
    }
    let (host, port) = match head.target() {
      Ok(target) => target,
      Err(e) => {
        respond(&mut client, StatusCode::BAD_REQUEST, &[]).await;
        return Err(e);
      }
    };
    let (mut upstream, via) = match self.connect_upstream(&head, &host, port).await {
      Ok(connected) => connected,
      Err(e) => {
        respond(&mut client, StatusCode::BAD_GATEWAY, &[]).await;
        return Err(e);
      }
    };

    if via == ChainedProxy::Direct {
      head.to_origin_form();
    }
    head.remove_header("Proxy-Authorization");
    head.remove_header("Proxy-Connection");
    if !self.config.is_transparent() {
      let via = self.via(&head.version);
      head.append_header("Via", &via);
    }
    upstream.write_all(&head.to_bytes()).await?;
    relay(client, upstream, self.relay_settings()).await.map(|_| ())
  }

  fn via(&self, version: &str) -> String {
    let version = version.strip_prefix("HTTP/").unwrap_or(version);
    format!("{} {}", version, self.config.proxy_alias())
  }

  fn relay_settings(&self) -> RelaySettings {
    RelaySettings {
      chunk_size: self.config.limits().max_chunk_size(),
      idle_timeout: self.idle_timeout,
      shaper: self.shaper.clone(),
    }
  }

  /// Connect to the first reachable upstream for `host:port`.
  async fn connect_upstream(
    &self,
    head: &RequestHead,
    host: &str,
    port: u16,
  ) -> Result<(TcpStream, ChainedProxy)> {
    let mut candidates = self
      .config
      .chain_proxy_manager()
      .map(|manager| manager.lookup_chained_proxies(head))
      .unwrap_or_default();
    if candidates.is_empty() {
      candidates.push(ChainedProxy::Direct);
    }
    let mut last_error = None;
    for candidate in candidates {
      let attempt = match candidate {
        ChainedProxy::Direct => match self.resolve(host, port).await {
          Ok(addr) => self.open(addr).await,
          Err(e) => Err(e),
        },
        ChainedProxy::Http(proxy) => self.open_chained(proxy, head, host, port).await,
      };
      match attempt {
        Ok(stream) => return Ok((stream, candidate)),
        Err(e) => {
          tracing::debug!("upstream {:?} for {}:{} failed: {}", candidate, host, port, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| Error::connection_error("no upstream available")))
  }

  async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
    let resolver = self.config.server_resolver().clone();
    let name = host.to_string();
    tokio::task::spawn_blocking(move || resolver.resolve(&name, port))
      .await
      .map_err(|e| Error::connection_error(format!("resolver task failed: {}", e)))?
      .map_err(|e| Error::connection_error(format!("unable to resolve {}: {}", host, e)))
  }

  async fn open(&self, addr: SocketAddr) -> Result<TcpStream> {
    let socket = self.strategy.new_socket(&addr)?;
    if let Some(local) = self.config.local_address() {
      socket.bind(&local.into())?;
    }
    let socket = TcpSocket::from_std_stream(socket.into());
    let connect = socket.connect(addr);
    if self.connect_timeout.is_zero() {
      return Ok(connect.await?);
    }
    match tokio::time::timeout(self.connect_timeout, connect).await {
      Ok(stream) => Ok(stream?),
      Err(_) => Err(Error::connection_error(format!(
        "connecting to {} timed out after {:?}",
        addr, self.connect_timeout
      ))),
    }
  }

  /// Open a connection through an HTTP proxy, tunnelling CONNECT requests through it.
  async fn open_chained(
    &self,
    proxy: SocketAddr,
    head: &RequestHead,
    host: &str,
    port: u16,
  ) -> Result<TcpStream> {
    let mut stream = self.open(proxy).await?;
    if !head.is_connect() {
      return Ok(stream);
    }
    let authority = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    let request = format!(
      "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n\r\n",
      authority
    );
    stream.write_all(request.as_bytes()).await?;
    let status = read_response_status(&mut stream).await?;
    if status != StatusCode::OK {
      return Err(Error::connection_error(format!(
        "chained proxy {} answered CONNECT {} with {}",
        proxy, authority, status
      )));
    }
    Ok(stream)
  }
}

/// Read a response head and return its status, leaving the stream just past it.
async fn read_response_status<S>(stream: &mut S) -> Result<StatusCode>
where
  S: AsyncRead + Unpin,
{
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await? == 0 {
      return Err(Error::connection_error("chained proxy closed during CONNECT"));
    }
    head.push(byte[0]);
    if head.len() > MAX_CHAINED_RESPONSE_HEAD {
      return Err(Error::connection_error("chained proxy response head too large"));
    }
  }
  let text = String::from_utf8_lossy(&head);
  let code = text
    .split_whitespace()
    .nth(1)
    .and_then(|code| code.parse::<u16>().ok())
    .and_then(|code| StatusCode::from_u16(code).ok())
    .ok_or_else(|| Error::connection_error("invalid chained proxy response"))?;
  Ok(code)
}

/// Write an error response, ignoring failures since the connection is ending anyway.
async fn respond<S>(client: &mut S, status: StatusCode, headers: &[(&str, String)])
where
  S: AsyncWrite + Unpin,
{
  let mut all = headers.to_vec();
  all.push(("Connection", "close".to_string()));
  let body = status.canonical_reason().unwrap_or_default().as_bytes();
  let bytes = simple_response(status, &all, body);
  if client.write_all(&bytes).await.is_ok() {
    let _ = client.flush().await;
  }
}
