//! Upstream selection: chained proxies and address resolution.
use crate::head::RequestHead;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Where a request goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedProxy {
  /// Straight to the origin server
  Direct,
  /// Through an HTTP proxy, tunnelled with CONNECT
  Http(SocketAddr),
}

/// Picks the upstream proxies for a request, tried in order.
pub trait ChainedProxyManager: Send + Sync {
  /// Candidates for `head`. An empty list means direct.
  fn lookup_chained_proxies(&self, head: &RequestHead) -> Vec<ChainedProxy>;
}

/// Resolves origin host names. Called from a blocking thread.
pub trait HostResolver: Send + Sync {
  /// Address for `host:port`
  fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// Resolution through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostResolver;

impl HostResolver for DefaultHostResolver {
  fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
      io::Error::new(
        io::ErrorKind::NotFound,
        format!("no address for {}:{}", host, port),
      )
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resolves_literals() {
    let resolver = DefaultHostResolver;
    assert_eq!(
      resolver.resolve("127.0.0.1", 80).unwrap(),
      "127.0.0.1:80".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(
      resolver.resolve("[::1]", 443).unwrap(),
      "[::1]:443".parse::<SocketAddr>().unwrap()
    );
  }
}
