//! Maps a transport protocol to the socket factory used for listening and connecting.
use crate::config::TransportProtocol;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;

/// IANA protocol number of SCTP.
const IPPROTO_SCTP: i32 = 132;

/// Accept-side socket options required by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
  /// listen backlog
  pub backlog: i32,
  /// SO_REUSEADDR
  pub reuse_address: bool,
}

/// Socket factory for one transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStrategy {
  protocol: TransportProtocol,
  socket_type: Type,
  ip_protocol: Protocol,
  options: ListenerOptions,
}

/// Select the socket factory for `protocol`.
pub fn listener_strategy(protocol: TransportProtocol) -> ListenerStrategy {
  match protocol {
    TransportProtocol::Tcp => ListenerStrategy {
      protocol,
      socket_type: Type::STREAM,
      ip_protocol: Protocol::TCP,
      options: ListenerOptions {
        backlog: 1024,
        reuse_address: false,
      },
    },
    TransportProtocol::Sctp => ListenerStrategy {
      protocol,
      socket_type: Type::STREAM,
      ip_protocol: Protocol::from(IPPROTO_SCTP),
      options: ListenerOptions {
        backlog: 10,
        reuse_address: true,
      },
    },
  }
}

impl ListenerStrategy {
  /// Transport this strategy was selected for
  pub fn protocol(&self) -> TransportProtocol {
    self.protocol
  }
  /// Accept-side options
  pub fn options(&self) -> ListenerOptions {
    self.options
  }
  /// Create a non-blocking socket of this transport for `addr`'s family.
  pub fn new_socket(&self, addr: &SocketAddr) -> std::io::Result<Socket> {
    let socket = Socket::new(
      Domain::for_address(*addr),
      self.socket_type,
      Some(self.ip_protocol),
    )?;
    socket.set_nonblocking(true)?;
    Ok(socket)
  }
  /// Bind and listen on `addr` with this transport's options.
  pub fn bind(&self, addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = self.new_socket(&addr)?;
    if self.options.reuse_address {
      socket.set_reuse_address(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(self.options.backlog)?;
    Ok(socket.into())
  }
}
