//! proxy error
use std::net::SocketAddr;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_proxy::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running a proxy server.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// The transport protocol selector is not one the server knows how to bind.
  #[error("unknown transport protocol: {0}")]
  UnknownTransportProtocol(String),
  /// The shared server group has already been stopped.
  #[error("attempted to start proxy, but server group {0} is already stopped")]
  ServerGroupStopped(String),
  /// The listening socket could not be bound.
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// requested address
    addr: SocketAddr,
    /// underlying transport cause
    #[source]
    source: std::io::Error,
  },
  /// No tokio runtime to drive the server on.
  #[error("runtime error: {0}")]
  Runtime(String),
  /// Certificate generation or loading failed.
  #[error("certificate error: {0}")]
  Certificate(String),
  /// The client sent something the proxy cannot handle.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Upstream connection failure.
  #[error("connection error: {0}")]
  Connection(String),
  /// Invalid configuration value.
  #[error("invalid configuration: {0}")]
  Config(String),
  /// The process is already running its exit hooks.
  #[error("process shutdown already in progress")]
  ShutdownInProgress,
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bind_error_keeps_cause() {
    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let err = Error::Bind {
      addr,
      source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
    };
    assert_eq!(err.to_string(), "failed to bind 127.0.0.1:8080: in use");
    assert!(std::error::Error::source(&err).is_some());
  }

  #[test]
  fn invalid_uri_converts_to_http_error() {
    let err: Error = "http://[::1".parse::<http::Uri>().unwrap_err().into();
    assert!(matches!(err, Error::Http(_)));
  }
}
