//! Request filtering hooks
use crate::head::RequestHead;
use bytes::Bytes;
use http::StatusCode;
use std::net::SocketAddr;

/// Response sent instead of forwarding a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortCircuit {
  /// response status
  pub status: StatusCode,
  /// response body
  pub body: Bytes,
}

impl ShortCircuit {
  /// Short-circuit with `status` and `body`
  pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }
}

/// Inspects and rewrites client requests before they are forwarded.
pub trait HttpFiltersSource: Send + Sync {
  /// Called once per request head. Returning a [`ShortCircuit`] answers the client directly.
  fn filter_request(&self, _head: &mut RequestHead, _client: SocketAddr) -> Option<ShortCircuit> {
    None
  }
}

/// Filters that let every request through.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFiltersSourceAdapter;

impl HttpFiltersSource for HttpFiltersSourceAdapter {}
