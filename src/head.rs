//! Request heads as read from clients, and the small responses the proxy writes itself.
use crate::config::ProtocolLimits;
use crate::errors::{Error, Result};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Request line and headers of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
  /// request method
  pub method: Method,
  /// request target as sent
  pub uri: String,
  /// protocol version, e.g. `HTTP/1.1`
  pub version: String,
  /// headers in arrival order
  pub headers: Vec<(String, String)>,
}

impl RequestHead {
  /// Read a head from a buffered `stream`.
  ///
  /// Bytes past the blank line stay buffered in `stream` for whoever reads next. Returns
  /// `Ok(None)` when the stream ends before the first byte.
  pub async fn read_from<S>(stream: &mut S, limits: &ProtocolLimits) -> Result<Option<Self>>
  where
    S: AsyncBufRead + Unpin,
  {
    let mut request_line = Vec::new();
    // the line limit excludes the newline
    let line_limit = limits.max_initial_line_length().saturating_add(1);
    if !read_line_into(stream, &mut request_line, line_limit, "request line").await? {
      if request_line.is_empty() {
        return Ok(None);
      }
      return Err(Error::invalid_request("connection closed inside request line"));
    }
    request_line.pop();

    let mut header_block = Vec::new();
    loop {
      let line_start = header_block.len();
      if !read_line_into(stream, &mut header_block, limits.max_header_size(), "headers").await? {
        return Err(Error::invalid_request("connection closed inside headers"));
      }
      let line = &header_block[line_start..];
      if line == b"\r\n" || line == b"\n" {
        break;
      }
    }
    Self::parse(&request_line, &header_block).map(Some)
  }

  fn parse(request_line: &[u8], header_block: &[u8]) -> Result<Self> {
    let line = String::from_utf8_lossy(request_line);
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
      return Err(Error::invalid_request(format!("invalid request line: {}", line.trim())));
    }
    let method = Method::from_bytes(parts[0].as_bytes())
      .map_err(|_| Error::invalid_request(format!("invalid method: {}", parts[0])))?;
    if !parts[2].starts_with("HTTP/") {
      return Err(Error::invalid_request(format!("invalid version: {}", parts[2])));
    }
    let headers = String::from_utf8_lossy(header_block)
      .lines()
      .filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        Some((name.trim().to_string(), value.trim().to_string()))
      })
      .collect();
    Ok(Self {
      method,
      uri: parts[1].to_string(),
      version: parts[2].to_string(),
      headers,
    })
  }

  /// First value of header `name`
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace every value of `name` with `value`
  pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
    self.remove_header(name);
    self.headers.push((name.to_string(), value.into()));
  }

  /// Remove every value of `name`
  pub fn remove_header(&mut self, name: &str) {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
  }

  /// Append `value` to `name`, comma separated
  pub fn append_header(&mut self, name: &str, value: &str) {
    match self
      .headers
      .iter_mut()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
      Some((_, existing)) => {
        existing.push_str(", ");
        existing.push_str(value);
      }
      None => self.headers.push((name.to_string(), value.to_string())),
    }
  }

  /// `CONNECT` request
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }

  /// Origin host and port targeted by this request.
  ///
  /// Uses the authority for CONNECT, the URI for absolute-form and the `Host` header for
  /// origin-form targets.
  pub fn target(&self) -> Result<(String, u16)> {
    if self.is_connect() {
      return parse_host_port(&self.uri, 443);
    }
    if self.is_origin_form() {
      let host = self
        .header("Host")
        .ok_or_else(|| Error::invalid_request("origin-form request without Host header"))?;
      return parse_host_port(host, 80);
    }
    let uri: Uri = self.uri.parse()?;
    let default_port = if uri.scheme_str() == Some("https") {
      443
    } else {
      80
    };
    let authority = uri
      .authority()
      .ok_or_else(|| Error::invalid_request(format!("no host in {}", self.uri)))?;
    parse_host_port(authority.as_str(), default_port)
  }

  /// Target is a path rather than an absolute URI
  pub fn is_origin_form(&self) -> bool {
    self.uri.starts_with('/') || self.uri == "*"
  }

  /// Rewrite an absolute-form target to origin-form.
  pub fn to_origin_form(&mut self) {
    if self.is_origin_form() || self.is_connect() {
      return;
    }
    if let Ok(uri) = self.uri.parse::<Uri>() {
      let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
      self.uri = if path.is_empty() { "/".to_string() } else { path };
    }
  }

  /// Serialize back to wire form
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(format!("{} {} {}\r\n", self.method, self.uri, self.version).as_bytes());
    for (name, value) in &self.headers {
      buf.extend_from_slice(name.as_bytes());
      buf.extend_from_slice(b": ");
      buf.extend_from_slice(value.as_bytes());
      buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
  }
}

/// Append one line, newline included, to `out` while `out` stays within `limit` bytes.
///
/// Returns false when the stream ends before a newline.
async fn read_line_into<S>(stream: &mut S, out: &mut Vec<u8>, limit: usize, what: &str) -> Result<bool>
where
  S: AsyncBufRead + Unpin,
{
  loop {
    let available = stream.fill_buf().await?;
    if available.is_empty() {
      return Ok(false);
    }
    let (used, complete) = match available.iter().position(|b| *b == b'\n') {
      Some(end) => (end + 1, true),
      None => (available.len(), false),
    };
    out.extend_from_slice(&available[..used]);
    stream.consume(used);
    if out.len() > limit {
      return Err(Error::invalid_request(format!(
        "{} larger than {} bytes",
        what, limit
      )));
    }
    if complete {
      return Ok(true);
    }
  }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub fn parse_host_port(value: &str, default_port: u16) -> Result<(String, u16)> {
  let value = value.trim();
  let (host, port) = if let Some(rest) = value.strip_prefix('[') {
    let (host, rest) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("invalid host: {}", value)))?;
    match rest.strip_prefix(':') {
      Some(port) => (host, Some(port)),
      None if rest.is_empty() => (host, None),
      None => return Err(Error::invalid_request(format!("invalid host: {}", value))),
    }
  } else {
    match value.rsplit_once(':') {
      Some((host, port)) => (host, Some(port)),
      None => (value, None),
    }
  };
  if host.is_empty() {
    return Err(Error::invalid_request(format!("invalid host: {}", value)));
  }
  let port = match port {
    Some(port) => port
      .parse::<u16>()
      .map_err(|_| Error::invalid_request(format!("invalid port: {}", port)))?,
    None => default_port,
  };
  Ok((host.to_string(), port))
}

/// A complete response with `Content-Length`, used for errors and short-circuits.
pub fn simple_response(status: StatusCode, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(128 + body.len());
  buf.extend_from_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (name, value) in headers {
    buf.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
  }
  buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
  buf.extend_from_slice(body);
  buf
}
