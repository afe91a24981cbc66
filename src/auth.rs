//! Proxy authentication
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Validates credentials sent in `Proxy-Authorization`.
pub trait ProxyAuthenticator: Send + Sync {
  /// Whether `username`/`password` may use the proxy
  fn authenticate(&self, username: &str, password: &str) -> bool;

  /// Realm announced in `Proxy-Authenticate`
  fn realm(&self) -> &str {
    "Restricted Files"
  }
}

/// Decode a `Basic` credential header value into username and password.
pub fn basic_credentials(value: &str) -> Option<(String, String)> {
  let (scheme, encoded) = value.trim().split_once(' ')?;
  if !scheme.eq_ignore_ascii_case("basic") {
    return None;
  }
  let decoded = STANDARD.decode(encoded.trim()).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let (user, password) = decoded.split_once(':')?;
  Some((user.to_string(), password.to_string()))
}
