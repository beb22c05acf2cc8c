//! Parsing of PAC proxy strings into upstream candidates.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Proxy mode keyword of a single PAC candidate.
///
/// The discriminants are wire-stable and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
  /// Direct connection, no proxy.
  Direct = 0,
  /// Legacy keyword for an HTTP proxy.
  Proxy = 1,
  /// HTTP proxy.
  Http = 2,
  /// HTTPS proxy, the CONNECT leg itself is TLS.
  Https = 3,
  /// SOCKS proxy, treated as SOCKS5.
  Socks = 4,
  /// SOCKS4 proxy.
  Socks4 = 5,
  /// SOCKS5 proxy.
  Socks5 = 6,
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Mode::Direct => "DIRECT",
      Mode::Proxy => "PROXY",
      Mode::Http => "HTTP",
      Mode::Https => "HTTPS",
      Mode::Socks => "SOCKS",
      Mode::Socks4 => "SOCKS4",
      Mode::Socks5 => "SOCKS5",
    };
    f.write_str(s)
  }
}

impl FromStr for Mode {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "DIRECT" => Ok(Mode::Direct),
      "PROXY" => Ok(Mode::Proxy),
      "HTTP" => Ok(Mode::Http),
      "HTTPS" => Ok(Mode::Https),
      "SOCKS" => Ok(Mode::Socks),
      "SOCKS4" => Ok(Mode::Socks4),
      "SOCKS5" => Ok(Mode::Socks5),
      _ => Err(()),
    }
  }
}

impl Mode {
  /// URI scheme used when dialing a candidate of this mode.
  ///
  /// `PROXY` is an alias for `HTTP` and `SOCKS` for `SOCKS5`, matching how
  /// browsers treat the legacy keywords.
  fn scheme(&self) -> Option<&'static str> {
    match self {
      Mode::Direct => None,
      Mode::Proxy | Mode::Http => Some("http"),
      Mode::Https => Some("https"),
      Mode::Socks4 => Some("socks4"),
      Mode::Socks | Mode::Socks5 => Some("socks5"),
    }
  }
}

/// A single upstream candidate parsed from a PAC answer.
///
/// `DIRECT` candidates carry no endpoint; every other mode carries both a
/// host and a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
  /// The mode keyword.
  pub mode: Mode,
  /// Proxy host, empty for `DIRECT`.
  pub host: String,
  /// Proxy port, `0` for `DIRECT`.
  pub port: u16,
}

impl ProxyInfo {
  /// Direct candidate.
  pub fn direct() -> Self {
    ProxyInfo {
      mode: Mode::Direct,
      host: String::new(),
      port: 0,
    }
  }

  /// Whether this candidate means "no proxy".
  pub fn is_direct(&self) -> bool {
    self.mode == Mode::Direct
  }

  /// Convert the candidate into a dialable URI, `None` for `DIRECT`.
  pub fn uri(&self) -> Option<http::Uri> {
    let scheme = self.mode.scheme()?;
    http::Uri::builder()
      .scheme(scheme)
      .authority(format!("{}:{}", self.host, self.port))
      .path_and_query("/")
      .build()
      .ok()
  }
}

/// A raw PAC answer, e.g. `"PROXY a:8080; DIRECT"`.
///
/// Offers two views: [`Proxies::all`] returning the full validated list (or
/// the first parse error), and [`Proxies::first`] returning just the first
/// candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxies(String);

impl From<String> for Proxies {
  fn from(s: String) -> Self {
    Proxies(s)
  }
}

impl From<&str> for Proxies {
  fn from(s: &str) -> Self {
    Proxies(s.to_owned())
  }
}

impl Proxies {
  /// Parse every candidate. An empty input yields an empty list; any
  /// malformed token fails the whole parse.
  pub fn all(&self) -> Result<Vec<ProxyInfo>> {
    let mut out = Vec::new();
    for token in self.0.split(';') {
      let token = token.trim();
      if token.is_empty() {
        continue;
      }
      out.push(parse_token(token)?);
    }
    Ok(out)
  }

  /// Parse and return the first candidate.
  pub fn first(&self) -> Result<ProxyInfo> {
    for token in self.0.split(';') {
      let token = token.trim();
      if token.is_empty() {
        continue;
      }
      return parse_token(token);
    }
    Err(Error::EmptyProxyList)
  }
}

fn parse_token(token: &str) -> Result<ProxyInfo> {
  let mut words = token.split_whitespace();
  let keyword = words.next().unwrap_or_default();
  let mode = Mode::from_str(keyword).map_err(|()| Error::InvalidProxy {
    token: token.to_owned(),
    reason: format!("unknown mode {keyword:?}"),
  })?;

  if mode == Mode::Direct {
    if words.next().is_some() {
      return Err(Error::InvalidProxy {
        token: token.to_owned(),
        reason: "DIRECT takes no endpoint".to_owned(),
      });
    }
    return Ok(ProxyInfo::direct());
  }

  let endpoint = words.next().ok_or_else(|| Error::InvalidProxy {
    token: token.to_owned(),
    reason: "missing host:port".to_owned(),
  })?;
  if words.next().is_some() {
    return Err(Error::InvalidProxy {
      token: token.to_owned(),
      reason: "trailing garbage after host:port".to_owned(),
    });
  }

  let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| Error::InvalidProxy {
    token: token.to_owned(),
    reason: "missing port".to_owned(),
  })?;
  if host.is_empty() {
    return Err(Error::InvalidProxy {
      token: token.to_owned(),
      reason: "empty host".to_owned(),
    });
  }
  let port: u16 = port.parse().map_err(|_| Error::InvalidProxy {
    token: token.to_owned(),
    reason: format!("invalid port {port:?}"),
  })?;

  Ok(ProxyInfo {
    mode,
    host: host.to_owned(),
    port,
  })
}
