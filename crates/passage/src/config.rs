//! Proxy configuration, validated at construction.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http::header::HeaderName;
use regex::Regex;

use crate::credentials::Userinfo;
use crate::error::{Error, Result};
use crate::http1::Request;
use crate::httplog::LogMode;
use crate::middleware::ErrorResponseHook;
use crate::mitm::MitmConfig;
use crate::modifier::{RequestModifier, ResponseModifier};

/// Listener transport scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Protocol {
  /// Plain TCP listener.
  #[default]
  Http,
  /// TLS listener.
  Https,
  /// TLS listener with h2 offered to clients.
  H2,
}

impl FromStr for Protocol {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "http" => Ok(Protocol::Http),
      "https" => Ok(Protocol::Https),
      "h2" => Ok(Protocol::H2),
      other => Err(Error::config(format!("unknown protocol {other:?}"))),
    }
  }
}

impl std::fmt::Display for Protocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Protocol::Http => "http",
      Protocol::Https => "https",
      Protocol::H2 => "h2",
    })
  }
}

/// What to do with requests targeting the local machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyLocalhostMode {
  /// Refuse with `403`.
  #[default]
  Deny,
  /// Proxy them like any other destination.
  Allow,
  /// Proxy them, but never through an upstream proxy.
  Direct,
}

impl FromStr for ProxyLocalhostMode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "deny" => Ok(ProxyLocalhostMode::Deny),
      "allow" => Ok(ProxyLocalhostMode::Allow),
      "direct" => Ok(ProxyLocalhostMode::Direct),
      other => Err(Error::config(format!("unsupported proxy_localhost mode {other:?}"))),
    }
  }
}

impl std::fmt::Display for ProxyLocalhostMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ProxyLocalhostMode::Deny => "deny",
      ProxyLocalhostMode::Allow => "allow",
      ProxyLocalhostMode::Direct => "direct",
    })
  }
}

/// A set of anchored regular expressions matched against hostnames.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
  patterns: Vec<Regex>,
}

impl RuleSet {
  /// Compile a rule set; any invalid pattern fails construction.
  pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
    let mut compiled = Vec::with_capacity(patterns.len());
    for p in patterns {
      compiled.push(
        Regex::new(p.as_ref())
          .map_err(|e| Error::config(format!("invalid pattern {:?}: {e}", p.as_ref())))?,
      );
    }
    Ok(RuleSet { patterns: compiled })
  }

  /// Whether any pattern matches.
  pub fn matches(&self, s: &str) -> bool {
    self.patterns.iter().any(|p| p.is_match(s))
  }
}

/// Custom upstream selector; `None` means DIRECT.
pub type ProxyFn = Arc<dyn Fn(&Request) -> Result<Option<http::Uri>> + Send + Sync>;

/// Hook run on CONNECT requests before tunnel establishment.
pub type ConnectRequestModifier = Arc<dyn Fn(&mut Request) -> Result<()> + Send + Sync>;

/// Full proxy configuration. Construct with [`Default::default`] and
/// override fields; [`HttpProxyConfig::validate`] is the single gate every
/// construction path runs through.
#[derive(Clone)]
pub struct HttpProxyConfig {
  /// Proxy name, used as the `Via` pseudonym and the auth realm.
  pub name: String,
  /// Listener address.
  pub addr: SocketAddr,
  /// Listener transport scheme.
  pub protocol: Protocol,
  /// Listener certificate for the TLS schemes, PEM.
  pub tls_cert_pem: Option<String>,
  /// Listener key for the TLS schemes, PEM.
  pub tls_key_pem: Option<String>,
  /// Bounds each body read; zero means unbounded.
  pub read_timeout: Duration,
  /// Bounds a request head read; zero means unbounded.
  pub read_header_timeout: Duration,
  /// Bounds each write; zero means unbounded.
  pub write_timeout: Duration,
  /// Localhost policy.
  pub proxy_localhost: ProxyLocalhostMode,
  /// Static upstream proxy URL; mutually exclusive with the PAC resolver
  /// and the custom function.
  pub upstream_proxy: Option<http::Uri>,
  /// Custom upstream selector; mutually exclusive with the static URL and
  /// the PAC resolver.
  pub upstream_proxy_func: Option<ProxyFn>,
  /// Destinations refused outright.
  pub deny_domains: Option<RuleSet>,
  /// Destinations that bypass any upstream proxy.
  pub direct_domains: Option<RuleSet>,
  /// MITM CA material; interception stays off when absent.
  pub mitm: Option<MitmConfig>,
  /// Hosts eligible for interception; with MITM configured and no filter,
  /// every CONNECT is intercepted.
  pub mitm_domains: Option<RuleSet>,
  /// Require proxy basic auth with these credentials.
  pub basic_auth: Option<Userinfo>,
  /// Header carrying the per-exchange id.
  pub request_id_header: HeaderName,
  /// Hook run on CONNECT requests.
  pub connect_request_modifier: Option<ConnectRequestModifier>,
  /// Tunnel CONNECT without interpreting the inner bytes.
  pub connect_passthrough: bool,
  /// Close every connection after one exchange.
  pub close_after_reply: bool,
  /// Byte-rate cap on data flowing to clients, bytes/second, zero is off.
  /// The name is inherited: the "read" limit caps what clients read.
  pub read_limit: u64,
  /// Byte-rate cap on data flowing from clients, bytes/second, zero is
  /// off. Counterpart of `read_limit`, naming inverted the same way.
  pub write_limit: u64,
  /// Exchange log verbosity.
  pub log_http: LogMode,
  /// User-supplied request modifiers, run in the inner group.
  pub request_modifiers: Vec<Arc<dyn RequestModifier>>,
  /// User-supplied response modifiers, run in the inner group.
  pub response_modifiers: Vec<Arc<dyn ResponseModifier>>,
  /// Error-to-response hook; a plain-text default applies when absent.
  pub error_response: Option<ErrorResponseHook>,
}

impl Default for HttpProxyConfig {
  fn default() -> Self {
    HttpProxyConfig {
      name: "passage".to_owned(),
      addr: SocketAddr::from(([0, 0, 0, 0], 3128)),
      protocol: Protocol::Http,
      tls_cert_pem: None,
      tls_key_pem: None,
      read_timeout: Duration::ZERO,
      read_header_timeout: Duration::from_secs(60),
      write_timeout: Duration::ZERO,
      proxy_localhost: ProxyLocalhostMode::Deny,
      upstream_proxy: None,
      upstream_proxy_func: None,
      deny_domains: None,
      direct_domains: None,
      mitm: None,
      mitm_domains: None,
      basic_auth: None,
      request_id_header: HeaderName::from_static("x-request-id"),
      connect_request_modifier: None,
      connect_passthrough: false,
      close_after_reply: false,
      read_limit: 0,
      write_limit: 0,
      log_http: LogMode::Errors,
      request_modifiers: Vec::new(),
      response_modifiers: Vec::new(),
      error_response: None,
    }
  }
}

impl HttpProxyConfig {
  /// Validate the configuration. This is the single gate; every proxy
  /// construction path runs through it.
  pub fn validate(&self) -> Result<()> {
    if self.name.is_empty() {
      return Err(Error::config("name must not be empty"));
    }
    if self.protocol == Protocol::H2 {
      return Err(Error::config("unsupported protocol: h2"));
    }
    if self.protocol == Protocol::Https
      && (self.tls_cert_pem.is_none() || self.tls_key_pem.is_none())
    {
      return Err(Error::config("https protocol requires TLS certificate and key"));
    }
    if let Some(upstream) = &self.upstream_proxy {
      validate_proxy_uri(upstream)?;
      if self.upstream_proxy_func.is_some() {
        return Err(Error::config(
          "cannot use both an upstream proxy URL and an upstream proxy function",
        ));
      }
    }
    Ok(())
  }
}

pub(crate) fn validate_proxy_uri(uri: &http::Uri) -> Result<()> {
  match uri.scheme_str() {
    Some("http") | Some("https") | Some("socks5") | Some("socks4") => {}
    other => {
      return Err(Error::config(format!("invalid upstream proxy scheme {other:?}")));
    }
  }
  if uri.host().is_none() {
    return Err(Error::config("upstream proxy URL has no host"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    HttpProxyConfig::default().validate().unwrap();
  }

  #[test]
  fn rejects_h2() {
    let config = HttpProxyConfig {
      protocol: Protocol::H2,
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn https_needs_tls_material() {
    let config = HttpProxyConfig {
      protocol: Protocol::Https,
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_bad_upstream_schemes() {
    let config = HttpProxyConfig {
      upstream_proxy: Some("ftp://proxy:21".parse().unwrap()),
      ..Default::default()
    };
    assert!(config.validate().is_err());

    let config = HttpProxyConfig {
      upstream_proxy: Some("socks5://proxy:1080".parse().unwrap()),
      ..Default::default()
    };
    config.validate().unwrap();
  }

  #[test]
  fn url_and_func_are_mutually_exclusive() {
    let config = HttpProxyConfig {
      upstream_proxy: Some("http://proxy:3128".parse().unwrap()),
      upstream_proxy_func: Some(Arc::new(|_| Ok(None))),
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn mode_parsing() {
    assert_eq!("deny".parse::<ProxyLocalhostMode>().unwrap(), ProxyLocalhostMode::Deny);
    assert_eq!("allow".parse::<ProxyLocalhostMode>().unwrap(), ProxyLocalhostMode::Allow);
    assert_eq!("direct".parse::<ProxyLocalhostMode>().unwrap(), ProxyLocalhostMode::Direct);
    assert!("bogus".parse::<ProxyLocalhostMode>().is_err());
  }

  #[test]
  fn rule_sets() {
    let rules = RuleSet::new(&["^internal\\.", "\\.lan$"]).unwrap();
    assert!(rules.matches("internal.example.com"));
    assert!(rules.matches("printer.lan"));
    assert!(!rules.matches("example.com"));
    assert!(RuleSet::new(&["(unclosed"]).is_err());
  }
}
