//! Destination-scoped basic-auth credentials.

use std::fmt;
use std::io::Write;

use base64::prelude::BASE64_STANDARD;
use base64::write::EncoderWriter;
use http::header::HeaderValue;
use percent_encoding::percent_decode;

use crate::error::{Error, Result};
use crate::http1::default_port;

/// A username plus optional password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Userinfo {
  /// The username.
  pub username: String,
  /// The password, `None` when absent.
  pub password: Option<String>,
}

impl Userinfo {
  /// Parse `user:pass` (or just `user`), percent-decoding both parts.
  pub fn parse(s: &str) -> Result<Self> {
    let (user, pass) = match s.split_once(':') {
      Some((u, p)) => (u, Some(p)),
      None => (s, None),
    };
    if user.is_empty() {
      return Err(Error::config("credentials require a username"));
    }
    Ok(Userinfo {
      username: percent_decode(user.as_bytes()).decode_utf8_lossy().into_owned(),
      password: pass.map(|p| percent_decode(p.as_bytes()).decode_utf8_lossy().into_owned()),
    })
  }

  /// Encode as a `Basic` authorization header value. The value is marked
  /// sensitive so it never shows up in logs.
  pub fn basic_auth(&self) -> HeaderValue {
    let mut buf = b"Basic ".to_vec();
    {
      let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
      let _ = write!(encoder, "{}:", self.username);
      if let Some(password) = &self.password {
        let _ = write!(encoder, "{password}");
      }
    }
    let mut header =
      HeaderValue::from_bytes(&buf).unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    header.set_sensitive(true);
    header
  }

  /// Render as `user:pass` for URL userinfo.
  pub fn as_userinfo(&self) -> String {
    match &self.password {
      Some(p) => format!("{}:{}", self.username, p),
      None => self.username.clone(),
    }
  }
}

impl fmt::Display for Userinfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Password is never rendered.
    write!(f, "{}:xxxxx", self.username)
  }
}

/// One credential rule: host and port globs plus the userinfo to apply.
#[derive(Debug, Clone)]
pub struct HostPortUser {
  /// Host pattern, `*` is the only metacharacter.
  pub host: String,
  /// Port pattern, `*` matches any port.
  pub port: String,
  /// Credentials applied on a match.
  pub user: Userinfo,
}

impl HostPortUser {
  /// Parse `user:pass@host:port`.
  pub fn parse(s: &str) -> Result<Self> {
    let (creds, endpoint) = s
      .rsplit_once('@')
      .ok_or_else(|| Error::config(format!("credential rule {s:?} is missing '@'")))?;
    let (host, port) = endpoint
      .rsplit_once(':')
      .ok_or_else(|| Error::config(format!("credential rule {s:?} is missing a port")))?;
    let rule = HostPortUser {
      host: host.to_owned(),
      port: port.to_owned(),
      user: Userinfo::parse(creds)?,
    };
    rule.validate()?;
    Ok(rule)
  }

  fn validate(&self) -> Result<()> {
    if self.host.is_empty() {
      return Err(Error::config("credential rule has an empty host"));
    }
    if self.port.is_empty() {
      return Err(Error::config("credential rule has an empty port"));
    }
    if self.port != "*" && self.port.parse::<u16>().is_err() {
      return Err(Error::config(format!("credential rule has an invalid port {:?}", self.port)));
    }
    Ok(())
  }
}

/// Ordered credential rules; the first matching rule wins.
#[derive(Debug, Default, Clone)]
pub struct CredentialsMatcher {
  rules: Vec<HostPortUser>,
}

impl CredentialsMatcher {
  /// Matcher over the given rules, in declaration order.
  pub fn new(rules: Vec<HostPortUser>) -> Self {
    CredentialsMatcher { rules }
  }

  /// Whether no rules are configured.
  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Find credentials for a destination URL.
  pub fn match_url(&self, uri: &http::Uri) -> Option<&Userinfo> {
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or_else(|| default_port(uri)).to_string();
    self
      .rules
      .iter()
      .find(|r| wildcard_match(&r.host, host) && wildcard_match(&r.port, &port))
      .map(|r| &r.user)
  }
}

/// Glob match where `*` matches any run of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
  let parts: Vec<&str> = pattern.split('*').collect();
  if parts.len() == 1 {
    return pattern == text;
  }

  let mut pos = 0;
  for (i, part) in parts.iter().enumerate() {
    if part.is_empty() {
      continue;
    }
    if i == 0 {
      if !text.starts_with(part) {
        return false;
      }
      pos = part.len();
    } else if i == parts.len() - 1 {
      return text.len() >= pos && text[pos..].ends_with(part);
    } else {
      match text[pos..].find(part) {
        Some(at) => pos += at + part.len(),
        None => return false,
      }
    }
  }
  true
}
