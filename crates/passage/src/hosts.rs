//! Localhost classification that never dials.
//!
//! The deny-localhost and direct-localhost policies must not be subvertible
//! by DNS answers, so classification consults only the literal hostname,
//! IP-literal parsing and the local hosts file.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// Parsed hosts-file entries, hostname to addresses.
#[derive(Debug, Default, Clone)]
pub struct HostsFile {
  entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
  /// Load the platform hosts file; unreadable or absent files yield an
  /// empty table.
  pub fn system() -> Self {
    let path = if cfg!(windows) {
      Path::new(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
      Path::new("/etc/hosts")
    };
    match std::fs::read_to_string(path) {
      Ok(content) => Self::parse(&content),
      Err(_) => HostsFile::default(),
    }
  }

  /// Parse hosts-file syntax: `address name [name...]`, `#` comments.
  pub fn parse(content: &str) -> Self {
    let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for line in content.lines() {
      let line = line.split('#').next().unwrap_or_default().trim();
      if line.is_empty() {
        continue;
      }
      let mut fields = line.split_whitespace();
      let Some(addr) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
        continue;
      };
      for name in fields {
        entries.entry(name.to_ascii_lowercase()).or_default().push(addr);
      }
    }
    HostsFile { entries }
  }

  /// Addresses mapped to a hostname, if any.
  pub fn lookup(&self, host: &str) -> Option<&[IpAddr]> {
    self.entries.get(&host.to_ascii_lowercase()).map(Vec::as_slice)
  }
}

/// Classifies destination hostnames as localhost or not.
#[derive(Debug, Clone)]
pub struct LocalhostResolver {
  hosts: HostsFile,
}

impl LocalhostResolver {
  /// Resolver over the system hosts file.
  pub fn system() -> Self {
    LocalhostResolver {
      hosts: HostsFile::system(),
    }
  }

  /// Resolver over fixed hosts-file content, for tests.
  pub fn with_hosts(hosts: HostsFile) -> Self {
    LocalhostResolver { hosts }
  }

  /// Whether the hostname refers to the local machine.
  ///
  /// True iff the name is literally `localhost`, an IP literal with the
  /// loopback bit, or a hosts-file name mapping to a loopback address.
  pub fn is_localhost(&self, host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
      return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
      return ip.is_loopback();
    }
    match self.hosts.lookup(host).and_then(|addrs| addrs.first()) {
      Some(ip) => ip.is_loopback(),
      None => false,
    }
  }
}

impl Default for LocalhostResolver {
  fn default() -> Self {
    Self::system()
  }
}
