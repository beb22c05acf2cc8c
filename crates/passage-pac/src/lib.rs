//! Proxy Auto-Config (PAC) resolver.
//!
//! This crate compiles a PAC script once, validates that it defines
//! `FindProxyForURL(url, host)`, and evaluates it per request inside an
//! embedded JavaScript engine. The browser-standard helper predicates
//! (`isPlainHostName`, `dnsResolve`, `shExpMatch`, ...) are exposed to the
//! script as native functions.
//!
//! The string returned by the script is parsed with [`Proxies`] into an
//! ordered list of upstream candidates.
//!
//! # Example
//!
//! ```rust
//! use passage_pac::{Proxies, ProxyResolver};
//!
//! # fn run() -> Result<(), passage_pac::Error> {
//! let pr = ProxyResolver::new(
//!   r#"function FindProxyForURL(url, host) { return "PROXY proxy.local:8080; DIRECT"; }"#,
//! )?;
//! let answer = pr.find_proxy_for_url("http://example.com/", "example.com")?;
//! let candidates = Proxies::from(answer).all()?;
//! assert_eq!(candidates.len(), 2);
//! # Ok(())
//! # }
//! ```

mod builtins;
mod proxies;
mod resolver;

use thiserror::Error as ThisError;

pub use proxies::{Mode, Proxies, ProxyInfo};
pub use resolver::{DnsLookup, ProxyResolver, SystemDns};

/// A `Result` alias where the `Err` case is `passage_pac::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while compiling or evaluating a PAC script,
/// or while parsing its answer.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The PAC source failed to compile.
  #[error("PAC script compile error: {0}")]
  Compile(String),
  /// The script does not define a callable `FindProxyForURL`.
  #[error("PAC script must define FindProxyForURL function")]
  MissingFindProxyForURL,
  /// The script raised or misbehaved during evaluation.
  #[error("PAC evaluation error: {0}")]
  Evaluate(String),
  /// `FindProxyForURL` returned something other than a string.
  #[error("FindProxyForURL returned a non-string value")]
  NonStringReturn,
  /// A proxy-string token could not be parsed.
  #[error("invalid proxy token {token:?}: {reason}")]
  InvalidProxy {
    /// The offending token.
    token: String,
    /// Why it was rejected.
    reason: String,
  },
  /// The proxy string contained no candidates where one was required.
  #[error("empty proxy list")]
  EmptyProxyList,
}
