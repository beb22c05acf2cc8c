//! Forward HTTP/HTTPS proxy with optional MITM inspection, pluggable
//! upstream selection and a modifier pipeline.
//!
//! Clients speak ordinary HTTP proxy protocol: absolute-form requests for
//! plaintext and CONNECT tunnels for TLS. Each exchange flows through a
//! two-layer modifier pipeline (security policy first, then the HTTP
//! compliance stack wrapping application middleware), an upstream selector
//! (static URL, PAC script via [`passage_pac`], or a custom function) and
//! the outbound [`transport::RoundTripper`]. With MITM configured, CONNECT
//! tunnels whose host matches the filter are terminated with an
//! on-the-fly certificate signed by the configured CA, and the inner
//! requests run through the same pipeline.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use passage::{CredentialsMatcher, HttpProxy, HttpProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), passage::Error> {
//!   let config = HttpProxyConfig {
//!     addr: "127.0.0.1:3128".parse().unwrap(),
//!     ..Default::default()
//!   };
//!   let proxy = Arc::new(HttpProxy::new(
//!     config,
//!     None,
//!     Arc::new(CredentialsMatcher::default()),
//!     None,
//!   )?);
//!   proxy.run().await
//! }
//! ```

pub mod config;
pub mod credentials;
mod error;
pub mod hosts;
pub mod http1;
pub mod httplog;
pub mod httpspec;
pub mod middleware;
pub mod mitm;
pub mod modifier;
mod proxy;
pub mod ratelimit;
pub mod session;
pub mod transport;
pub mod upstream;

pub use config::{HttpProxyConfig, Protocol, ProxyLocalhostMode, RuleSet};
pub use credentials::{CredentialsMatcher, HostPortUser, Userinfo};
pub use error::{Error, Result};
pub use http1::{Request, Response};
pub use httplog::LogMode;
pub use mitm::{CertificateAuthority, MitmConfig};
pub use modifier::{FifoGroup, RequestModifier, ResponseModifier};
pub use proxy::HttpProxy;
pub use session::{Context, Session};
pub use transport::{RoundTripper, Transport};
pub use upstream::Upstream;
