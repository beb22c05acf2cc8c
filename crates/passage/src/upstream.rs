//! Upstream selection: custom function, static URL or PAC, wrapped by the
//! direct-domains and direct-localhost bypasses.

use std::sync::Arc;

use passage_pac::{Proxies, ProxyResolver};

use crate::config::{ProxyFn, RuleSet};
use crate::credentials::CredentialsMatcher;
use crate::error::{Error, Result};
use crate::hosts::LocalhostResolver;
use crate::http1::Request;

/// One way to reach the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
  /// Dial the origin directly.
  Direct,
  /// Chain through a proxy; the URI may carry userinfo.
  Proxy(http::Uri),
}

enum SelectorKind {
  None,
  Func(ProxyFn),
  Static(http::Uri),
  Pac(Arc<ProxyResolver>),
}

/// Chooses the upstream candidates for each request.
///
/// Exactly one source is active: the custom function, the static URL, the
/// PAC resolver, or none (DIRECT). The direct-domains and direct-localhost
/// wrappers short-circuit to DIRECT before the source is consulted.
pub struct UpstreamSelector {
  kind: SelectorKind,
  direct_domains: Option<RuleSet>,
  direct_localhost: bool,
  localhost: Arc<LocalhostResolver>,
  credentials: Arc<CredentialsMatcher>,
}

impl UpstreamSelector {
  pub(crate) fn new(
    func: Option<ProxyFn>,
    static_url: Option<http::Uri>,
    pac: Option<Arc<ProxyResolver>>,
    direct_domains: Option<RuleSet>,
    direct_localhost: bool,
    localhost: Arc<LocalhostResolver>,
    credentials: Arc<CredentialsMatcher>,
  ) -> Self {
    // First non-nil source wins.
    let kind = if let Some(f) = func {
      SelectorKind::Func(f)
    } else if let Some(u) = static_url {
      SelectorKind::Static(u)
    } else if let Some(p) = pac {
      SelectorKind::Pac(p)
    } else {
      SelectorKind::None
    };
    UpstreamSelector {
      kind,
      direct_domains,
      direct_localhost,
      localhost,
      credentials,
    }
  }

  /// Selector that always answers DIRECT.
  pub fn direct() -> Self {
    UpstreamSelector {
      kind: SelectorKind::None,
      direct_domains: None,
      direct_localhost: false,
      localhost: Arc::new(LocalhostResolver::system()),
      credentials: Arc::new(CredentialsMatcher::default()),
    }
  }

  /// Ordered candidates for this request; the dialer uses the first one
  /// that connects.
  pub async fn select(&self, req: &Request) -> Result<Vec<Upstream>> {
    let hostname = req.hostname();
    if let Some(rules) = &self.direct_domains {
      if rules.matches(hostname) {
        return Ok(vec![Upstream::Direct]);
      }
    }
    if self.direct_localhost && self.localhost.is_localhost(hostname) {
      return Ok(vec![Upstream::Direct]);
    }

    match &self.kind {
      SelectorKind::None => Ok(vec![Upstream::Direct]),
      SelectorKind::Func(f) => match (f.as_ref())(req)? {
        Some(uri) => Ok(vec![Upstream::Proxy(self.with_credentials(uri))]),
        None => Ok(vec![Upstream::Direct]),
      },
      SelectorKind::Static(uri) => Ok(vec![Upstream::Proxy(self.with_credentials(uri.clone()))]),
      SelectorKind::Pac(resolver) => self.select_pac(resolver, req).await,
    }
  }

  async fn select_pac(&self, resolver: &Arc<ProxyResolver>, req: &Request) -> Result<Vec<Upstream>> {
    let resolver = resolver.clone();
    let url = req.uri.to_string();
    let host = req.hostname().to_owned();

    // Script evaluation and its DNS predicates may block.
    let answer = tokio::task::spawn_blocking(move || resolver.find_proxy_for_url(&url, &host))
      .await
      .map_err(|e| Error::internal(format!("pac evaluation task failed: {e}")))?
      .map_err(|e| Error::upstream_unreachable(format!("pac: {e}")))?;

    let candidates = Proxies::from(answer)
      .all()
      .map_err(|e| Error::upstream_unreachable(format!("pac: {e}")))?;
    if candidates.is_empty() {
      return Ok(vec![Upstream::Direct]);
    }

    let mut out = Vec::with_capacity(candidates.len());
    for c in candidates {
      match c.uri() {
        None => out.push(Upstream::Direct),
        Some(uri) => out.push(Upstream::Proxy(self.with_credentials(uri))),
      }
    }
    Ok(out)
  }

  /// Attach matched credentials to a proxy URL that carries none.
  fn with_credentials(&self, uri: http::Uri) -> http::Uri {
    let Some(authority) = uri.authority() else {
      return uri;
    };
    if authority.as_str().contains('@') {
      return uri;
    }
    let Some(user) = self.credentials.match_url(&uri) else {
      return uri;
    };

    let with_user = format!("{}@{}", user.as_userinfo(), authority);
    let Ok(authority) = with_user.parse::<http::uri::Authority>() else {
      return uri;
    };
    let mut parts = uri.into_parts();
    parts.authority = Some(authority);
    http::Uri::from_parts(parts).unwrap_or_else(|_| http::Uri::default())
  }
}

/// Userinfo of a proxy URI, parsed into credentials.
pub(crate) fn uri_userinfo(uri: &http::Uri) -> Option<crate::credentials::Userinfo> {
  let authority = uri.authority()?.as_str();
  let (userinfo, _) = authority.rsplit_once('@')?;
  crate::credentials::Userinfo::parse(userinfo).ok()
}
