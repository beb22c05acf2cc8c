//! Standards-compliance modifiers: hop-by-hop header handling, `Via` and
//! `Host` fixups.
//!
//! [`stack`] assembles these around an inner application-level group so
//! user modifiers always see canonical messages.

use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::Error;
use crate::modifier::{request_modifier_fn, response_modifier_fn, FifoGroup, RequestModifier};

const HOP_BY_HOP: &[HeaderName] = &[
  http::header::CONNECTION,
  http::header::PROXY_AUTHENTICATE,
  http::header::PROXY_AUTHORIZATION,
  http::header::TE,
  http::header::TRAILER,
  http::header::TRANSFER_ENCODING,
  http::header::UPGRADE,
];

/// Remove hop-by-hop headers, including everything named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let connection_named: Vec<String> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect();

  for name in HOP_BY_HOP {
    headers.remove(name);
  }
  headers.remove("proxy-connection");
  headers.remove("keep-alive");
  for name in connection_named {
    if let Ok(name) = name.parse::<HeaderName>() {
      headers.remove(name);
    }
  }
}

fn via_token(name: &str) -> String {
  format!("1.1 {name}")
}

/// Append a `Via` entry and fail on forwarding loops.
fn via_modifier(name: &str) -> Arc<dyn RequestModifier> {
  let token = via_token(name);
  request_modifier_fn(move |req| {
    if let Some(existing) = req.headers.get(http::header::VIA).and_then(|v| v.to_str().ok()) {
      if existing.split(',').any(|t| t.trim() == token) {
        return Err(Error::malformed(format!("via loop detected on {token:?}")));
      }
      let combined = format!("{existing}, {token}");
      req.headers.insert(
        http::header::VIA,
        HeaderValue::from_str(&combined).map_err(|e| Error::malformed(e.to_string()))?,
      );
    } else {
      req.headers.insert(
        http::header::VIA,
        HeaderValue::from_str(&token).map_err(|e| Error::malformed(e.to_string()))?,
      );
    }
    Ok(())
  })
}

/// Make the `Host` header agree with the request target.
fn host_fixup() -> Arc<dyn RequestModifier> {
  request_modifier_fn(|req| {
    if let Some(authority) = req.uri.authority() {
      let value = HeaderValue::from_str(authority.as_str())
        .map_err(|e| Error::malformed(e.to_string()))?;
      req.headers.insert(http::header::HOST, value);
    }
    Ok(())
  })
}

/// Build the compliance stack around the application-level group.
///
/// Request side: strip hop-by-hop, handle `Via`, fix `Host`, then the inner
/// group. Response side runs in reverse, so the inner group observes the
/// response before the hop-by-hop cleanup.
pub fn stack(name: &str, fg: FifoGroup) -> FifoGroup {
  let mut stack = FifoGroup::new();
  stack.add_request_modifier(request_modifier_fn(|req| {
    strip_hop_by_hop(&mut req.headers);
    Ok(())
  }));
  stack.add_request_modifier(via_modifier(name));
  stack.add_request_modifier(host_fixup());
  stack.add_response_modifier(response_modifier_fn(|res| {
    strip_hop_by_hop(&mut res.headers);
    Ok(())
  }));
  stack.add(Arc::new(fg));
  stack
}
