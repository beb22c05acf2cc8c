//! Error taxonomy for the proxy engine.

use http::StatusCode;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `passage::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of errors the proxy produces. Every wire-visible kind
/// maps to a response status through [`Error::status`].
#[derive(ThisError, Debug)]
pub enum Error {
  /// Invalid configuration, fatal at startup.
  #[error("invalid configuration: {0}")]
  ConfigInvalid(String),

  /// The client request could not be parsed.
  #[error("malformed request: {0}")]
  RequestMalformed(String),

  /// Proxy authentication missing or wrong.
  #[error("proxy authentication required")]
  AuthRequired,

  /// A deny rule rejected the request.
  #[error("{0}")]
  PolicyDenied(String),

  /// The upstream could not be dialed.
  #[error("{0}")]
  UpstreamUnreachable(String),

  /// The upstream did not answer in time.
  #[error("upstream timeout: {0}")]
  UpstreamTimeout(String),

  /// The inner TLS handshake of a MITM intercept failed.
  #[error("mitm handshake failed: {0}")]
  MitmHandshakeFailed(String),

  /// A modifier aborted the exchange with its own status.
  #[error("{message}")]
  ModifierAborted {
    /// Status chosen by the modifier's response hook.
    status: StatusCode,
    /// Short description of the abort.
    message: String,
  },

  /// Everything that should never happen.
  #[error("internal error: {0}")]
  InternalError(String),

  /// IO error on the client or upstream transport.
  #[error(transparent)]
  Io(#[from] std::io::Error),

  /// Invalid HTTP vocabulary values.
  #[error(transparent)]
  Http(#[from] http::Error),
}

impl Error {
  /// Create a policy denial and log it.
  pub fn policy_denied(msg: impl Into<String>) -> Self {
    let error = Error::PolicyDenied(msg.into());
    tracing::debug!("policy denied: {}", error);
    error
  }

  /// Create an unreachable-upstream error and log it.
  pub fn upstream_unreachable(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamUnreachable(msg.into());
    tracing::debug!("upstream unreachable: {}", error);
    error
  }

  /// Create an upstream-timeout error and log it.
  pub fn upstream_timeout(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamTimeout(msg.into());
    tracing::debug!("upstream timeout: {}", error);
    error
  }

  /// Create a malformed-request error and log it.
  pub fn malformed(msg: impl Into<String>) -> Self {
    let error = Error::RequestMalformed(msg.into());
    tracing::debug!("malformed request: {}", error);
    error
  }

  /// Create a MITM handshake error and log it.
  pub fn mitm_handshake(msg: impl Into<String>) -> Self {
    let error = Error::MitmHandshakeFailed(msg.into());
    tracing::error!("mitm handshake failed: {}", error);
    error
  }

  /// Create an internal error and log it.
  pub fn internal(msg: impl Into<String>) -> Self {
    let error = Error::InternalError(msg.into());
    tracing::error!("internal error: {}", error);
    error
  }

  /// Create a configuration error and log it.
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::ConfigInvalid(msg.into());
    tracing::error!("invalid configuration: {}", error);
    error
  }

  /// Response status for this error.
  ///
  /// An upstream error whose message equals a standard status phrase in the
  /// 400..=599 range adopts that status. This preserves the rejection
  /// reason when a chained HTTPS proxy refuses a CONNECT and the transport
  /// can only report the phrase.
  pub fn status(&self) -> StatusCode {
    match self {
      Error::ConfigInvalid(_) | Error::InternalError(_) | Error::Io(_) | Error::Http(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
      Error::RequestMalformed(_) => StatusCode::BAD_REQUEST,
      Error::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
      Error::PolicyDenied(_) => StatusCode::FORBIDDEN,
      Error::UpstreamUnreachable(msg) => {
        status_from_phrase(msg).unwrap_or(StatusCode::BAD_GATEWAY)
      }
      Error::UpstreamTimeout(msg) => {
        status_from_phrase(msg).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
      }
      Error::MitmHandshakeFailed(_) => StatusCode::BAD_GATEWAY,
      Error::ModifierAborted { status, .. } => *status,
    }
  }
}

fn status_from_phrase(msg: &str) -> Option<StatusCode> {
  for code in 400u16..=599 {
    if let Ok(status) = StatusCode::from_u16(code) {
      if status.canonical_reason() == Some(msg) {
        return Some(status);
      }
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_mapping() {
    assert_eq!(Error::malformed("x").status(), StatusCode::BAD_REQUEST);
    assert_eq!(Error::AuthRequired.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(Error::policy_denied("x").status(), StatusCode::FORBIDDEN);
    assert_eq!(Error::upstream_unreachable("dial refused").status(), StatusCode::BAD_GATEWAY);
    assert_eq!(Error::upstream_timeout("deadline").status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(Error::mitm_handshake("x").status(), StatusCode::BAD_GATEWAY);
    assert_eq!(Error::internal("x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
      Error::ModifierAborted {
        status: StatusCode::TOO_MANY_REQUESTS,
        message: "rate limited".into()
      }
      .status(),
      StatusCode::TOO_MANY_REQUESTS
    );
  }

  #[test]
  fn status_phrase_passthrough() {
    // A chained proxy's rejection phrase survives as the real status.
    assert_eq!(
      Error::upstream_unreachable("Service Unavailable").status(),
      StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
      Error::upstream_unreachable("Forbidden").status(),
      StatusCode::FORBIDDEN
    );
    // Phrases outside 400..=599 do not match.
    assert_eq!(Error::upstream_unreachable("OK").status(), StatusCode::BAD_GATEWAY);
  }
}
