//! Built-in middleware: the abort primitive, proxy authentication, deny
//! rules, credential injection and exchange logging.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use http::header::HeaderValue;
use http::StatusCode;

use crate::config::RuleSet;
use crate::credentials::{CredentialsMatcher, Userinfo};
use crate::error::{Error, Result};
use crate::hosts::LocalhostResolver;
use crate::http1::{write_response, Request, Response};
use crate::httplog::{dump_request, dump_response, redacted_url, HttpLogger, LogEntry};
use crate::modifier::{request_modifier_fn, RequestModifier, ResponseModifier};
use crate::session::Context;

/// Hook that turns an error into the response sent to the client.
pub type ErrorResponseHook = Arc<dyn Fn(&Request, &Error) -> Response + Send + Sync>;

/// Default error response: plain text carrying the error message, status
/// from the taxonomy.
pub fn default_error_response(_req: &Request, err: &Error) -> Response {
  let mut res = Response::new(err.status()).with_text(err.to_string());
  res.close = true;
  res
}

struct AbortIf<C, R, E> {
  condition: C,
  response: R,
  error: E,
  logger: HttpLogger,
}

#[async_trait]
impl<C, R, E> RequestModifier for AbortIf<C, R, E>
where
  C: Fn(&Request) -> bool + Send + Sync,
  R: Fn(&Request) -> Response + Send + Sync,
  E: Fn() -> Error + Send + Sync,
{
  async fn modify_request(&self, req: &mut Request) -> Result<()> {
    if !(self.condition)(req) {
      return Ok(());
    }

    let mut res = (self.response)(req);
    res.close = true;

    // Aborted exchanges still show up in the log.
    let trace = Context::from_request(req).map(|c| c.id()).unwrap_or_default();
    self.logger.log(&LogEntry {
      trace,
      method: req.method.to_string(),
      url: redacted_url(&req.uri),
      status: res.status.as_u16(),
      duration: Default::default(),
      request_dump: dump_request(req, self.logger.wants_body()),
      response_dump: dump_response(&res, self.logger.wants_body()),
    });

    let Some(ctx) = Context::from_request(req) else {
      return Err((self.error)());
    };
    let session = ctx.session();
    match session.hijack() {
      Ok(mut hijacked) => {
        if let Err(e) = write_response(&mut hijacked.stream, &res, None).await {
          tracing::debug!("failed to write abort response: {}", e);
        }
      }
      Err(_) => match session.hijack_response_writer() {
        Ok(mut writer) => {
          if let Err(e) = writer.write_response(&res).await {
            tracing::debug!("failed to write abort response: {}", e);
          }
        }
        Err(e) => tracing::error!("abort could not reach the client: {}", e),
      },
    }

    Err((self.error)())
  }
}

/// The abort primitive: when `condition` holds, synthesize a response
/// through `response`, write it on the hijacked transport and short-circuit
/// the pipeline with `error`.
pub fn abort_if<C, R, E>(
  condition: C,
  response: R,
  error: E,
  logger: HttpLogger,
) -> Arc<dyn RequestModifier>
where
  C: Fn(&Request) -> bool + Send + Sync + 'static,
  R: Fn(&Request) -> Response + Send + Sync + 'static,
  E: Fn() -> Error + Send + Sync + 'static,
{
  Arc::new(AbortIf {
    condition,
    response,
    error,
    logger,
  })
}

/// Gate requests on proxy basic auth; failures answer `407` with a
/// challenge.
pub fn proxy_basic_auth(
  credentials: Userinfo,
  realm: &str,
  logger: HttpLogger,
) -> Arc<dyn RequestModifier> {
  let expected = credentials.basic_auth();
  let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
    .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));

  abort_if(
    move |req| {
      req
        .headers
        .get(http::header::PROXY_AUTHORIZATION)
        .map(|got| got.as_bytes() != expected.as_bytes())
        .unwrap_or(true)
    },
    move |_req| {
      let mut res = Response::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .with_text("proxy authentication required");
      res
        .headers
        .insert(http::header::PROXY_AUTHENTICATE, challenge.clone());
      res
    },
    || Error::AuthRequired,
    logger,
  )
}

/// Deny requests whose destination classifies as localhost.
pub fn deny_localhost(
  resolver: Arc<LocalhostResolver>,
  error_response: ErrorResponseHook,
  logger: HttpLogger,
) -> Arc<dyn RequestModifier> {
  abort_if(
    move |req| resolver.is_localhost(req.hostname()),
    move |req| (error_response.as_ref())(req, &Error::PolicyDenied("localhost access denied".into())),
    || Error::policy_denied("localhost access denied"),
    logger,
  )
}

/// Deny requests whose destination hostname matches the rule set.
pub fn deny_domains(
  rules: RuleSet,
  error_response: ErrorResponseHook,
  logger: HttpLogger,
) -> Arc<dyn RequestModifier> {
  abort_if(
    move |req| rules.matches(req.hostname()),
    move |req| (error_response.as_ref())(req, &Error::PolicyDenied("domain access denied".into())),
    || Error::policy_denied("domain access denied"),
    logger,
  )
}

/// Inject matched credentials as `Authorization` on outgoing requests that
/// carry none.
pub fn set_basic_auth(credentials: Arc<CredentialsMatcher>) -> Arc<dyn RequestModifier> {
  request_modifier_fn(move |req| {
    if !req.headers.contains_key(http::header::AUTHORIZATION) {
      if let Some(user) = credentials.match_url(&req.uri) {
        req.headers.insert(http::header::AUTHORIZATION, user.basic_auth());
      }
    }
    Ok(())
  })
}

/// Keep the default client fingerprint out of outgoing requests.
pub fn set_empty_user_agent() -> Arc<dyn RequestModifier> {
  request_modifier_fn(|req| {
    if !req.headers.contains_key(http::header::USER_AGENT) {
      req.headers.insert(http::header::USER_AGENT, HeaderValue::from_static(""));
    }
    Ok(())
  })
}

/// Tag requests lacking the request-ID header with the context id.
pub fn request_id(header: http::header::HeaderName) -> Arc<dyn RequestModifier> {
  request_modifier_fn(move |req| {
    if !req.headers.contains_key(&header) {
      if let Some(ctx) = Context::from_request(req) {
        if let Ok(value) = HeaderValue::from_str(&ctx.id()) {
          req.headers.insert(header.clone(), value);
        }
      }
    }
    Ok(())
  })
}

const LOG_STATE_KEY: &str = "passage.httplog";

struct LogState {
  start: Instant,
  method: String,
  url: String,
  request_dump: String,
}

/// Exchange logger; registered on both sides of the inner group so the
/// request snapshot is taken after all rewrites and the response timing
/// covers the round trip.
pub struct LoggingModifier {
  logger: HttpLogger,
}

impl LoggingModifier {
  /// Logging middleware at the given verbosity.
  pub fn new(logger: HttpLogger) -> Arc<Self> {
    Arc::new(LoggingModifier { logger })
  }
}

#[async_trait]
impl RequestModifier for LoggingModifier {
  async fn modify_request(&self, req: &mut Request) -> Result<()> {
    if let Some(ctx) = Context::from_request(req) {
      ctx.set(
        LOG_STATE_KEY,
        Arc::new(LogState {
          start: Instant::now(),
          method: req.method.to_string(),
          url: redacted_url(&req.uri),
          request_dump: if self.logger.wants_dump() {
            dump_request(req, self.logger.wants_body())
          } else {
            String::new()
          },
        }),
      );
    }
    Ok(())
  }
}

#[async_trait]
impl ResponseModifier for LoggingModifier {
  async fn modify_response(&self, res: &mut Response) -> Result<()> {
    let Some(ctx) = Context::from_response(res) else {
      return Ok(());
    };
    let Some(state) = ctx.get(LOG_STATE_KEY) else {
      return Ok(());
    };
    let Some(state) = state.downcast_ref::<LogState>() else {
      return Ok(());
    };
    self.logger.log(&LogEntry {
      trace: ctx.id(),
      method: state.method.clone(),
      url: state.url.clone(),
      status: res.status.as_u16(),
      duration: state.start.elapsed(),
      request_dump: state.request_dump.clone(),
      response_dump: if self.logger.wants_dump() {
        dump_response(res, self.logger.wants_body())
      } else {
        String::new()
      },
    });
    Ok(())
  }
}
