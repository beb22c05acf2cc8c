//! Request/response modifier capabilities and their composition.
//!
//! A modifier implements [`RequestModifier`], [`ResponseModifier`] or both.
//! [`FifoGroup`] composes children so request modifiers run in registration
//! order and response modifiers in reverse, which makes an early-registered
//! modifier wrap the later ones. [`FifoGroup::seal`] produces an
//! [`Immutable`] view with no registration surface, used once the pipeline
//! is wired.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::http1::{Request, Response};

/// Capability to observe and rewrite requests.
#[async_trait]
pub trait RequestModifier: Send + Sync {
  /// Modify the request in place. An error aborts the exchange.
  async fn modify_request(&self, req: &mut Request) -> Result<()>;
}

/// Capability to observe and rewrite responses.
#[async_trait]
pub trait ResponseModifier: Send + Sync {
  /// Modify the response in place. An error aborts the exchange.
  async fn modify_response(&self, res: &mut Response) -> Result<()>;
}

/// Adapt a plain closure into a [`RequestModifier`].
pub fn request_modifier_fn<F>(f: F) -> Arc<dyn RequestModifier>
where
  F: Fn(&mut Request) -> Result<()> + Send + Sync + 'static,
{
  struct Func<F>(F);

  #[async_trait]
  impl<F> RequestModifier for Func<F>
  where
    F: Fn(&mut Request) -> Result<()> + Send + Sync,
  {
    async fn modify_request(&self, req: &mut Request) -> Result<()> {
      (self.0)(req)
    }
  }

  Arc::new(Func(f))
}

/// Adapt a plain closure into a [`ResponseModifier`].
pub fn response_modifier_fn<F>(f: F) -> Arc<dyn ResponseModifier>
where
  F: Fn(&mut Response) -> Result<()> + Send + Sync + 'static,
{
  struct Func<F>(F);

  #[async_trait]
  impl<F> ResponseModifier for Func<F>
  where
    F: Fn(&mut Response) -> Result<()> + Send + Sync,
  {
    async fn modify_response(&self, res: &mut Response) -> Result<()> {
      (self.0)(res)
    }
  }

  Arc::new(Func(f))
}

/// Sequential modifier group.
#[derive(Default)]
pub struct FifoGroup {
  reqmods: Vec<Arc<dyn RequestModifier>>,
  resmods: Vec<Arc<dyn ResponseModifier>>,
}

impl FifoGroup {
  /// An empty group.
  pub fn new() -> Self {
    FifoGroup::default()
  }

  /// Register a request modifier.
  pub fn add_request_modifier(&mut self, m: Arc<dyn RequestModifier>) {
    self.reqmods.push(m);
  }

  /// Register a response modifier.
  pub fn add_response_modifier(&mut self, m: Arc<dyn ResponseModifier>) {
    self.resmods.push(m);
  }

  /// Register a modifier on both sides.
  pub fn add<M>(&mut self, m: Arc<M>)
  where
    M: RequestModifier + ResponseModifier + 'static,
  {
    self.reqmods.push(m.clone());
    self.resmods.push(m);
  }

  /// Seal the group; no further registration is possible on the result.
  pub fn seal(self) -> Immutable {
    Immutable(self)
  }
}

#[async_trait]
impl RequestModifier for FifoGroup {
  async fn modify_request(&self, req: &mut Request) -> Result<()> {
    for m in &self.reqmods {
      m.modify_request(req).await?;
    }
    Ok(())
  }
}

#[async_trait]
impl ResponseModifier for FifoGroup {
  async fn modify_response(&self, res: &mut Response) -> Result<()> {
    for m in self.resmods.iter().rev() {
      m.modify_response(res).await?;
    }
    Ok(())
  }
}

/// A sealed modifier group.
pub struct Immutable(FifoGroup);

#[async_trait]
impl RequestModifier for Immutable {
  async fn modify_request(&self, req: &mut Request) -> Result<()> {
    self.0.modify_request(req).await
  }
}

#[async_trait]
impl ResponseModifier for Immutable {
  async fn modify_response(&self, res: &mut Response) -> Result<()> {
    self.0.modify_response(res).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use http::header::HeaderValue;

  fn tag_request(tag: &'static str) -> Arc<dyn RequestModifier> {
    request_modifier_fn(move |req| {
      req.headers.append("x-trace", HeaderValue::from_static(tag));
      Ok(())
    })
  }

  fn tag_response(tag: &'static str) -> Arc<dyn ResponseModifier> {
    response_modifier_fn(move |res| {
      res.headers.append("x-trace", HeaderValue::from_static(tag));
      Ok(())
    })
  }

  fn trace(headers: &http::HeaderMap) -> Vec<String> {
    headers
      .get_all("x-trace")
      .iter()
      .map(|v| v.to_str().unwrap().to_owned())
      .collect()
  }

  #[tokio::test]
  async fn request_modifiers_run_in_registration_order() {
    let mut g = FifoGroup::new();
    g.add_request_modifier(tag_request("a"));
    g.add_request_modifier(tag_request("b"));
    g.add_request_modifier(tag_request("c"));

    let mut req = Request::default();
    g.modify_request(&mut req).await.unwrap();
    assert_eq!(trace(&req.headers), ["a", "b", "c"]);
  }

  #[tokio::test]
  async fn response_modifiers_run_in_reverse_order() {
    let mut g = FifoGroup::new();
    g.add_response_modifier(tag_response("a"));
    g.add_response_modifier(tag_response("b"));
    g.add_response_modifier(tag_response("c"));

    let mut res = Response::default();
    g.modify_response(&mut res).await.unwrap();
    assert_eq!(trace(&res.headers), ["c", "b", "a"]);
  }

  #[tokio::test]
  async fn nested_groups_wrap_outermost_first() {
    let mut inner = FifoGroup::new();
    inner.add_request_modifier(tag_request("inner-req"));
    inner.add_response_modifier(tag_response("inner-res"));

    let mut outer = FifoGroup::new();
    outer.add_request_modifier(tag_request("outer-req"));
    outer.add_response_modifier(tag_response("outer-res"));
    outer.add(Arc::new(inner));

    let mut req = Request::default();
    outer.modify_request(&mut req).await.unwrap();
    assert_eq!(trace(&req.headers), ["outer-req", "inner-req"]);

    // Responses bubble from the innermost group back out.
    let mut res = Response::default();
    outer.modify_response(&mut res).await.unwrap();
    assert_eq!(trace(&res.headers), ["inner-res", "outer-res"]);
  }

  #[tokio::test]
  async fn errors_short_circuit_the_group() {
    let mut g = FifoGroup::new();
    g.add_request_modifier(tag_request("first"));
    g.add_request_modifier(request_modifier_fn(|_| Err(Error::policy_denied("nope"))));
    g.add_request_modifier(tag_request("unreached"));

    let mut req = Request::default();
    let err = g.modify_request(&mut req).await.unwrap_err();
    assert!(matches!(err, Error::PolicyDenied(_)));
    assert_eq!(trace(&req.headers), ["first"]);
  }

  #[tokio::test]
  async fn sealed_groups_still_run() {
    let mut g = FifoGroup::new();
    g.add_request_modifier(tag_request("sealed"));
    let sealed = g.seal();
    let mut req = Request::default();
    sealed.modify_request(&mut req).await.unwrap();
    assert_eq!(trace(&req.headers), ["sealed"]);
  }
}
