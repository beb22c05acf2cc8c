//! Per-connection sessions and per-exchange contexts.
//!
//! A [`Session`] lives for one client connection and owns its transport
//! between requests; a [`Context`] lives for one request/response pair and
//! is reachable from the request's extension bag, so modifiers deep in the
//! pipeline can find their way back to the session.

use std::any::Any;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

use crate::error::{Error, Result};
use crate::http1::{Request, Response};

/// Marker trait for byte streams a session can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A boxed client or upstream byte stream.
pub type Stream = Box<dyn AsyncStream>;

/// Response sink for embedded mode, where an external HTTP server owns the
/// connection and hands single requests to the proxy.
#[async_trait]
pub trait ResponseWriter: Send {
  /// Write a complete response.
  async fn write_response(&mut self, res: &Response) -> std::io::Result<()>;

  /// Take over the underlying connection. Adapters that cannot give up
  /// their transport return themselves back.
  fn hijack_stream(self: Box<Self>) -> std::result::Result<Stream, Box<dyn ResponseWriter>>;
}

/// The transport a session runs on.
pub(crate) enum SessionTransport {
  /// Owned connection with its buffered reader.
  Stream(BufReader<Stream>),
  /// Embedded-mode adapter.
  Writer(Box<dyn ResponseWriter>),
}

/// The raw transport handed out by [`Session::hijack`].
pub struct Hijacked {
  /// The connection itself.
  pub stream: Stream,
  /// Bytes already read off the connection but not yet consumed.
  pub read_buffer: Bytes,
}

#[derive(Default)]
struct SessionState {
  secure: bool,
  hijacked: bool,
  vals: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

/// State shared by all requests on one client connection.
pub struct Session {
  state: RwLock<SessionState>,
  transport: Mutex<Option<SessionTransport>>,
}

impl Session {
  pub(crate) fn new(transport: SessionTransport) -> Arc<Self> {
    Arc::new(Session {
      state: RwLock::new(SessionState::default()),
      transport: Mutex::new(Some(transport)),
    })
  }

  /// Session over an owned stream.
  pub fn from_stream(stream: Stream) -> Arc<Self> {
    Self::new(SessionTransport::Stream(BufReader::new(stream)))
  }

  /// Session over an embedded-mode response writer.
  pub fn from_response_writer(writer: Box<dyn ResponseWriter>) -> Arc<Self> {
    Self::new(SessionTransport::Writer(writer))
  }

  /// Whether the session runs over a connection the proxy decrypted.
  pub fn is_secure(&self) -> bool {
    self.state.read().unwrap_or_else(|e| e.into_inner()).secure
  }

  /// Mark the session secure; set when a MITM handshake completes.
  pub fn mark_secure(&self) {
    self.state.write().unwrap_or_else(|e| e.into_inner()).secure = true;
  }

  /// Whether the transport was taken over.
  pub fn is_hijacked(&self) -> bool {
    self.state.read().unwrap_or_else(|e| e.into_inner()).hijacked
  }

  /// Take control of the connection. The proxy performs no further reads
  /// or writes after this succeeds; a second hijack of either flavor
  /// fails.
  pub fn hijack(&self) -> Result<Hijacked> {
    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
    if state.hijacked {
      return Err(Error::internal("session has already been hijacked"));
    }
    let mut slot = self.transport.lock().unwrap_or_else(|e| e.into_inner());
    match slot.take() {
      Some(SessionTransport::Stream(reader)) => {
        state.hijacked = true;
        let read_buffer = Bytes::copy_from_slice(reader.buffer());
        Ok(Hijacked {
          stream: reader.into_inner(),
          read_buffer,
        })
      }
      Some(SessionTransport::Writer(writer)) => match writer.hijack_stream() {
        Ok(stream) => {
          state.hijacked = true;
          Ok(Hijacked {
            stream,
            read_buffer: Bytes::new(),
          })
        }
        Err(writer) => {
          *slot = Some(SessionTransport::Writer(writer));
          Err(Error::internal("hijack not supported by response writer"))
        }
      },
      None => Err(Error::internal("session transport is not available")),
    }
  }

  /// Take control of the embedded-mode response writer.
  pub fn hijack_response_writer(&self) -> Result<Box<dyn ResponseWriter>> {
    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
    if state.hijacked {
      return Err(Error::internal("session has already been hijacked"));
    }
    let mut slot = self.transport.lock().unwrap_or_else(|e| e.into_inner());
    match slot.take() {
      Some(SessionTransport::Writer(writer)) => {
        state.hijacked = true;
        Ok(writer)
      }
      other => {
        *slot = other;
        Err(Error::internal("session has no response writer"))
      }
    }
  }

  /// Get a session-scoped value.
  pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self
      .state
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .vals
      .get(key)
      .cloned()
  }

  /// Set a session-scoped value, persisted across the whole connection.
  pub fn set(&self, key: &str, val: Arc<dyn Any + Send + Sync>) {
    self
      .state
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .vals
      .insert(key.to_owned(), val);
  }

  pub(crate) fn take_transport(&self) -> Option<SessionTransport> {
    self.transport.lock().unwrap_or_else(|e| e.into_inner()).take()
  }

  pub(crate) fn restore_transport(&self, t: SessionTransport) {
    *self.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(t);
  }
}

#[derive(Default)]
struct ContextState {
  vals: HashMap<String, Arc<dyn Any + Send + Sync>>,
  skip_round_trip: bool,
  planted: Option<Response>,
}

/// State scoped to one request/response exchange.
pub struct Context {
  session: Arc<Session>,
  n: u64,
  salt: u32,
  state: RwLock<ContextState>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static PROCESS_SALT: OnceLock<u32> = OnceLock::new();

impl Context {
  /// Mint a fresh context on the given session.
  pub fn new(session: Arc<Session>) -> Arc<Self> {
    Arc::new(Context {
      session,
      n: NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1,
      salt: *PROCESS_SALT.get_or_init(rand::random),
      state: RwLock::new(ContextState::default()),
    })
  }

  /// The owning session.
  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  /// Identifier, unique within the process.
  pub fn id(&self) -> String {
    format!("{}-{:08x}", self.n, self.salt)
  }

  /// Get an exchange-scoped value.
  pub fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
    self
      .state
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .vals
      .get(key)
      .cloned()
  }

  /// Set an exchange-scoped value; dropped when the exchange completes.
  pub fn set(&self, key: &str, val: Arc<dyn Any + Send + Sync>) {
    self
      .state
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .vals
      .insert(key.to_owned(), val);
  }

  /// Skip the outbound round trip; the proxy will answer with the planted
  /// response instead.
  pub fn skip_round_trip(&self) {
    self.state.write().unwrap_or_else(|e| e.into_inner()).skip_round_trip = true;
  }

  /// Whether the round trip will be skipped.
  pub fn skipping_round_trip(&self) -> bool {
    self.state.read().unwrap_or_else(|e| e.into_inner()).skip_round_trip
  }

  /// Plant the response used when the round trip is skipped.
  pub fn set_response(&self, res: Response) {
    self.state.write().unwrap_or_else(|e| e.into_inner()).planted = Some(res);
  }

  pub(crate) fn take_response(&self) -> Option<Response> {
    self.state.write().unwrap_or_else(|e| e.into_inner()).planted.take()
  }

  /// Attach this context to a request's extension bag.
  pub fn attach(self: &Arc<Self>, req: &mut Request) {
    req.extensions.insert(ContextHandle(self.clone()));
  }

  /// Look up the context a request belongs to.
  pub fn from_request(req: &Request) -> Option<Arc<Context>> {
    req.extensions.get::<ContextHandle>().map(|h| h.0.clone())
  }

  /// Look up the context planted on a response.
  pub fn from_response(res: &Response) -> Option<Arc<Context>> {
    res.extensions.get::<ContextHandle>().map(|h| h.0.clone())
  }

  /// Attach this context to a response's extension bag.
  pub fn attach_response(self: &Arc<Self>, res: &mut Response) {
    res.extensions.insert(ContextHandle(self.clone()));
  }
}

/// Opaque handle stored in the message extension bags under a fixed key.
#[derive(Clone)]
struct ContextHandle(Arc<Context>);

/// A stream that replays a prefix before reading from the inner stream.
/// Used when switching a buffered reader to tunnel or TLS mode without
/// losing bytes the reader already pulled in.
pub(crate) struct Rewind<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> Rewind<S> {
  pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
    Rewind { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut TaskContext<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      let chunk = self.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut TaskContext<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(
    mut self: Pin<&mut Self>,
    cx: &mut TaskContext<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn stream_session() -> Arc<Session> {
    let (client, _server) = tokio::io::duplex(64);
    Session::from_stream(Box::new(client))
  }

  #[tokio::test]
  async fn context_ids_are_unique() {
    let session = stream_session();
    let mut seen = HashSet::new();
    for _ in 0..1000 {
      let ctx = Context::new(session.clone());
      assert!(seen.insert(ctx.id()), "duplicate context id {}", ctx.id());
    }
  }

  #[tokio::test]
  async fn context_round_trips_through_the_request() {
    let session = stream_session();
    let ctx = Context::new(session);
    let mut req = Request::default();
    ctx.attach(&mut req);
    let found = Context::from_request(&req).unwrap();
    assert_eq!(found.id(), ctx.id());
  }

  #[tokio::test]
  async fn second_hijack_fails() {
    let session = stream_session();
    assert!(!session.is_hijacked());
    let hijacked = session.hijack().unwrap();
    drop(hijacked);
    assert!(session.is_hijacked());
    assert!(session.hijack().is_err());
    assert!(session.hijack_response_writer().is_err());
  }

  #[tokio::test]
  async fn hijack_response_writer_fails_on_stream_sessions() {
    let session = stream_session();
    assert!(session.hijack_response_writer().is_err());
    // The transport is untouched, a stream hijack still works.
    assert!(session.hijack().is_ok());
  }

  #[tokio::test]
  async fn secure_flag() {
    let session = stream_session();
    assert!(!session.is_secure());
    session.mark_secure();
    assert!(session.is_secure());
  }

  #[tokio::test]
  async fn session_and_context_vals_are_scoped() {
    let session = stream_session();
    session.set("shared", Arc::new(7u32));
    let ctx = Context::new(session.clone());
    ctx.set("mine", Arc::new("x".to_owned()));

    let shared = session.get("shared").unwrap();
    assert_eq!(*shared.downcast_ref::<u32>().unwrap(), 7);
    assert!(ctx.get("shared").is_none());
    assert!(session.get("mine").is_none());
    assert!(ctx.get("mine").is_some());
  }

  #[tokio::test]
  async fn skip_round_trip_with_planted_response() {
    let session = stream_session();
    let ctx = Context::new(session);
    assert!(!ctx.skipping_round_trip());
    ctx.skip_round_trip();
    ctx.set_response(Response::new(http::StatusCode::IM_A_TEAPOT));
    assert!(ctx.skipping_round_trip());
    assert_eq!(ctx.take_response().unwrap().status, http::StatusCode::IM_A_TEAPOT);
  }

  #[tokio::test]
  async fn rewind_replays_the_prefix() {
    use tokio::io::AsyncReadExt;
    let (client, mut server) = tokio::io::duplex(64);
    tokio::spawn(async move {
      use tokio::io::AsyncWriteExt;
      server.write_all(b" world").await.unwrap();
    });
    let mut rewound = Rewind::new(Bytes::from_static(b"hello"), client);
    let mut buf = vec![0u8; 11];
    rewound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello world");
  }
}
