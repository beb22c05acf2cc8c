//! The proxy server: accept loop, per-session request loop, CONNECT
//! handling with optional MITM, and response delivery.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use passage_pac::ProxyResolver;

use crate::config::{HttpProxyConfig, Protocol, ProxyLocalhostMode};
use crate::credentials::CredentialsMatcher;
use crate::error::{Error, Result};
use crate::hosts::LocalhostResolver;
use crate::http1::{read_request, write_response, ReadOptions, Request, Response};
use crate::httplog::{HttpLogger, LogMode};
use crate::middleware::{
  default_error_response, deny_domains, deny_localhost, proxy_basic_auth, set_basic_auth,
  set_empty_user_agent, ErrorResponseHook, LoggingModifier,
};
use crate::mitm::CertificateAuthority;
use crate::modifier::{FifoGroup, Immutable, RequestModifier as _, ResponseModifier as _};
use crate::ratelimit::{RateLimit, RateLimitedStream};
use crate::session::{
  Context, ResponseWriter, Rewind, Session, SessionTransport, Stream,
};
use crate::transport::{RoundTripper, Transport};
use crate::upstream::UpstreamSelector;
use crate::{httpspec, middleware};

/// Forward HTTP/HTTPS proxy over the configured listener.
pub struct HttpProxy {
  config: HttpProxyConfig,
  modifiers: Arc<Immutable>,
  selector: Arc<UpstreamSelector>,
  transport: Arc<dyn RoundTripper>,
  mitm: Option<Arc<CertificateAuthority>>,
  error_response: ErrorResponseHook,
  tls_acceptor: Option<TlsAcceptor>,
  read_rate: Option<RateLimit>,
  write_rate: Option<RateLimit>,
  shutdown: watch::Sender<bool>,
}

impl HttpProxy {
  /// Build a proxy from validated configuration.
  ///
  /// `pac` is mutually exclusive with the static upstream URL and the
  /// custom upstream function. A default [`Transport`] is used when none
  /// is supplied.
  pub fn new(
    config: HttpProxyConfig,
    pac: Option<Arc<ProxyResolver>>,
    credentials: Arc<CredentialsMatcher>,
    transport: Option<Arc<dyn RoundTripper>>,
  ) -> Result<Self> {
    config.validate()?;
    if pac.is_some() && (config.upstream_proxy.is_some() || config.upstream_proxy_func.is_some()) {
      return Err(Error::config("cannot use both an upstream proxy and PAC"));
    }

    let localhost = Arc::new(LocalhostResolver::system());
    let error_response: ErrorResponseHook = config
      .error_response
      .clone()
      .unwrap_or_else(|| Arc::new(default_error_response));

    let mitm = match &config.mitm {
      Some(mc) => {
        tracing::info!("using MITM");
        Some(Arc::new(CertificateAuthority::from_pem(mc)?))
      }
      None => None,
    };

    let selector = Arc::new(UpstreamSelector::new(
      config.upstream_proxy_func.clone(),
      config.upstream_proxy.clone(),
      pac,
      config.direct_domains.clone(),
      config.proxy_localhost == ProxyLocalhostMode::Direct,
      localhost.clone(),
      credentials.clone(),
    ));
    tracing::info!("localhost proxying mode={}", config.proxy_localhost);

    let modifiers = Arc::new(Self::middleware_stack(
      &config,
      localhost,
      credentials,
      error_response.clone(),
    ));

    let tls_acceptor = match config.protocol {
      Protocol::Http => None,
      Protocol::Https | Protocol::H2 => Some(Self::tls_acceptor(&config)?),
    };

    let (shutdown, _) = watch::channel(false);
    Ok(HttpProxy {
      modifiers,
      selector,
      transport: transport.unwrap_or_else(|| Arc::new(Transport::new())),
      mitm,
      error_response,
      tls_acceptor,
      read_rate: (config.read_limit > 0).then(|| RateLimit::new(config.read_limit)),
      write_rate: (config.write_limit > 0).then(|| RateLimit::new(config.write_limit)),
      shutdown,
      config,
    })
  }

  fn tls_acceptor(config: &HttpProxyConfig) -> Result<TlsAcceptor> {
    let cert_pem = config.tls_cert_pem.as_deref().unwrap_or_default();
    let key_pem = config.tls_key_pem.as_deref().unwrap_or_default();
    let certs: std::result::Result<Vec<_>, _> =
      rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect();
    let certs = certs.map_err(|e| Error::config(format!("invalid TLS certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
      .map_err(|e| Error::config(format!("invalid TLS key: {e}")))?
      .ok_or_else(|| Error::config("no private key in TLS key PEM"))?;
    let server_config = tokio_rustls::rustls::ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| Error::config(format!("invalid TLS material: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
  }

  /// The security/policy layer runs first so denied requests never enter
  /// the compliance stack; application middleware lives in the inner
  /// group.
  fn middleware_stack(
    config: &HttpProxyConfig,
    localhost: Arc<LocalhostResolver>,
    credentials: Arc<CredentialsMatcher>,
    error_response: ErrorResponseHook,
  ) -> Immutable {
    let logger = HttpLogger::new(config.log_http);

    let mut topg = FifoGroup::new();
    if let Some(user) = &config.basic_auth {
      tracing::info!("basic auth enabled");
      topg.add_request_modifier(proxy_basic_auth(user.clone(), &config.name, logger));
    }
    if config.proxy_localhost == ProxyLocalhostMode::Deny {
      topg.add_request_modifier(deny_localhost(localhost, error_response.clone(), logger));
    }
    if let Some(rules) = &config.deny_domains {
      topg.add_request_modifier(deny_domains(rules.clone(), error_response, logger));
    }

    let mut fg = FifoGroup::new();
    fg.add_request_modifier(middleware::request_id(config.request_id_header.clone()));
    for m in &config.request_modifiers {
      fg.add_request_modifier(m.clone());
    }
    for m in &config.response_modifiers {
      fg.add_response_modifier(m.clone());
    }
    if config.log_http != LogMode::None {
      fg.add(LoggingModifier::new(logger));
    }
    fg.add_request_modifier(set_basic_auth(credentials));
    fg.add_request_modifier(set_empty_user_agent());

    topg.add(Arc::new(httpspec::stack(&config.name, fg)));
    topg.seal()
  }

  /// The MITM CA, when interception is configured.
  pub fn mitm_authority(&self) -> Option<&Arc<CertificateAuthority>> {
    self.mitm.as_ref()
  }

  /// Bind the configured listener address.
  pub async fn listen(&self) -> Result<TcpListener> {
    let listener = TcpListener::bind(self.config.addr)
      .await
      .map_err(|e| Error::config(format!("failed to bind {}: {e}", self.config.addr)))?;
    Ok(listener)
  }

  /// Stop accepting connections; in-flight exchanges finish on their own.
  pub fn close(&self) {
    let _ = self.shutdown.send(true);
  }

  /// Accept loop. Returns when [`HttpProxy::close`] is called or the
  /// listener breaks.
  pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("proxy listening address={} protocol={}", addr, self.config.protocol);
    let mut shutdown = self.shutdown.subscribe();

    loop {
      tokio::select! {
        _ = shutdown.changed() => {
          tracing::info!("proxy listener closing");
          return Ok(());
        }
        accepted = listener.accept() => {
          let (stream, peer) = accepted?;
          let proxy = self.clone();
          tokio::spawn(async move {
            if let Err(e) = proxy.handle_connection(stream, peer).await {
              tracing::debug!(peer = %peer, "session ended with error: {}", e);
            }
          });
        }
      }
    }
  }

  /// Bind and serve until shutdown.
  pub async fn run(self: &Arc<Self>) -> Result<()> {
    let listener = self.listen().await?;
    self.serve(listener).await
  }

  async fn handle_connection(self: Arc<Self>, stream: TcpStream, _peer: SocketAddr) -> Result<()> {
    let _ = stream.set_nodelay(true);

    // read_limit caps bytes clients read from us, which is this stream's
    // write side; write_limit is the converse.
    let stream: Stream = if self.read_rate.is_some() || self.write_rate.is_some() {
      Box::new(RateLimitedStream::new(
        stream,
        self.write_rate.clone(),
        self.read_rate.clone(),
      ))
    } else {
      Box::new(stream)
    };

    let stream: Stream = match &self.tls_acceptor {
      Some(acceptor) => Box::new(
        acceptor
          .accept(stream)
          .await
          .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
      ),
      None => stream,
    };

    let session = Session::from_stream(stream);
    let Some(SessionTransport::Stream(reader)) = session.take_transport() else {
      return Err(Error::internal("fresh session has no transport"));
    };
    self.run_loop(session, reader).await
  }

  fn read_options(&self) -> ReadOptions {
    ReadOptions {
      header_timeout: opt(self.config.read_header_timeout),
      read_timeout: opt(self.config.read_timeout),
      ..Default::default()
    }
  }

  fn write_timeout(&self) -> Option<Duration> {
    opt(self.config.write_timeout)
  }

  fn loop_boxed<'a>(
    self: &'a Arc<Self>,
    session: Arc<Session>,
    reader: BufReader<Stream>,
  ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(self.run_loop(session, reader))
  }

  /// Per-session request loop; one iteration per keep-alive exchange.
  async fn run_loop(
    self: &Arc<Self>,
    session: Arc<Session>,
    mut reader: BufReader<Stream>,
  ) -> Result<()> {
    loop {
      let secure_scheme = session.is_secure().then_some("https");
      let tunnel_authority = session
        .get(TUNNEL_AUTHORITY_KEY)
        .and_then(|v| v.downcast_ref::<String>().cloned());
      let mut req = match read_request(
        &mut reader,
        &self.read_options(),
        secure_scheme,
        tunnel_authority.as_deref(),
      )
      .await
      {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
          tracing::debug!("idle session timed out");
          return Ok(());
        }
        Err(e) => {
          let mut res = (self.error_response.as_ref())(&Request::default(), &e);
          res.close = true;
          let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
          return Err(e);
        }
      };

      let ctx = Context::new(session.clone());
      ctx.attach(&mut req);

      if req.method == Method::CONNECT {
        return self.handle_connect(session, reader, req).await;
      }

      // Run request modifiers with the transport parked in the session so
      // an aborting modifier can hijack it.
      session.restore_transport(SessionTransport::Stream(reader));
      let modified = self.modifiers.modify_request(&mut req).await;
      if session.is_hijacked() {
        if let Err(e) = modified {
          tracing::debug!("request aborted: {}", e);
        }
        return Ok(());
      }
      reader = take_stream(&session)?;

      let (mut res, failed) = match modified {
        Err(e) => ((self.error_response.as_ref())(&req, &e), true),
        Ok(()) => {
          if ctx.skipping_round_trip() {
            (
              ctx.take_response().unwrap_or_else(|| Response::new(StatusCode::OK)),
              false,
            )
          } else {
            match self.round_trip(&req, &mut reader).await {
              Ok(Some(res)) => (res, false),
              Ok(None) => {
                tracing::debug!("client disconnected during round trip");
                return Ok(());
              }
              Err(e) => ((self.error_response.as_ref())(&req, &e), true),
            }
          }
        }
      };

      ctx.attach_response(&mut res);
      session.restore_transport(SessionTransport::Stream(reader));
      let res_modified = self.modifiers.modify_response(&mut res).await;
      if session.is_hijacked() {
        return Ok(());
      }
      reader = take_stream(&session)?;
      if let Err(e) = res_modified {
        let mut res = (self.error_response.as_ref())(&req, &e);
        res.close = true;
        let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
        return Err(e);
      }

      let close =
        failed || self.config.close_after_reply || res.close || req.wants_close();
      res.close = close;
      if let Err(e) = write_response(reader.get_mut(), &res, self.write_timeout()).await {
        tracing::debug!("failed to write response: {}", e);
        return Ok(());
      }
      if close {
        return Ok(());
      }
    }
  }

  /// Round trip with client-disconnect cancellation: when the client goes
  /// away mid-flight, the exchange is dropped instead of completing into
  /// a dead socket.
  async fn round_trip(
    &self,
    req: &Request,
    reader: &mut BufReader<Stream>,
  ) -> Result<Option<Response>> {
    let upstreams = self.selector.select(req).await?;
    tokio::select! {
      res = self.transport.round_trip(req, &upstreams) => res.map(Some),
      () = wait_for_eof(reader) => Ok(None),
    }
  }

  async fn handle_connect(
    self: &Arc<Self>,
    session: Arc<Session>,
    mut reader: BufReader<Stream>,
    mut req: Request,
  ) -> Result<()> {
    if let Some(hook) = &self.config.connect_request_modifier {
      if let Err(e) = (hook.as_ref())(&mut req) {
        let e = Error::upstream_unreachable(format!("connect request modifier: {e}"));
        let mut res = (self.error_response.as_ref())(&req, &e);
        res.close = true;
        let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
        return Err(e);
      }
    }

    // Policy modifiers gate CONNECT like any other request; the tunneled
    // bytes themselves stay opaque.
    session.restore_transport(SessionTransport::Stream(reader));
    let modified = self.modifiers.modify_request(&mut req).await;
    if session.is_hijacked() {
      if let Err(e) = modified {
        tracing::debug!("connect aborted: {}", e);
      }
      return Ok(());
    }
    reader = take_stream(&session)?;
    if let Err(e) = modified {
      let mut res = (self.error_response.as_ref())(&req, &e);
      res.close = true;
      let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
      return Err(e);
    }

    let authority = req.host_port();
    let host = req.hostname().to_owned();

    let intercept = match (&self.mitm, &self.config.mitm_domains) {
      (Some(_), Some(rules)) => rules.matches(&host),
      (Some(_), None) => true,
      (None, _) => false,
    };

    if intercept {
      let mitm = self.mitm.clone().ok_or_else(|| Error::internal("mitm state missing"))?;
      return self.intercept_connect(session, reader, &mitm, &host, &authority).await;
    }

    self.tunnel_connect(reader, &req, &authority).await
  }

  /// Terminate TLS with a minted certificate and re-enter the request
  /// loop on the decrypted stream.
  async fn intercept_connect(
    self: &Arc<Self>,
    session: Arc<Session>,
    mut reader: BufReader<Stream>,
    mitm: &Arc<CertificateAuthority>,
    host: &str,
    authority: &str,
  ) -> Result<()> {
    let server_config = match mitm.server_config(host).await {
      Ok(config) => config,
      Err(e) => {
        let mut res = (self.error_response.as_ref())(&Request::default(), &e);
        res.close = true;
        let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
        return Err(e);
      }
    };

    write_connection_established(reader.get_mut()).await?;

    let leftover = Bytes::copy_from_slice(reader.buffer());
    let stream = reader.into_inner();
    let acceptor = TlsAcceptor::from(server_config);
    let tls = acceptor
      .accept(Rewind::new(leftover, stream))
      .await
      .map_err(|e| Error::mitm_handshake(format!("{host}: {e}")))?;

    session.mark_secure();
    session.set(TUNNEL_AUTHORITY_KEY, Arc::new(authority.to_owned()));
    tracing::debug!("mitm established for {}", host);
    self
      .loop_boxed(session, BufReader::new(Box::new(tls) as Stream))
      .await
  }

  /// Blind tunnel: dial through the selected upstream, answer 200 and
  /// relay bytes without applying middleware. `connect_passthrough`
  /// shares this path, since no interception is configured either way.
  async fn tunnel_connect(
    &self,
    mut reader: BufReader<Stream>,
    req: &Request,
    authority: &str,
  ) -> Result<()> {
    // Upstream selection sees the tunnel target as an https URL.
    let selection = Request {
      method: Method::CONNECT,
      uri: format!("https://{authority}")
        .parse()
        .map_err(|_| Error::malformed(format!("invalid CONNECT authority {authority:?}")))?,
      ..Default::default()
    };

    let upstream = async {
      let upstreams = self.selector.select(&selection).await?;
      self.transport.dial(authority, &upstreams).await
    }
    .await;

    let mut upstream = match upstream {
      Ok(stream) => stream,
      Err(e) => {
        let mut res = (self.error_response.as_ref())(req, &e);
        res.close = true;
        let _ = write_response(reader.get_mut(), &res, self.write_timeout()).await;
        return Err(e);
      }
    };

    write_connection_established(reader.get_mut()).await?;

    // Bytes the client pipelined behind the CONNECT head belong upstream.
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let mut client = reader.into_inner();
    if !leftover.is_empty() {
      upstream.write_all(&leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
  }

  /// Embedded mode: serve a single request handed over by an external
  /// HTTP server through a [`ResponseWriter`].
  pub async fn handle_request(
    self: &Arc<Self>,
    mut req: Request,
    writer: Box<dyn ResponseWriter>,
  ) -> Result<()> {
    let session = Session::from_response_writer(writer);
    let ctx = Context::new(session.clone());
    ctx.attach(&mut req);

    if req.method == Method::CONNECT {
      return match session.hijack() {
        Ok(hijacked) => {
          // The adapter gave up its connection; continue on the raw
          // stream as if the proxy owned it all along.
          let stream: Stream = Box::new(Rewind::new(hijacked.read_buffer, hijacked.stream));
          let session = Session::from_stream(stream);
          let Some(SessionTransport::Stream(reader)) = session.take_transport() else {
            return Err(Error::internal("fresh session has no transport"));
          };
          self.handle_connect(session, reader, req).await
        }
        Err(_) => {
          let mut writer = session.hijack_response_writer()?;
          let mut res = Response::new(StatusCode::NOT_IMPLEMENTED)
            .with_text("connect is not supported on this server");
          res.close = true;
          writer.write_response(&res).await?;
          Ok(())
        }
      };
    }

    let modified = self.modifiers.modify_request(&mut req).await;
    if session.is_hijacked() {
      return Ok(());
    }
    let (mut res, _failed) = match modified {
      Err(e) => ((self.error_response.as_ref())(&req, &e), true),
      Ok(()) => {
        if ctx.skipping_round_trip() {
          (
            ctx.take_response().unwrap_or_else(|| Response::new(StatusCode::OK)),
            false,
          )
        } else {
          let outcome = async {
            let upstreams = self.selector.select(&req).await?;
            self.transport.round_trip(&req, &upstreams).await
          }
          .await;
          match outcome {
            Ok(res) => (res, false),
            Err(e) => ((self.error_response.as_ref())(&req, &e), true),
          }
        }
      }
    };

    ctx.attach_response(&mut res);
    let res_modified = self.modifiers.modify_response(&mut res).await;
    if session.is_hijacked() {
      return Ok(());
    }
    if let Err(e) = res_modified {
      res = (self.error_response.as_ref())(&req, &e);
      res.close = true;
    }

    let mut writer = session.hijack_response_writer()?;
    writer.write_response(&res).await?;
    Ok(())
  }
}

const TUNNEL_AUTHORITY_KEY: &str = "passage.tunnel_authority";

fn opt(d: Duration) -> Option<Duration> {
  (!d.is_zero()).then_some(d)
}

fn take_stream(session: &Arc<Session>) -> Result<BufReader<Stream>> {
  match session.take_transport() {
    Some(SessionTransport::Stream(reader)) => Ok(reader),
    Some(other) => {
      session.restore_transport(other);
      Err(Error::internal("session transport changed shape"))
    }
    None => Err(Error::internal("session transport disappeared")),
  }
}

async fn write_connection_established(stream: &mut Stream) -> Result<()> {
  stream
    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
    .await?;
  stream.flush().await?;
  Ok(())
}

/// Resolves when the client side reaches EOF or errors. Pipelined bytes
/// park this future forever, which keeps the race in favor of the round
/// trip.
async fn wait_for_eof(reader: &mut BufReader<Stream>) {
  loop {
    match reader.fill_buf().await {
      Ok(buf) if buf.is_empty() => return,
      Ok(_) => std::future::pending::<()>().await,
      Err(_) => return,
    }
  }
}
