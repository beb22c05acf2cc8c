//! Outbound leg: dialing origins and chained proxies, and the round-trip
//! contract the proxy state machine drives.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::http1::{read_response, write_request, ReadOptions, Request, Response};
use crate::session::Stream;
use crate::upstream::{uri_userinfo, Upstream};

/// The outbound round-trip contract.
///
/// `upstreams` is the ordered candidate list from upstream selection; the
/// first candidate that dials successfully carries the exchange.
#[async_trait]
pub trait RoundTripper: Send + Sync {
  /// Execute one exchange against the origin or a chained proxy.
  async fn round_trip(&self, req: &Request, upstreams: &[Upstream]) -> Result<Response>;

  /// Open a raw tunnel to `authority` (`host:port`), used for CONNECT.
  async fn dial(&self, authority: &str, upstreams: &[Upstream]) -> Result<Stream>;
}

/// Default transport over TCP, TLS and the supported proxy schemes.
pub struct Transport {
  connect_timeout: Duration,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  extra_roots: Vec<CertificateDer<'static>>,
  tls: std::sync::OnceLock<Arc<ClientConfig>>,
}

impl Default for Transport {
  fn default() -> Self {
    Transport {
      connect_timeout: Duration::from_secs(10),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      extra_roots: Vec::new(),
      tls: std::sync::OnceLock::new(),
    }
  }
}

impl Transport {
  /// Transport with default timeouts and the native root store.
  pub fn new() -> Self {
    Transport::default()
  }

  /// Bound the connect phase.
  pub fn connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Bound individual reads on upstream connections.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.read_timeout = timeout;
    self
  }

  /// Bound individual writes on upstream connections.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.write_timeout = timeout;
    self
  }

  /// Trust an additional root certificate, e.g. a private CA.
  pub fn extra_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
    self.extra_roots.push(cert);
    self
  }

  fn client_config(&self) -> Arc<ClientConfig> {
    self
      .tls
      .get_or_init(|| {
        let mut roots = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
          let _ = roots.add(cert);
        }
        for cert in &self.extra_roots {
          let _ = roots.add(cert.clone());
        }
        let config = ClientConfig::builder()
          .with_root_certificates(roots)
          .with_no_client_auth();
        Arc::new(config)
      })
      .clone()
  }

  fn read_options(&self) -> ReadOptions {
    ReadOptions {
      header_timeout: self.read_timeout,
      read_timeout: self.read_timeout,
      ..Default::default()
    }
  }

  async fn tcp_connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let fut = TcpStream::connect((host, port));
    let stream = tokio::time::timeout(self.connect_timeout, fut)
      .await
      .map_err(|_| Error::upstream_timeout(format!("connect to {host}:{port}")))?
      .map_err(|e| Error::upstream_unreachable(format!("failed to connect to {host}:{port}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
  }

  async fn tls_connect(&self, stream: Stream, host: &str) -> Result<Stream> {
    let server_name = ServerName::try_from(host.to_owned())
      .map_err(|_| Error::upstream_unreachable(format!("invalid TLS server name {host:?}")))?;
    let connector = TlsConnector::from(self.client_config());
    let tls = connector
      .connect(server_name, stream)
      .await
      .map_err(|e| Error::upstream_unreachable(format!("TLS handshake with {host} failed: {e}")))?;
    Ok(Box::new(tls))
  }

  /// Dial one candidate towards `authority`.
  async fn dial_candidate(&self, authority: &str, upstream: &Upstream) -> Result<Stream> {
    let (host, port) = split_authority(authority)?;
    match upstream {
      Upstream::Direct => Ok(Box::new(self.tcp_connect(&host, port).await?)),
      Upstream::Proxy(uri) => match uri.scheme_str() {
        Some("http") => {
          let stream: Stream = Box::new(self.proxy_connect(uri, false).await?);
          self.http_connect(stream, uri, authority).await
        }
        Some("https") => {
          let stream = self.proxy_connect_tls(uri).await?;
          self.http_connect(stream, uri, authority).await
        }
        Some("socks5") => {
          let mut stream = self.proxy_connect(uri, false).await?;
          socks5_handshake(&mut stream, uri, &host, port).await?;
          Ok(Box::new(stream))
        }
        other => Err(Error::upstream_unreachable(format!(
          "unsupported upstream proxy scheme {other:?}"
        ))),
      },
    }
  }

  async fn proxy_connect(&self, uri: &http::Uri, _tls: bool) -> Result<TcpStream> {
    let host = uri
      .host()
      .ok_or_else(|| Error::upstream_unreachable("upstream proxy URL has no host"))?;
    let port = uri.port_u16().unwrap_or_else(|| crate::http1::default_port(uri));
    self.tcp_connect(host, port).await
  }

  async fn proxy_connect_tls(&self, uri: &http::Uri) -> Result<Stream> {
    let host = uri
      .host()
      .ok_or_else(|| Error::upstream_unreachable("upstream proxy URL has no host"))?
      .to_owned();
    let stream = self.proxy_connect(uri, true).await?;
    self.tls_connect(Box::new(stream), &host).await
  }

  /// Send CONNECT through an already-open proxy connection. A non-2xx
  /// reply surfaces as an error carrying the proxy's status phrase, which
  /// the error taxonomy maps back onto the original status.
  async fn http_connect(&self, mut stream: Stream, uri: &http::Uri, authority: &str) -> Result<Stream> {
    let mut head = format!(
      "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(user) = uri_userinfo(uri) {
      let auth = user.basic_auth();
      head.push_str("Proxy-Authorization: ");
      head.push_str(&String::from_utf8_lossy(auth.as_bytes()));
      head.push_str("\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let res = read_response(&mut reader, &self.read_options(), true).await?;
    if !res.status.is_success() {
      let phrase = res
        .status
        .canonical_reason()
        .unwrap_or("Bad Gateway")
        .to_owned();
      return Err(Error::upstream_unreachable(phrase));
    }
    // Anything buffered past the head belongs to the tunnel.
    let leftover = bytes::Bytes::copy_from_slice(reader.buffer());
    let stream = reader.into_inner();
    Ok(Box::new(crate::session::Rewind::new(leftover, stream)))
  }
}

fn split_authority(authority: &str) -> Result<(String, u16)> {
  let (host, port) = authority
    .rsplit_once(':')
    .ok_or_else(|| Error::malformed(format!("invalid authority {authority:?}")))?;
  let port: u16 = port
    .parse()
    .map_err(|_| Error::malformed(format!("invalid port in authority {authority:?}")))?;
  Ok((host.trim_matches(|c| c == '[' || c == ']').to_owned(), port))
}

#[async_trait]
impl RoundTripper for Transport {
  async fn dial(&self, authority: &str, upstreams: &[Upstream]) -> Result<Stream> {
    let mut last = None;
    let candidates = if upstreams.is_empty() {
      &[Upstream::Direct][..]
    } else {
      upstreams
    };
    for upstream in candidates {
      match self.dial_candidate(authority, upstream).await {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          tracing::debug!("upstream candidate {:?} failed: {}", upstream, e);
          last = Some(e);
        }
      }
    }
    Err(last.unwrap_or_else(|| Error::upstream_unreachable("no upstream candidates")))
  }

  async fn round_trip(&self, req: &Request, upstreams: &[Upstream]) -> Result<Response> {
    let secure = req.uri.scheme_str() == Some("https");
    let authority = req.host_port();

    let candidates = if upstreams.is_empty() {
      &[Upstream::Direct][..]
    } else {
      upstreams
    };

    let mut last = None;
    for upstream in candidates {
      match self.try_candidate(req, upstream, &authority, secure).await {
        Ok(res) => return Ok(res),
        Err(e @ (Error::UpstreamUnreachable(_) | Error::UpstreamTimeout(_))) => {
          tracing::debug!("upstream candidate {:?} failed: {}", upstream, e);
          last = Some(e);
        }
        Err(e) => return Err(e),
      }
    }
    Err(last.unwrap_or_else(|| Error::upstream_unreachable("no upstream candidates")))
  }
}

impl Transport {
  async fn try_candidate(
    &self,
    req: &Request,
    upstream: &Upstream,
    authority: &str,
    secure: bool,
  ) -> Result<Response> {
    // The request towards a plain HTTP proxy keeps the absolute form and
    // carries the proxy credentials; every other shape tunnels or dials
    // first and sends the origin form.
    let (stream, absolute_form, proxy_auth) = if secure {
      let stream = self.dial_candidate(authority, upstream).await?;
      let stream = self.tls_connect(stream, req.hostname()).await?;
      (stream, false, None)
    } else {
      match upstream {
        Upstream::Direct => {
          let stream = self.dial_candidate(authority, &Upstream::Direct).await?;
          (stream, false, None)
        }
        Upstream::Proxy(uri) => match uri.scheme_str() {
          Some("http") => {
            let stream: Stream = Box::new(self.proxy_connect(uri, false).await?);
            (stream, true, uri_userinfo(uri))
          }
          Some("https") => {
            let stream = self.proxy_connect_tls(uri).await?;
            (stream, true, uri_userinfo(uri))
          }
          _ => {
            let stream = self.dial_candidate(authority, upstream).await?;
            (stream, false, None)
          }
        },
      }
    };

    let mut stream = stream;
    if let Some(user) = proxy_auth {
      // Serialized ahead of the request head so the header appears once.
      let mut req_with_auth = clone_head(req);
      req_with_auth
        .headers
        .insert(http::header::PROXY_AUTHORIZATION, user.basic_auth());
      write_request(&mut stream, &req_with_auth, absolute_form, self.write_timeout).await?;
    } else {
      write_request(&mut stream, req, absolute_form, self.write_timeout).await?;
    }

    let mut reader = BufReader::new(stream);
    let head_only = req.method == Method::HEAD;
    let mut res = read_response(&mut reader, &self.read_options(), head_only).await?;
    if res.status == StatusCode::SWITCHING_PROTOCOLS {
      return Err(Error::upstream_unreachable("upstream attempted a protocol upgrade"));
    }
    res.extensions = http::Extensions::new();
    Ok(res)
  }
}

fn clone_head(req: &Request) -> Request {
  Request {
    method: req.method.clone(),
    uri: req.uri.clone(),
    version: req.version,
    headers: req.headers.clone(),
    body: req.body.clone(),
    extensions: http::Extensions::new(),
  }
}

// SOCKS5 client handshake, CONNECT command only.

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ADDR_IPV4: u8 = 0x01;
const SOCKS5_ADDR_DOMAIN: u8 = 0x03;
const SOCKS5_ADDR_IPV6: u8 = 0x04;
const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;

async fn socks5_handshake(
  stream: &mut TcpStream,
  uri: &http::Uri,
  host: &str,
  port: u16,
) -> Result<()> {
  let auth = uri_userinfo(uri);

  // Greeting with the methods we can do.
  let methods: &[u8] = if auth.is_some() {
    &[SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
  } else {
    &[SOCKS5_AUTH_NONE]
  };
  let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
  greeting.extend_from_slice(methods);
  stream.write_all(&greeting).await?;

  let mut reply = [0u8; 2];
  stream.read_exact(&mut reply).await?;
  let [version, method] = reply;
  if version != SOCKS5_VERSION {
    return Err(Error::upstream_unreachable(format!(
      "unexpected SOCKS version {version:#x}"
    )));
  }

  match method {
    SOCKS5_AUTH_NONE => {}
    SOCKS5_AUTH_PASSWORD => {
      let Some(user) = auth else {
        return Err(Error::upstream_unreachable("SOCKS proxy requires credentials"));
      };
      let username = user.username.as_bytes();
      let password = user.password.as_deref().unwrap_or_default().as_bytes();
      let mut packet = vec![0x01, username.len() as u8];
      packet.extend_from_slice(username);
      packet.push(password.len() as u8);
      packet.extend_from_slice(password);
      stream.write_all(&packet).await?;

      let mut status = [0u8; 2];
      stream.read_exact(&mut status).await?;
      if status[1] != SOCKS5_REPLY_SUCCEEDED {
        return Err(Error::upstream_unreachable("SOCKS authentication rejected"));
      }
    }
    _ => {
      return Err(Error::upstream_unreachable("no acceptable SOCKS auth method"));
    }
  }

  // CONNECT request; IP literals go as-is, hostnames resolve remotely.
  let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
  match host.parse::<IpAddr>() {
    Ok(IpAddr::V4(ip)) => {
      request.push(SOCKS5_ADDR_IPV4);
      request.extend_from_slice(&ip.octets());
    }
    Ok(IpAddr::V6(ip)) => {
      request.push(SOCKS5_ADDR_IPV6);
      request.extend_from_slice(&ip.octets());
    }
    Err(_) => {
      if host.len() > u8::MAX as usize {
        return Err(Error::upstream_unreachable("domain name too long for SOCKS"));
      }
      request.push(SOCKS5_ADDR_DOMAIN);
      request.push(host.len() as u8);
      request.extend_from_slice(host.as_bytes());
    }
  }
  request.extend_from_slice(&port.to_be_bytes());
  stream.write_all(&request).await?;

  let mut reply = [0u8; 4];
  stream.read_exact(&mut reply).await?;
  let [version, code, _rsv, addr_type] = reply;
  if version != SOCKS5_VERSION || code != SOCKS5_REPLY_SUCCEEDED {
    return Err(Error::upstream_unreachable(format!("SOCKS connect failed, reply {code:#x}")));
  }

  // Drain the bound address.
  match addr_type {
    SOCKS5_ADDR_IPV4 => {
      let mut buf = [0u8; 4 + 2];
      stream.read_exact(&mut buf).await?;
    }
    SOCKS5_ADDR_IPV6 => {
      let mut buf = [0u8; 16 + 2];
      stream.read_exact(&mut buf).await?;
    }
    SOCKS5_ADDR_DOMAIN => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      let mut buf = vec![0u8; len[0] as usize + 2];
      stream.read_exact(&mut buf).await?;
    }
    other => {
      return Err(Error::upstream_unreachable(format!("bad SOCKS address type {other:#x}")));
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  async fn origin(body: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((mut socket, _)) = listener.accept().await else {
          return;
        };
        tokio::spawn(async move {
          let mut buf = vec![0u8; 4096];
          let _ = socket.read(&mut buf).await;
          let res = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          let _ = socket.write_all(res.as_bytes()).await;
        });
      }
    });
    addr
  }

  fn get(uri: &str) -> Request {
    Request {
      method: Method::GET,
      uri: uri.parse().unwrap(),
      version: http::Version::HTTP_11,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn direct_round_trip() {
    let addr = origin("hello").await;
    let t = Transport::new();
    let req = get(&format!("http://{addr}/"));
    let res = t.round_trip(&req, &[Upstream::Direct]).await.unwrap();
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(&res.body[..], b"hello");
  }

  #[tokio::test]
  async fn dial_falls_back_to_the_next_candidate() {
    let addr = origin("fallback").await;
    let t = Transport::new().connect_timeout(Duration::from_millis(500));
    // Port 9 is discard; nothing listens there.
    let candidates = vec![
      Upstream::Proxy("http://127.0.0.1:9".parse().unwrap()),
      Upstream::Direct,
    ];
    let req = get(&format!("http://{addr}/"));
    let res = t.round_trip(&req, &candidates).await.unwrap();
    assert_eq!(&res.body[..], b"fallback");
  }

  #[tokio::test]
  async fn unreachable_upstream_is_reported() {
    let t = Transport::new().connect_timeout(Duration::from_millis(300));
    let req = get("http://127.0.0.1:9/");
    let err = t.round_trip(&req, &[Upstream::Direct]).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnreachable(_)));
  }

  #[tokio::test]
  async fn connect_rejection_carries_the_status_phrase() {
    // A chained proxy that refuses CONNECT with 503.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 1024];
      let _ = socket.read(&mut buf).await;
      let _ = socket
        .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
        .await;
    });

    let t = Transport::new();
    let err = match t
      .dial(
        "example.com:443",
        &[Upstream::Proxy(format!("http://{proxy_addr}").parse().unwrap())],
      )
      .await
    {
      Err(e) => e,
      Ok(_) => panic!("expected dial to fail"),
    };
    let Error::UpstreamUnreachable(msg) = &err else {
      panic!("unexpected error {err:?}");
    };
    assert_eq!(msg, "Service Unavailable");
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn chained_http_proxy_gets_absolute_form_and_credentials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap();
      let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
      let _ = socket
        .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
        .await;
    });

    let t = Transport::new();
    let req = get("http://example.com/path");
    let upstream = Upstream::Proxy(format!("http://u:p@{proxy_addr}").parse().unwrap());
    let res = t.round_trip(&req, &[upstream]).await.unwrap();
    assert_eq!(res.status, StatusCode::NO_CONTENT);

    let seen = rx.await.unwrap();
    assert!(seen.starts_with("GET http://example.com/path HTTP/1.1\r\n"), "{seen}");
    assert!(seen.contains("Proxy-Authorization: Basic "), "{seen}");
  }

  #[tokio::test]
  async fn socks5_tunnel() {
    let addr = origin("via-socks").await;

    // Minimal SOCKS5 server handling one no-auth CONNECT.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socks_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut greeting = [0u8; 2];
      socket.read_exact(&mut greeting).await.unwrap();
      let mut methods = vec![0u8; greeting[1] as usize];
      socket.read_exact(&mut methods).await.unwrap();
      socket.write_all(&[0x05, 0x00]).await.unwrap();

      let mut head = [0u8; 4];
      socket.read_exact(&mut head).await.unwrap();
      assert_eq!(head[1], 0x01);
      let target = match head[3] {
        0x01 => {
          let mut buf = [0u8; 6];
          socket.read_exact(&mut buf).await.unwrap();
          let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
          let port = u16::from_be_bytes([buf[4], buf[5]]);
          format!("{ip}:{port}")
        }
        0x03 => {
          let mut len = [0u8; 1];
          socket.read_exact(&mut len).await.unwrap();
          let mut name = vec![0u8; len[0] as usize];
          socket.read_exact(&mut name).await.unwrap();
          let mut port = [0u8; 2];
          socket.read_exact(&mut port).await.unwrap();
          format!(
            "{}:{}",
            String::from_utf8_lossy(&name),
            u16::from_be_bytes(port)
          )
        }
        other => panic!("unexpected address type {other}"),
      };
      socket
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

      let mut upstream = TcpStream::connect(target).await.unwrap();
      let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
    });

    let t = Transport::new();
    let req = get(&format!("http://{addr}/"));
    let upstream = Upstream::Proxy(format!("socks5://{socks_addr}").parse().unwrap());
    let res = t.round_trip(&req, &[upstream]).await.unwrap();
    assert_eq!(&res.body[..], b"via-socks");
  }
}
