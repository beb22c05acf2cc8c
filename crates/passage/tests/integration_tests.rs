//! End-to-end tests driving real listeners on the loopback interface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use passage::modifier::request_modifier_fn;
use passage::{
  CredentialsMatcher, HttpProxy, HttpProxyConfig, MitmConfig, ProxyLocalhostMode, RuleSet,
  Transport, Userinfo,
};
use passage_pac::ProxyResolver;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn base_config() -> HttpProxyConfig {
  HttpProxyConfig {
    addr: "127.0.0.1:0".parse().unwrap(),
    proxy_localhost: ProxyLocalhostMode::Allow,
    ..Default::default()
  }
}

async fn start_proxy(
  config: HttpProxyConfig,
  pac: Option<Arc<ProxyResolver>>,
  transport: Option<Arc<dyn passage::RoundTripper>>,
) -> (SocketAddr, Arc<HttpProxy>) {
  let proxy = Arc::new(
    HttpProxy::new(config, pac, Arc::new(CredentialsMatcher::default()), transport).unwrap(),
  );
  let listener = proxy.listen().await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = proxy.clone();
  tokio::spawn(async move {
    let _ = serving.serve(listener).await;
  });
  (addr, proxy)
}

/// Plain HTTP origin; every request head is pushed into the channel.
async fn start_origin(body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    loop {
      let Ok((mut socket, _)) = listener.accept().await else {
        return;
      };
      let tx = tx.clone();
      tokio::spawn(async move {
        loop {
          let Some(head) = read_head(&mut socket).await else {
            return;
          };
          let _ = tx.send(head);
          let res = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          if socket.write_all(res.as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, rx)
}

/// Read one request head (requests in these tests have no bodies).
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    match stream.read(&mut byte).await {
      Ok(0) => return if buf.is_empty() { None } else { Some(String::from_utf8_lossy(&buf).into_owned()) },
      Ok(_) => {
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
          return Some(String::from_utf8_lossy(&buf).into_owned());
        }
      }
      Err(_) => return None,
    }
  }
}

/// Read one full HTTP response (head plus content-length body).
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> String {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  loop {
    let n = stream.read(&mut byte).await.unwrap_or(0);
    if n == 0 {
      return String::from_utf8_lossy(&buf).into_owned();
    }
    buf.push(byte[0]);
    if buf.ends_with(b"\r\n\r\n") {
      break;
    }
  }
  let head = String::from_utf8_lossy(&buf).into_owned();
  let length = head
    .lines()
    .find_map(|l| {
      let (name, value) = l.split_once(':')?;
      name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
    })
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  if length > 0 {
    stream.read_exact(&mut body).await.unwrap();
  }
  format!("{head}{}", String::from_utf8_lossy(&body))
}

#[tokio::test]
async fn plaintext_direct_deny_localhost() {
  let config = HttpProxyConfig {
    addr: "127.0.0.1:0".parse().unwrap(),
    proxy_localhost: ProxyLocalhostMode::Deny,
    ..Default::default()
  };
  let (addr, _proxy) = start_proxy(config, None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET http://localhost:9/health HTTP/1.1\r\nHost: localhost:9\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{res}");
  assert!(res.contains("localhost access denied"), "{res}");
}

#[tokio::test]
async fn plaintext_round_trip_with_request_id() {
  let (origin, mut seen) = start_origin("origin-ok").await;
  let (addr, _proxy) = start_proxy(base_config(), None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("GET http://{origin}/hello HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
  assert!(res.ends_with("origin-ok"), "{res}");

  let head = seen.recv().await.unwrap();
  assert!(head.starts_with("GET /hello HTTP/1.1\r\n"), "{head}");
  assert!(head.to_lowercase().contains("x-request-id:"), "{head}");
  assert!(head.contains("via: 1.1 passage"), "{head}");
}

#[tokio::test]
async fn keep_alive_session_serves_multiple_exchanges() {
  let (origin, mut seen) = start_origin("again").await;
  let (addr, _proxy) = start_proxy(base_config(), None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  for _ in 0..3 {
    let req = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
    client.write_all(req.as_bytes()).await.unwrap();
    let res = read_response(&mut client).await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("again"), "{res}");
    seen.recv().await.unwrap();
  }

  // Request ids keep incrementing on one session.
  client
    .write_all(format!("GET http://{origin}/ HTTP/1.1\r\nConnection: close\r\n\r\n").as_bytes())
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.contains("Connection: close"), "{res}");
}

#[tokio::test]
async fn connect_passthrough_tunnels_verbatim() {
  // Raw TCP echo peer; speaks no HTTP at all.
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let target = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    socket.write_all(b"pong").await.unwrap();
  });

  let config = HttpProxyConfig {
    connect_passthrough: true,
    ..base_config()
  };
  let (addr, _proxy) = start_proxy(config, None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();

  let mut head = [0u8; 39];
  client.read_exact(&mut head).await.unwrap();
  assert_eq!(&head[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

  client.write_all(b"ping").await.unwrap();
  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"pong");
}

struct TestCa {
  cert_pem: String,
  key_pem: String,
  cert_der: CertificateDer<'static>,
}

fn test_ca(name: &str) -> TestCa {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, name);
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  let key = KeyPair::generate().unwrap();
  let cert = params.self_signed(&key).unwrap();
  TestCa {
    cert_pem: cert.pem(),
    key_pem: key.serialize_pem(),
    cert_der: CertificateDer::from(cert.der().to_vec()),
  }
}

/// TLS origin with a leaf for 127.0.0.1 signed by the given CA.
async fn start_tls_origin(ca: &TestCa, body: &'static str) -> SocketAddr {
  let issuer = rcgen::Issuer::from_ca_cert_pem(&ca.cert_pem, KeyPair::from_pem(&ca.key_pem).unwrap()).unwrap();
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "127.0.0.1");
  params.distinguished_name = dn;
  params.subject_alt_names = vec![SanType::IpAddress("127.0.0.1".parse().unwrap())];
  let leaf_key = KeyPair::generate().unwrap();
  let leaf = params.signed_by(&leaf_key, &issuer).unwrap();

  let server_config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(
      vec![
        CertificateDer::from(leaf.der().to_vec()),
        ca.cert_der.clone(),
      ],
      PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into(),
    )
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(server_config));

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((socket, _)) = listener.accept().await else {
        return;
      };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(socket).await else {
          return;
        };
        while read_head(&mut tls).await.is_some() {
          let res = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
          );
          if tls.write_all(res.as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  addr
}

#[tokio::test]
async fn mitm_intercepts_matching_connects() {
  let origin_ca = test_ca("Origin Test CA");
  let origin = start_tls_origin(&origin_ca, "secret-page").await;

  let mitm_ca = test_ca("Passage MITM CA");
  let (scheme_tx, mut scheme_rx) = mpsc::unbounded_channel::<String>();

  let mut config = base_config();
  config.mitm = Some(MitmConfig {
    ca_cert_pem: mitm_ca.cert_pem.clone(),
    ca_key_pem: mitm_ca.key_pem.clone(),
    organization: "Passage Test".into(),
    validity: Duration::from_secs(3600),
  });
  config.mitm_domains = Some(RuleSet::new(&["^127\\.0\\.0\\.1$"]).unwrap());
  config.request_modifiers.push(request_modifier_fn(move |req| {
    let _ = scheme_tx.send(req.uri.scheme_str().unwrap_or_default().to_owned());
    Ok(())
  }));

  // The outbound leg must trust the origin's private CA.
  let transport = Transport::new().extra_root_certificate(origin_ca.cert_der.clone());
  let (addr, _proxy) = start_proxy(config, None, Some(Arc::new(transport))).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();
  let mut head = [0u8; 39];
  client.read_exact(&mut head).await.unwrap();
  assert_eq!(&head[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

  // Handshake against the proxy; trusting only the MITM CA proves the
  // leaf was minted and signed by it.
  let mut roots = RootCertStore::empty();
  roots.add(mitm_ca.cert_der.clone()).unwrap();
  let client_config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let server_name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(server_name, client).await.unwrap();

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut tls).await;
  assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
  assert!(res.ends_with("secret-page"), "{res}");

  // The inner request went through the full pipeline with scheme https.
  let mut schemes = Vec::new();
  while let Ok(s) = scheme_rx.try_recv() {
    schemes.push(s);
  }
  assert!(schemes.contains(&"https".to_owned()), "{schemes:?}");
}

#[tokio::test]
async fn pac_falls_back_to_direct_when_the_proxy_is_dead() {
  let (origin, _seen) = start_origin("direct-fallback").await;

  // Port 9 is unassigned on loopback; the first candidate never dials.
  let pac = ProxyResolver::new(
    r#"function FindProxyForURL(url, host) { return "PROXY 127.0.0.1:9; DIRECT"; }"#,
  )
  .unwrap();

  let transport = Transport::new().connect_timeout(Duration::from_millis(500));
  let (addr, _proxy) =
    start_proxy(base_config(), Some(Arc::new(pac)), Some(Arc::new(transport))).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
  assert!(res.ends_with("direct-fallback"), "{res}");
}

#[tokio::test]
async fn pac_routes_through_the_first_reachable_proxy() {
  let (origin, mut seen) = start_origin("chained").await;

  // The upstream hop is another proxy instance with its own Via name.
  let upstream_config = HttpProxyConfig {
    name: "upstream-hop".into(),
    ..base_config()
  };
  let (upstream_addr, _upstream) = start_proxy(upstream_config, None, None).await;

  let pac = ProxyResolver::new(&format!(
    r#"function FindProxyForURL(url, host) {{ return "PROXY {upstream_addr}; DIRECT"; }}"#
  ))
  .unwrap();
  let edge_config = HttpProxyConfig {
    name: "edge".into(),
    ..base_config()
  };
  let (addr, _proxy) = start_proxy(edge_config, Some(Arc::new(pac)), None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();
  let res = read_response(&mut client).await;
  assert!(res.ends_with("chained"), "{res}");

  let head = seen.recv().await.unwrap();
  assert!(head.contains("1.1 edge"), "{head}");
  assert!(head.contains("1.1 upstream-hop"), "{head}");
}

#[tokio::test]
async fn basic_auth_challenge_and_acceptance() {
  let (origin, _seen) = start_origin("authed").await;
  let config = HttpProxyConfig {
    basic_auth: Some(Userinfo::parse("user:pass").unwrap()),
    ..base_config()
  };
  let (addr, _proxy) = start_proxy(config, None, None).await;

  // Without credentials: challenge and close.
  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  client.write_all(req.as_bytes()).await.unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"), "{res}");
  assert!(res.contains("proxy-authenticate: Basic realm=\"passage\""), "{res}");

  // With the right credentials the round trip happens.
  let mut client = TcpStream::connect(addr).await.unwrap();
  let req = format!(
    "GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
  );
  client.write_all(req.as_bytes()).await.unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
  assert!(res.ends_with("authed"), "{res}");
}

#[tokio::test]
async fn connect_rejection_status_passes_through() {
  // A chained proxy that refuses CONNECT with 503.
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut socket, _)) = listener.accept().await else {
        return;
      };
      tokio::spawn(async move {
        if read_head(&mut socket).await.is_some() {
          let _ = socket
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
            .await;
        }
      });
    }
  });

  let config = HttpProxyConfig {
    upstream_proxy: Some(format!("http://{upstream}").parse().unwrap()),
    ..base_config()
  };
  let (addr, _proxy) = start_proxy(config, None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{res}");
}

#[tokio::test]
async fn deny_domains_answer_403() {
  let config = HttpProxyConfig {
    deny_domains: Some(RuleSet::new(&["(^|\\.)blocked\\.example$"]).unwrap()),
    ..base_config()
  };
  let (addr, _proxy) = start_proxy(config, None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  client
    .write_all(b"GET http://www.blocked.example/ HTTP/1.1\r\nHost: www.blocked.example\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{res}");
  assert!(res.contains("domain access denied"), "{res}");
}

#[tokio::test]
async fn skip_round_trip_uses_the_planted_response() {
  let mut config = base_config();
  config.request_modifiers.push(request_modifier_fn(|req| {
    if let Some(ctx) = passage::Context::from_request(req) {
      ctx.skip_round_trip();
      let res = passage::Response::new(http::StatusCode::IM_A_TEAPOT).with_text("planted");
      ctx.set_response(res);
    }
    Ok(())
  }));
  let (addr, _proxy) = start_proxy(config, None, None).await;

  let mut client = TcpStream::connect(addr).await.unwrap();
  // The destination does not exist; no dial may happen.
  client
    .write_all(b"GET http://203.0.113.1:9/ HTTP/1.1\r\nHost: 203.0.113.1:9\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 418 I'm a teapot\r\n"), "{res}");
  assert!(res.ends_with("planted"), "{res}");
}

#[tokio::test]
async fn malformed_requests_get_400() {
  let (addr, _proxy) = start_proxy(base_config(), None, None).await;
  let mut client = TcpStream::connect(addr).await.unwrap();
  // Origin-form on a plain proxy connection is not acceptable.
  client
    .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  let res = read_response(&mut client).await;
  assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
}

struct CapturingWriter {
  tx: mpsc::UnboundedSender<(u16, String)>,
}

#[async_trait::async_trait]
impl passage::session::ResponseWriter for CapturingWriter {
  async fn write_response(&mut self, res: &passage::Response) -> std::io::Result<()> {
    let _ = self.tx.send((
      res.status.as_u16(),
      String::from_utf8_lossy(&res.body).into_owned(),
    ));
    Ok(())
  }

  fn hijack_stream(
    self: Box<Self>,
  ) -> Result<passage::session::Stream, Box<dyn passage::session::ResponseWriter>> {
    Err(self)
  }
}

#[tokio::test]
async fn embedded_mode_serves_requests_and_refuses_connect() {
  let (origin, _seen) = start_origin("embedded").await;
  let proxy = Arc::new(
    HttpProxy::new(base_config(), None, Arc::new(CredentialsMatcher::default()), None).unwrap(),
  );

  let (tx, mut rx) = mpsc::unbounded_channel();
  let req = passage::Request {
    method: http::Method::GET,
    uri: format!("http://{origin}/").parse().unwrap(),
    version: http::Version::HTTP_11,
    ..Default::default()
  };
  proxy
    .handle_request(req, Box::new(CapturingWriter { tx: tx.clone() }))
    .await
    .unwrap();
  let (status, body) = rx.recv().await.unwrap();
  assert_eq!(status, 200);
  assert_eq!(body, "embedded");

  // CONNECT cannot be served without hijack support.
  let mut parts = http::uri::Parts::default();
  parts.authority = Some("example.com:443".parse().unwrap());
  let req = passage::Request {
    method: http::Method::CONNECT,
    uri: http::Uri::from_parts(parts).unwrap(),
    version: http::Version::HTTP_11,
    ..Default::default()
  };
  proxy
    .handle_request(req, Box::new(CapturingWriter { tx }))
    .await
    .unwrap();
  let (status, _body) = rx.recv().await.unwrap();
  assert_eq!(status, 501);
}
