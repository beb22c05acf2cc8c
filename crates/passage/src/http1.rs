//! HTTP/1.1 message types and wire codec.
//!
//! Messages are buffered: bodies are read fully (bounded by
//! [`ReadOptions::max_body_bytes`]) before they travel through the modifier
//! pipeline. Chunked transfer coding is decoded on read; written messages
//! always carry a `Content-Length`.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const CR_LF: &[u8] = b"\r\n";
const COLON_SPACE: &[u8] = b": ";

/// An HTTP request owned by the proxy.
#[derive(Debug, Default)]
pub struct Request {
  /// Request method.
  pub method: Method,
  /// Request target; absolute for plain proxy requests, authority-only for
  /// CONNECT, origin-form plus `https` scheme inside MITM tunnels.
  pub uri: Uri,
  /// Protocol version as received.
  pub version: Version,
  /// Request headers.
  pub headers: HeaderMap,
  /// Buffered request body.
  pub body: Bytes,
  /// Per-request extension bag; carries the exchange context handle.
  pub extensions: http::Extensions,
}

impl Request {
  /// Hostname of the request target, without port or brackets.
  pub fn hostname(&self) -> &str {
    self.uri.host().unwrap_or_default().trim_matches(|c| c == '[' || c == ']')
  }

  /// `host:port` of the target, filling in the scheme default port.
  pub fn host_port(&self) -> String {
    let host = self.uri.host().unwrap_or_default();
    let port = self.uri.port_u16().unwrap_or_else(|| default_port(&self.uri));
    format!("{host}:{port}")
  }

  /// Whether the client asked for the connection to be closed.
  pub fn wants_close(&self) -> bool {
    wants_close(self.version, &self.headers)
  }
}

/// Scheme default port, `80` when the scheme is absent.
pub fn default_port(uri: &Uri) -> u16 {
  match uri.scheme_str() {
    Some("https") => 443,
    Some("socks5") | Some("socks4") => 1080,
    _ => 80,
  }
}

/// An HTTP response owned by the proxy.
#[derive(Debug)]
pub struct Response {
  /// Protocol version to serialize with.
  pub version: Version,
  /// Status code.
  pub status: StatusCode,
  /// Response headers.
  pub headers: HeaderMap,
  /// Buffered response body.
  pub body: Bytes,
  /// The connection must close after this response is flushed.
  pub close: bool,
  /// Per-response extension bag.
  pub extensions: http::Extensions,
}

impl Response {
  /// An empty response with the given status.
  pub fn new(status: StatusCode) -> Self {
    Response {
      version: Version::HTTP_11,
      status,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      close: false,
      extensions: http::Extensions::new(),
    }
  }

  /// Attach a plain-text body.
  pub fn with_text(mut self, body: impl Into<String>) -> Self {
    self.headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    self.body = Bytes::from(body.into());
    self
  }
}

impl Default for Response {
  fn default() -> Self {
    Response::new(StatusCode::OK)
  }
}

/// Limits and deadlines applied while reading a message.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
  /// Bounds the whole head read; `None` means unbounded.
  pub header_timeout: Option<Duration>,
  /// Bounds each body read call; `None` means unbounded.
  pub read_timeout: Option<Duration>,
  /// Maximum accepted head size in bytes.
  pub max_header_bytes: usize,
  /// Maximum accepted body size in bytes.
  pub max_body_bytes: usize,
}

impl Default for ReadOptions {
  fn default() -> Self {
    ReadOptions {
      header_timeout: None,
      read_timeout: None,
      max_header_bytes: 64 * 1024,
      max_body_bytes: 8 * 1024 * 1024,
    }
  }
}

async fn maybe_timeout<F, T>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
  F: std::future::Future<Output = Result<T>>,
{
  match limit {
    None => fut.await,
    Some(d) => tokio::time::timeout(d, fut)
      .await
      .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_owned())))?,
  }
}

async fn read_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  budget: &mut usize,
) -> Result<Option<String>> {
  let mut line = Vec::new();
  loop {
    let mut byte = [0u8; 1];
    let n = reader.read(&mut byte).await?;
    if n == 0 {
      if line.is_empty() {
        return Ok(None);
      }
      return Err(Error::malformed("unexpected EOF in head"));
    }
    if line.len() >= *budget {
      return Err(Error::malformed("head exceeds size limit"));
    }
    if byte[0] == b'\n' {
      break;
    }
    line.push(byte[0]);
  }
  *budget = budget.saturating_sub(line.len() + 1);
  if line.last() == Some(&b'\r') {
    line.pop();
  }
  String::from_utf8(line).map(Some).map_err(|_| Error::malformed("head is not valid UTF-8"))
}

fn parse_headers(lines: &[String]) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  for line in lines {
    let (name, value) = line
      .split_once(':')
      .ok_or_else(|| Error::malformed(format!("invalid header line {line:?}")))?;
    let name: HeaderName = name
      .trim()
      .parse()
      .map_err(|_| Error::malformed(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_str(value.trim())
      .map_err(|_| Error::malformed(format!("invalid header value for {name}")))?;
    headers.append(name, value);
  }
  Ok(headers)
}

async fn read_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  opts: &ReadOptions,
) -> Result<Option<(String, Vec<String>)>> {
  let mut budget = opts.max_header_bytes;
  let Some(start) = read_line(reader, &mut budget).await? else {
    return Ok(None);
  };
  let mut lines = Vec::new();
  loop {
    match read_line(reader, &mut budget).await? {
      None => return Err(Error::malformed("unexpected EOF in headers")),
      Some(line) if line.is_empty() => break,
      Some(line) => lines.push(line),
    }
  }
  Ok(Some((start, lines)))
}

fn parse_version(s: &str) -> Result<Version> {
  match s {
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    other => Err(Error::malformed(format!("unsupported version {other:?}"))),
  }
}

fn parse_target(method: &Method, target: &str, secure_scheme: Option<&str>) -> Result<Uri> {
  // Origin-form targets resolve their authority later, from the tunnel
  // authority or the Host header.
  if method == Method::CONNECT {
    // Authority form.
    let authority: http::uri::Authority = target
      .parse()
      .map_err(|_| Error::malformed(format!("invalid CONNECT authority {target:?}")))?;
    let mut parts = http::uri::Parts::default();
    parts.authority = Some(authority);
    return Uri::from_parts(parts).map_err(|e| Error::malformed(e.to_string()));
  }

  if target.starts_with('/') {
    // Origin form is only meaningful once the session is secure (inside a
    // MITM tunnel) or when an embedding server routed the request here.
    let Some(scheme) = secure_scheme else {
      return Err(Error::malformed("origin-form request on a proxy connection"));
    };
    return Ok(Uri::builder()
      .scheme(scheme)
      .authority(PENDING_AUTHORITY)
      .path_and_query(target)
      .build()
      .map_err(|e| Error::malformed(e.to_string()))?);
  }

  let uri: Uri = target
    .parse()
    .map_err(|_| Error::malformed(format!("invalid request target {target:?}")))?;
  if uri.scheme().is_none() || uri.authority().is_none() {
    return Err(Error::malformed(format!("request target {target:?} is not absolute")));
  }
  Ok(uri)
}

// Stand-in authority while an origin-form target waits for the Host
// header; `.invalid` is reserved and can never be a real hostname.
const PENDING_AUTHORITY: &str = "origin-form.invalid";

fn fill_origin_authority(
  uri: Uri,
  headers: &HeaderMap,
  default_authority: Option<&str>,
) -> Result<Uri> {
  if uri.host() != Some(PENDING_AUTHORITY) {
    return Ok(uri);
  }
  let host = match default_authority {
    Some(authority) => authority,
    None => headers
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .ok_or_else(|| Error::malformed("origin-form request without Host header"))?,
  };
  let mut parts = uri.into_parts();
  parts.authority = Some(
    host
      .parse()
      .map_err(|_| Error::malformed(format!("invalid Host header {host:?}")))?,
  );
  Uri::from_parts(parts).map_err(|e| Error::malformed(e.to_string()))
}

/// Read one request off the session.
///
/// Returns `Ok(None)` on a clean EOF before the first byte, which ends a
/// keep-alive session without noise. `secure_scheme` is set for requests
/// parsed inside a MITM tunnel so origin-form targets resolve to `https`;
/// `default_authority` is the tunnel authority, preferred over the Host
/// header when both are present.
pub async fn read_request<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  opts: &ReadOptions,
  secure_scheme: Option<&str>,
  default_authority: Option<&str>,
) -> Result<Option<Request>> {
  let Some((start, lines)) = maybe_timeout(opts.header_timeout, "request head", read_head(reader, opts)).await?
  else {
    return Ok(None);
  };

  let mut words = start.split_whitespace();
  let (Some(method), Some(target), Some(version)) = (words.next(), words.next(), words.next())
  else {
    return Err(Error::malformed(format!("invalid request line {start:?}")));
  };
  let method: Method = method
    .parse()
    .map_err(|_| Error::malformed(format!("invalid method {method:?}")))?;
  let version = parse_version(version)?;
  let headers = parse_headers(&lines)?;
  let uri = fill_origin_authority(
    parse_target(&method, target, secure_scheme)?,
    &headers,
    default_authority,
  )?;

  let body = if method == Method::CONNECT {
    Bytes::new()
  } else {
    read_body(reader, &headers, opts).await?
  };

  Ok(Some(Request {
    method,
    uri,
    version,
    headers,
    body,
    extensions: http::Extensions::new(),
  }))
}

/// Read one response head and body off an upstream stream.
///
/// `head_only` skips the body, used for CONNECT replies and HEAD requests.
pub async fn read_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  opts: &ReadOptions,
  head_only: bool,
) -> Result<Response> {
  let Some((start, lines)) = maybe_timeout(opts.header_timeout, "response head", read_head(reader, opts)).await?
  else {
    return Err(Error::upstream_unreachable("upstream closed before responding"));
  };

  let mut words = start.splitn(3, ' ');
  let (Some(version), Some(status)) = (words.next(), words.next()) else {
    return Err(Error::upstream_unreachable(format!("invalid status line {start:?}")));
  };
  let version = parse_version(version)?;
  let status = status
    .parse::<u16>()
    .ok()
    .and_then(|c| StatusCode::from_u16(c).ok())
    .ok_or_else(|| Error::upstream_unreachable(format!("invalid status {status:?}")))?;
  let headers = parse_headers(&lines)?;

  let body = if head_only || status_has_no_body(status) {
    Bytes::new()
  } else {
    read_body(reader, &headers, opts).await?
  };

  let close = wants_close(version, &headers);
  Ok(Response {
    version,
    status,
    headers,
    body,
    close,
    extensions: http::Extensions::new(),
  })
}

fn status_has_no_body(status: StatusCode) -> bool {
  status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
}

fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  let connection = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .collect::<Vec<_>>();
  if connection.iter().any(|t| t == "close") {
    return true;
  }
  version == Version::HTTP_10 && !connection.iter().any(|t| t == "keep-alive")
}

async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  headers: &HeaderMap,
  opts: &ReadOptions,
) -> Result<Bytes> {
  let chunked = headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case("chunked"));

  if chunked {
    return read_chunked_body(reader, opts).await;
  }

  let length = headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().parse::<usize>())
    .transpose()
    .map_err(|_| Error::malformed("invalid Content-Length"))?;

  let Some(length) = length else {
    return Ok(Bytes::new());
  };
  if length > opts.max_body_bytes {
    return Err(Error::malformed("body exceeds size limit"));
  }

  let mut body = vec![0u8; length];
  let mut filled = 0;
  while filled < length {
    let n = maybe_timeout(opts.read_timeout, "body read", async {
      Ok(reader.read(&mut body[filled..]).await?)
    })
    .await?;
    if n == 0 {
      return Err(Error::malformed("unexpected EOF in body"));
    }
    filled += n;
  }
  Ok(Bytes::from(body))
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  opts: &ReadOptions,
) -> Result<Bytes> {
  let mut body = Vec::new();
  loop {
    let mut budget = 1024;
    let size_line = maybe_timeout(opts.read_timeout, "chunk size", read_line(reader, &mut budget))
      .await?
      .ok_or_else(|| Error::malformed("unexpected EOF in chunked body"))?;
    let size_hex = size_line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_hex, 16)
      .map_err(|_| Error::malformed(format!("invalid chunk size {size_hex:?}")))?;

    if size == 0 {
      // Trailer section runs to the blank line and is discarded.
      loop {
        let mut budget = opts.max_header_bytes;
        match maybe_timeout(opts.read_timeout, "trailer", read_line(reader, &mut budget)).await? {
          None => return Err(Error::malformed("unexpected EOF in trailers")),
          Some(line) if line.is_empty() => return Ok(Bytes::from(body)),
          Some(_) => {}
        }
      }
    }

    if body.len() + size > opts.max_body_bytes {
      return Err(Error::malformed("body exceeds size limit"));
    }
    let start = body.len();
    body.resize(start + size, 0);
    let mut filled = start;
    while filled < body.len() {
      let n = maybe_timeout(opts.read_timeout, "chunk read", async {
        Ok(reader.read(&mut body[filled..]).await?)
      })
      .await?;
      if n == 0 {
        return Err(Error::malformed("unexpected EOF in chunk"));
      }
      filled += n;
    }

    let mut crlf = [0u8; 2];
    maybe_timeout(opts.read_timeout, "chunk terminator", async {
      reader.read_exact(&mut crlf).await?;
      Ok(())
    })
    .await?;
    if &crlf != b"\r\n" {
      return Err(Error::malformed("missing chunk terminator"));
    }
  }
}

fn request_target(req: &Request, absolute_form: bool) -> String {
  if absolute_form {
    return req.uri.to_string();
  }
  req
    .uri
    .path_and_query()
    .map(|pq| pq.to_string())
    .unwrap_or_else(|| "/".to_owned())
}

/// Serialize a request. `absolute_form` is used on the leg towards a
/// chained HTTP proxy; origin servers get the origin form.
pub async fn write_request<W: AsyncWrite + Unpin>(
  writer: &mut W,
  req: &Request,
  absolute_form: bool,
  write_timeout: Option<Duration>,
) -> Result<()> {
  let mut buf = Vec::with_capacity(256 + req.body.len());
  buf.extend_from_slice(req.method.as_str().as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(request_target(req, absolute_form).as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(version_str(req.version).as_bytes());
  buf.extend_from_slice(CR_LF);

  if !req.headers.contains_key(http::header::HOST) {
    if let Some(authority) = req.uri.authority() {
      buf.extend_from_slice(b"Host: ");
      buf.extend_from_slice(authority.as_str().as_bytes());
      buf.extend_from_slice(CR_LF);
    }
  }
  for (name, value) in &req.headers {
    if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(COLON_SPACE);
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
  if !req.body.is_empty() || body_expected(&req.method) {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
  }
  buf.extend_from_slice(CR_LF);
  buf.extend_from_slice(&req.body);

  write_all(writer, &buf, write_timeout).await
}

fn body_expected(method: &Method) -> bool {
  matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Serialize a response towards the client.
pub async fn write_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  res: &Response,
  write_timeout: Option<Duration>,
) -> Result<()> {
  let mut buf = Vec::with_capacity(256 + res.body.len());
  buf.extend_from_slice(version_str(res.version).as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(res.status.as_str().as_bytes());
  buf.push(b' ');
  buf.extend_from_slice(res.status.canonical_reason().unwrap_or("Unknown").as_bytes());
  buf.extend_from_slice(CR_LF);

  for (name, value) in &res.headers {
    if name == http::header::CONTENT_LENGTH
      || name == http::header::TRANSFER_ENCODING
      || name == http::header::CONNECTION
    {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(COLON_SPACE);
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
  if res.close {
    buf.extend_from_slice(b"Connection: close\r\n");
  }
  if !status_has_no_body(res.status) {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", res.body.len()).as_bytes());
  }
  buf.extend_from_slice(CR_LF);
  buf.extend_from_slice(&res.body);

  write_all(writer, &buf, write_timeout).await
}

fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

async fn write_all<W: AsyncWrite + Unpin>(
  writer: &mut W,
  buf: &[u8],
  write_timeout: Option<Duration>,
) -> Result<()> {
  maybe_timeout(write_timeout, "write", async {
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
  })
  .await
}
