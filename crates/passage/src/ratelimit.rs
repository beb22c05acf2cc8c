//! Byte-rate limiting for accepted connections.
//!
//! One [`RateLimit`] is a token bucket shared by every stream it wraps, so
//! a per-direction cap applies across all client connections together. The
//! configuration names are inherited and inverted: the *read* limit caps
//! bytes the proxy writes to clients, and the *write* limit caps bytes it
//! reads from them. The wiring in the proxy preserves those semantics.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant, Sleep};

/// A shared token bucket, in bytes per second.
#[derive(Clone)]
pub struct RateLimit {
  inner: Arc<Mutex<Bucket>>,
}

struct Bucket {
  rate: f64,
  burst: f64,
  tokens: f64,
  last: Instant,
}

impl RateLimit {
  /// Bucket refilling at `bytes_per_second`, with a one-second burst.
  pub fn new(bytes_per_second: u64) -> Self {
    let rate = bytes_per_second.max(1) as f64;
    RateLimit {
      inner: Arc::new(Mutex::new(Bucket {
        rate,
        burst: rate,
        tokens: rate,
        last: Instant::now(),
      })),
    }
  }

  /// Charge `n` bytes. Returns how long the caller must stall before its
  /// next operation; the bucket may go negative, which is what produces
  /// the delay.
  fn debit(&self, n: usize) -> Option<Duration> {
    let mut b = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
    b.last = now;
    b.tokens = (b.tokens + elapsed * b.rate).min(b.burst);
    b.tokens -= n as f64;
    if b.tokens >= 0.0 {
      None
    } else {
      Some(Duration::from_secs_f64(-b.tokens / b.rate))
    }
  }
}

/// A stream whose directions are throttled by shared buckets.
pub struct RateLimitedStream<S> {
  inner: S,
  read_limit: Option<RateLimit>,
  write_limit: Option<RateLimit>,
  read_delay: Option<Pin<Box<Sleep>>>,
  write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> RateLimitedStream<S> {
  /// Wrap a stream. `read_limit` throttles bytes read off `inner`,
  /// `write_limit` bytes written to it; `None` leaves a direction
  /// unthrottled.
  pub fn new(inner: S, read_limit: Option<RateLimit>, write_limit: Option<RateLimit>) -> Self {
    RateLimitedStream {
      inner,
      read_limit,
      write_limit,
      read_delay: None,
      write_delay: None,
    }
  }
}

fn poll_delay(delay: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
  if let Some(sleep) = delay {
    match sleep.as_mut().poll(cx) {
      Poll::Ready(()) => {
        *delay = None;
        Poll::Ready(())
      }
      Poll::Pending => Poll::Pending,
    }
  } else {
    Poll::Ready(())
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for RateLimitedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = &mut *self;
    if poll_delay(&mut this.read_delay, cx).is_pending() {
      return Poll::Pending;
    }
    let before = buf.filled().len();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(Ok(())) => {
        let n = buf.filled().len() - before;
        if n > 0 {
          if let Some(limit) = &this.read_limit {
            if let Some(wait) = limit.debit(n) {
              this.read_delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
          }
        }
        Poll::Ready(Ok(()))
      }
      other => other,
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RateLimitedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = &mut *self;
    if poll_delay(&mut this.write_delay, cx).is_pending() {
      return Poll::Pending;
    }
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(Ok(n)) => {
        if n > 0 {
          if let Some(limit) = &this.write_limit {
            if let Some(wait) = limit.debit(n) {
              this.write_delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
          }
        }
        Poll::Ready(Ok(n))
      }
      other => other,
    }
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
