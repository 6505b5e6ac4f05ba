use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, Stream, StreamExt};

/// A body stream flowing through the proxy.
///
/// Bodies are either fully buffered or a live stream of chunks. A stream is
/// consumed exactly once; observers that want a copy use [`Body::tee`].
pub struct Body {
  kind: Kind,
}

enum Kind {
  Full(Bytes),
  Stream {
    stream: BoxStream<'static, io::Result<Bytes>>,
    len: Option<u64>,
  },
}

impl Body {
  /// An empty body
  pub fn empty() -> Body {
    Body {
      kind: Kind::Full(Bytes::new()),
    }
  }

  /// Wrap a stream of chunks of unknown length
  pub fn wrap_stream<S>(stream: S) -> Body
  where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
  {
    Body {
      kind: Kind::Stream {
        stream: stream.boxed(),
        len: None,
      },
    }
  }

  /// Wrap a stream whose total length is known up front
  pub fn sized_stream<S>(stream: S, len: u64) -> Body
  where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
  {
    Body {
      kind: Kind::Stream {
        stream: stream.boxed(),
        len: Some(len),
      },
    }
  }

  /// Exact length when known without consuming the body
  pub fn size_hint(&self) -> Option<u64> {
    match &self.kind {
      Kind::Full(bytes) => Some(bytes.len() as u64),
      Kind::Stream { len, .. } => *len,
    }
  }

  /// True if the body is a live stream rather than a buffer
  pub fn is_stream(&self) -> bool {
    matches!(self.kind, Kind::Stream { .. })
  }

  /// The buffered bytes, if the body is not a stream
  pub fn as_bytes(&self) -> Option<&Bytes> {
    match &self.kind {
      Kind::Full(bytes) => Some(bytes),
      Kind::Stream { .. } => None,
    }
  }

  /// Read the whole body into memory
  pub async fn collect(self) -> io::Result<Bytes> {
    match self.kind {
      Kind::Full(bytes) => Ok(bytes),
      Kind::Stream { mut stream, len } => {
        let mut buf = BytesMut::with_capacity(len.unwrap_or(0).min(1 << 20) as usize);
        while let Some(chunk) = stream.next().await {
          buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
      }
    }
  }

  /// Read the body to completion, discarding it. Returns the number of bytes drained.
  pub async fn drain(self) -> io::Result<u64> {
    match self.kind {
      Kind::Full(bytes) => Ok(bytes.len() as u64),
      Kind::Stream { mut stream, .. } => {
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
          total += chunk?.len() as u64;
        }
        Ok(total)
      }
    }
  }

  /// Drain in a background task so the connection backing the stream is released.
  pub(crate) fn drain_in_background(self, what: &'static str) {
    if !self.is_stream() {
      return;
    }
    tokio::spawn(async move {
      match self.drain().await {
        Ok(n) => tracing::trace!("drained {} bytes of replaced {} body", n, what),
        Err(e) => tracing::debug!("draining replaced {} body failed: {}", what, e),
      }
    });
  }

  /// Split off a copy of the bytes as they flow.
  ///
  /// The returned body yields the same chunks as `self`; the capture resolves to
  /// everything that passed through once the body has been consumed or dropped.
  pub fn tee(self) -> (Body, BodyCapture) {
    match self.kind {
      Kind::Full(bytes) => {
        let capture = BodyCapture::ready(bytes.clone());
        (Body::from(bytes), capture)
      }
      Kind::Stream { stream, len } => {
        let (tx, rx) = mpsc::unbounded::<Bytes>();
        let stream = stream.inspect(move |chunk| {
          if let Ok(chunk) = chunk {
            let _ = tx.unbounded_send(chunk.clone());
          }
        });
        let body = Body {
          kind: Kind::Stream {
            stream: stream.boxed(),
            len,
          },
        };
        (body, BodyCapture::from_channel(rx))
      }
    }
  }
}

impl Stream for Body {
  type Item = io::Result<Bytes>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    match &mut self.kind {
      Kind::Full(bytes) => {
        if bytes.is_empty() {
          Poll::Ready(None)
        } else {
          Poll::Ready(Some(Ok(std::mem::take(bytes))))
        }
      }
      Kind::Stream { stream, .. } => stream.poll_next_unpin(cx),
    }
  }
}

/// Buffered copy of a body taken by [`Body::tee`]. Cheap to clone; every clone
/// resolves to the same bytes.
#[derive(Clone)]
pub struct BodyCapture {
  inner: Shared<BoxFuture<'static, Bytes>>,
}

impl BodyCapture {
  fn ready(bytes: Bytes) -> Self {
    Self {
      inner: futures::future::ready(bytes).boxed().shared(),
    }
  }

  fn from_channel(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
    let collect = async move {
      let chunks: Vec<Bytes> = rx.collect().await;
      let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
      for chunk in chunks {
        buf.extend_from_slice(&chunk);
      }
      buf.freeze()
    };
    Self {
      inner: collect.boxed().shared(),
    }
  }

  /// Wait until the tee'd body has ended and return its bytes
  pub async fn bytes(&self) -> Bytes {
    self.inner.clone().await
  }
}

impl fmt::Debug for BodyCapture {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BodyCapture").finish_non_exhaustive()
  }
}

impl Default for Body {
  fn default() -> Self {
    Body::empty()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.kind {
      Kind::Full(bytes) => f.debug_tuple("Body").field(bytes).finish(),
      Kind::Stream { len, .. } => f.debug_struct("Body").field("stream_len", len).finish(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body {
      kind: Kind::Full(b),
    }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    Bytes::from(s).into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Bytes::from_static(s.as_bytes()).into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Bytes::from_static(s).into()
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Bytes::from(v).into()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::stream;

  fn chunks(parts: &[&'static str]) -> Body {
    let items: Vec<io::Result<Bytes>> = parts
      .iter()
      .map(|p| Ok(Bytes::from_static(p.as_bytes())))
      .collect();
    Body::wrap_stream(stream::iter(items))
  }

  #[tokio::test]
  async fn conversions_normalize_into_bodies() {
    assert_eq!(Body::from("abc").collect().await.expect("str"), "abc");
    assert_eq!(Body::from(String::from("abc")).size_hint(), Some(3));
    assert_eq!(Body::from(vec![1u8, 2]).collect().await.expect("vec"), vec![1u8, 2]);
    assert_eq!(chunks(&["a", "b"]).collect().await.expect("stream"), "ab");
    assert!(chunks(&[]).is_stream());
    assert_eq!(chunks(&[]).size_hint(), None);
  }

  #[tokio::test]
  async fn tee_sees_the_same_bytes_as_the_consumer() {
    let (body, capture) = chunks(&["hello ", "world"]).tee();
    let consumed = body.collect().await.expect("collect");
    assert_eq!(consumed, "hello world");
    assert_eq!(capture.bytes().await, "hello world");
    assert_eq!(capture.clone().bytes().await, "hello world", "clones share the result");
  }

  #[tokio::test]
  async fn tee_of_dropped_body_resolves_with_partial_bytes() {
    let (mut body, capture) = chunks(&["first", "second"]).tee();
    let first = body.next().await.expect("chunk").expect("ok");
    assert_eq!(first, "first");
    drop(body);
    assert_eq!(capture.bytes().await, "first");
  }

  #[tokio::test]
  async fn drain_consumes_everything() {
    assert_eq!(chunks(&["ab", "cde"]).drain().await.expect("drain"), 5);
    let failing = Body::wrap_stream(stream::iter(vec![
      Ok(Bytes::from_static(b"x")),
      Err(io::Error::from(io::ErrorKind::ConnectionReset)),
    ]));
    assert!(failing.drain().await.is_err());
  }

  #[tokio::test]
  async fn full_body_streams_once() {
    let mut body = Body::from("once");
    assert_eq!(body.next().await.expect("chunk").expect("ok"), "once");
    assert!(body.next().await.is_none());
  }
}
