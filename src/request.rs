use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Uri, Version};
use tokio::sync::Mutex;

use crate::body::Body;
use crate::error::Result;

/// A request flowing through the proxy, plain or decrypted.
///
/// Hooks see requests by shared reference; [`ProxyRequest::body_bytes`] buffers
/// a streaming body in place so every later hook and the upstream see the same bytes.
pub struct ProxyRequest {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap<HeaderValue>,
  body: Mutex<Body>,
  client_addr: Option<SocketAddr>,
}

impl Debug for ProxyRequest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyRequest")
      .field("method", &self.method)
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("client_addr", &self.client_addr)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for ProxyRequest
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      method: parts.method,
      uri: parts.uri,
      version: parts.version,
      headers: parts.headers,
      body: Mutex::new(body.into()),
      client_addr: None,
    }
  }
}

impl ProxyRequest {
  pub(crate) fn new(
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Body,
    client_addr: Option<SocketAddr>,
  ) -> Self {
    Self {
      method,
      uri,
      version,
      headers,
      body: Mutex::new(body),
      client_addr,
    }
  }

  /// Request method
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Absolute request URL
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// Protocol version the client spoke
  pub fn version(&self) -> Version {
    self.version
  }

  /// Request headers as received (or as modified so far)
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Address of the proxy client, when known
  pub fn client_addr(&self) -> Option<SocketAddr> {
    self.client_addr
  }

  /// True for requests decrypted from an intercepted tunnel
  pub fn is_secure(&self) -> bool {
    self.uri.scheme() == Some(&http::uri::Scheme::HTTPS)
  }

  /// Buffer the body and return it. The buffered copy replaces the stream, so
  /// the body is still forwarded afterwards.
  pub async fn body_bytes(&self) -> Result<Bytes> {
    let mut body = self.body.lock().await;
    if let Some(bytes) = body.as_bytes() {
      return Ok(bytes.clone());
    }
    let bytes = std::mem::take(&mut *body).collect().await?;
    *body = Body::from(bytes.clone());
    Ok(bytes)
  }

  /// Replace the body; a streaming body that is displaced gets drained.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    let old = std::mem::replace(self.body.get_mut(), body.into());
    old.drain_in_background("request");
  }

  pub(crate) fn take_body(&mut self) -> Body {
    std::mem::take(self.body.get_mut())
  }

  pub(crate) fn apply(&mut self, change: RequestChange) {
    if let Some(method) = change.method {
      self.method = method;
    }
    if let Some(uri) = change.uri {
      self.uri = uri;
    }
    if let Some(headers) = change.headers {
      self.headers = headers;
    }
    if let Some(body) = change.body {
      self.set_body(body);
    }
  }
}

/// Replacement parts returned by a `change_request` hook. Unset parts keep
/// their current value.
#[derive(Debug, Default)]
pub struct RequestChange {
  method: Option<Method>,
  uri: Option<Uri>,
  headers: Option<HeaderMap>,
  body: Option<Body>,
}

impl RequestChange {
  /// An empty change
  pub fn new() -> Self {
    Self::default()
  }
  /// Replace the method
  pub fn method(mut self, method: Method) -> Self {
    self.method = Some(method);
    self
  }
  /// Replace the target URL
  pub fn uri(mut self, uri: Uri) -> Self {
    self.uri = Some(uri);
    self
  }
  /// Replace the full header map
  pub fn headers(mut self, headers: HeaderMap) -> Self {
    self.headers = Some(headers);
    self
  }
  /// Replace the body with a stream, bytes or a string
  pub fn body(mut self, body: impl Into<Body>) -> Self {
    self.body = Some(body.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::{stream, StreamExt};
  use std::io;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  #[tokio::test]
  async fn body_bytes_buffers_in_place() {
    let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"a=")), Ok(Bytes::from_static(b"1"))];
    let mut request = ProxyRequest::new(
      Method::POST,
      Uri::from_static("http://example.com/form"),
      Version::HTTP_11,
      HeaderMap::new(),
      Body::wrap_stream(stream::iter(chunks)),
      None,
    );
    assert_eq!(request.body_bytes().await.expect("body"), "a=1");
    assert_eq!(request.body_bytes().await.expect("again"), "a=1");
    assert_eq!(request.take_body().collect().await.expect("forwarded"), "a=1");
  }

  #[tokio::test]
  async fn replaced_upload_is_drained() {
    let drained = Arc::new(AtomicBool::new(false));
    let flag = drained.clone();
    let upload = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"client upload"))])
      .chain(stream::once(async move {
        flag.store(true, Ordering::SeqCst);
        Ok(Bytes::new())
      }));
    let mut request = ProxyRequest::new(
      Method::POST,
      Uri::from_static("http://example.com/upload"),
      Version::HTTP_11,
      HeaderMap::new(),
      Body::wrap_stream(upload),
      None,
    );
    request.apply(RequestChange::new().body("rewritten"));
    assert_eq!(request.body_bytes().await.expect("body"), "rewritten");
    for _ in 0..50 {
      if drained.load(Ordering::SeqCst) {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(drained.load(Ordering::SeqCst), "displaced upload was read to the end");
  }

  #[test]
  fn change_keeps_unset_parts() {
    let mut request = ProxyRequest::from(
      HttpRequest::builder()
        .uri("https://example.com/")
        .header("x-a", "1")
        .body("")
        .expect("request"),
    );
    assert!(request.is_secure());
    request.apply(RequestChange::new().method(Method::PUT));
    assert_eq!(request.method(), Method::PUT);
    assert_eq!(request.uri(), "https://example.com/");
    assert_eq!(request.headers()["x-a"], "1");
  }
}
