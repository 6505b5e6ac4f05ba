use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;
use http::Response as HttpResponse;
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::Mutex;

use crate::body::Body;
use crate::error::Result;

/// A response on its way back to the client
pub struct ProxyResponse {
  status: StatusCode,
  version: Version,
  headers: HeaderMap,
  body: Mutex<Body>,
  remote_addr: Option<SocketAddr>,
}

impl Debug for ProxyResponse {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyResponse")
      .field("status", &self.status)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("remote_addr", &self.remote_addr)
      .finish()
  }
}

impl<T> From<HttpResponse<T>> for ProxyResponse
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      status: parts.status,
      version: parts.version,
      headers: parts.headers,
      body: Mutex::new(body.into()),
      remote_addr: None,
    }
  }
}

impl ProxyResponse {
  /// A response with `status` and `body` and no headers
  pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
    Self {
      status,
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Mutex::new(body.into()),
      remote_addr: None,
    }
  }

  /// An `http` builder; the result converts with `ProxyResponse::from`
  pub fn builder() -> http::response::Builder {
    HttpResponse::builder()
  }

  pub(crate) fn upstream(
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
    remote_addr: SocketAddr,
  ) -> Self {
    Self {
      status,
      version,
      headers,
      body: Mutex::new(body),
      remote_addr: Some(remote_addr),
    }
  }

  pub(crate) fn bad_gateway(message: String) -> Self {
    let mut response = Self::new(StatusCode::BAD_GATEWAY, message);
    response.headers.insert(
      http::header::CONTENT_TYPE,
      http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
  }

  /// Status code
  pub fn status_code(&self) -> StatusCode {
    self.status
  }

  /// Protocol version of the upstream response
  pub fn version(&self) -> Version {
    self.version
  }

  /// Response headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Mutable response headers
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Address of the upstream server that produced this response
  pub fn remote_addr(&self) -> Option<SocketAddr> {
    self.remote_addr
  }

  /// Buffer the body and return it, keeping the buffered copy as the body.
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
    old.drain_in_background("response");
  }

  pub(crate) fn take_body(&mut self) -> Body {
    std::mem::take(self.body.get_mut())
  }

  pub(crate) fn apply(&mut self, change: ResponseChange) {
    if let Some(status) = change.status {
      self.status = status;
    }
    if let Some(headers) = change.headers {
      self.headers = headers;
    }
    if let Some(body) = change.body {
      self.set_body(body);
    }
  }
}

/// Replacement parts returned by a `change_response` hook
#[derive(Debug, Default)]
pub struct ResponseChange {
  status: Option<StatusCode>,
  headers: Option<HeaderMap>,
  body: Option<Body>,
}

impl ResponseChange {
  /// An empty change
  pub fn new() -> Self {
    Self::default()
  }
  /// Replace the status code
  pub fn status(mut self, status: StatusCode) -> Self {
    self.status = Some(status);
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
