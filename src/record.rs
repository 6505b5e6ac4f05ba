//! Per-request observability records.

use crate::body::BodyCapture;
use crate::error::{Error, Result};
use crate::request::ProxyRequest;
use crate::response::ProxyResponse;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// JSON-serializable metadata of one request/response pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
  /// process-unique id
  pub id: u64,
  /// request method
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// absolute request URL
  #[serde(with = "http_serde::uri")]
  pub url: Uri,
  /// client protocol version
  #[serde(with = "http_serde::version")]
  pub version: Version,
  /// decrypted from an intercepted tunnel
  pub secure: bool,
  /// proxy client address
  pub client_address: Option<SocketAddr>,
  /// upstream server address
  pub remote_address: Option<SocketAddr>,
  /// request headers as sent upstream
  #[serde(with = "http_serde::header_map")]
  pub request_headers: HeaderMap,
  /// milliseconds since the unix epoch
  pub request_begin_at: u64,
  /// response status
  #[serde(with = "http_serde::option::status_code")]
  pub status_code: Option<StatusCode>,
  /// response headers
  #[serde(with = "http_serde::header_map")]
  pub response_headers: HeaderMap,
  /// milliseconds since the unix epoch
  pub response_begin_at: Option<u64>,
  /// milliseconds since the unix epoch
  pub response_end_at: Option<u64>,
  /// total time from request start to the end of the response body
  pub duration_ms: Option<u64>,
  /// upstream or transfer failure
  pub error: Option<String>,
}

/// Metadata plus complete bodies
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
  /// metadata at snapshot time
  pub metadata: RecordMetadata,
  /// request body, when captured
  pub request_body: Option<Bytes>,
  /// response body, when captured
  pub response_body: Option<Bytes>,
}

/// Progressively filled record of one request/response pair.
///
/// Setters become no-ops once [`RequestRecord::finish`] has run.
#[derive(Debug)]
pub struct RequestRecord {
  metadata: Mutex<RecordMetadata>,
  request_body: Mutex<Option<BodyCapture>>,
  response_body: Mutex<Option<BodyCapture>>,
  started: Instant,
  finalized: AtomicBool,
}

fn now_ms() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or_default()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RequestRecord {
  /// Start a record for `request`
  pub fn new(id: u64, request: &ProxyRequest) -> Self {
    Self {
      metadata: Mutex::new(RecordMetadata {
        id,
        method: request.method().clone(),
        url: request.uri().clone(),
        version: request.version(),
        secure: request.is_secure(),
        client_address: request.client_addr(),
        remote_address: None,
        request_headers: request.headers().clone(),
        request_begin_at: now_ms(),
        status_code: None,
        response_headers: HeaderMap::new(),
        response_begin_at: None,
        response_end_at: None,
        duration_ms: None,
        error: None,
      }),
      request_body: Mutex::new(None),
      response_body: Mutex::new(None),
      started: Instant::now(),
      finalized: AtomicBool::new(false),
    }
  }

  fn update(&self, f: impl FnOnce(&mut RecordMetadata)) {
    if self.is_finalized() {
      return;
    }
    f(&mut lock(&self.metadata));
  }

  /// Refresh request fields after modifiers ran
  pub fn update_request(&self, request: &ProxyRequest) {
    self.update(|m| {
      m.method = request.method().clone();
      m.url = request.uri().clone();
      m.request_headers = request.headers().clone();
    });
  }

  /// Record response status and headers
  pub fn on_response(&self, response: &ProxyResponse) {
    self.update(|m| {
      m.status_code = Some(response.status_code());
      m.response_headers = response.headers().clone();
      m.remote_address = response.remote_addr();
      m.response_begin_at = Some(now_ms());
    });
  }

  /// Record a failure message
  pub fn fail(&self, error: impl Into<String>) {
    let error = error.into();
    self.update(|m| m.error = Some(error));
  }

  pub(crate) fn capture_request_body(&self, capture: BodyCapture) {
    if !self.is_finalized() {
      *lock(&self.request_body) = Some(capture);
    }
  }

  pub(crate) fn capture_response_body(&self, capture: BodyCapture) {
    if !self.is_finalized() {
      *lock(&self.response_body) = Some(capture);
    }
  }

  /// Stamp completion time and freeze the record
  pub fn finish(&self) {
    self.update(|m| {
      m.response_end_at = Some(now_ms());
      m.duration_ms = Some(self.started.elapsed().as_millis() as u64);
    });
    self.finalized.store(true, Ordering::Release);
  }

  /// True once the response body has been fully delivered or abandoned
  pub fn is_finalized(&self) -> bool {
    self.finalized.load(Ordering::Acquire)
  }

  /// Point-in-time copy of the metadata
  pub fn metadata(&self) -> RecordMetadata {
    lock(&self.metadata).clone()
  }

  /// Metadata rendered as JSON
  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string(&self.metadata())
      .map_err(|e| Error::other(format!("record serialization failed: {}", e)))
  }

  /// Metadata plus the captured bodies, waiting for the bodies to end
  pub async fn snapshot(&self) -> RecordSnapshot {
    let request_body = lock(&self.request_body).clone();
    let response_body = lock(&self.response_body).clone();
    RecordSnapshot {
      metadata: self.metadata(),
      request_body: match request_body {
        Some(capture) => Some(capture.bytes().await),
        None => None,
      },
      response_body: match response_body {
        Some(capture) => Some(capture.bytes().await),
        None => None,
      },
    }
  }
}

/// Passive listener told about every completed request
#[async_trait]
pub trait Observer: Send + Sync {
  /// Called once per request with its finalized record
  async fn on_complete(&self, record: Arc<RequestRecord>);
}

/// Logs one line per completed request
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
  async fn on_complete(&self, record: Arc<RequestRecord>) {
    let m = record.metadata();
    let status = m
      .status_code
      .map(|s| s.as_u16().to_string())
      .unwrap_or_else(|| "-".to_string());
    match m.error {
      Some(error) => tracing::info!(
        "[MITM] {} {} {} - {} ms ({})",
        m.method,
        m.url,
        status,
        m.duration_ms.unwrap_or_default(),
        error
      ),
      None => tracing::info!(
        "[MITM] {} {} {} - {} ms",
        m.method,
        m.url,
        status,
        m.duration_ms.unwrap_or_default()
      ),
    }
  }
}
