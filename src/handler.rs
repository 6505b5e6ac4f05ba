//! Per-request pipeline shared by the plain listener and decrypted tunnels.
//!
//! A request either gets a direct response from a modifier or is forwarded
//! upstream under a deadline. Failures become a `502 Bad Gateway` and every
//! outcome lands on a [`RequestRecord`] handed to the registered observers.

use crate::client::UpstreamClient;
use crate::error::{Error, Result};
use crate::http1;
use crate::modifier::ModifierChain;
use crate::record::{Observer, RequestRecord};
use crate::request::ProxyRequest;
use crate::response::ProxyResponse;
use http::header::CONNECTION;
use http::{HeaderValue, Method, StatusCode, Version};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Runs the modifier pipeline and the upstream exchange for each request,
/// plain or decrypted, and writes the outcome to the client.
pub struct RequestHandler {
  modifiers: Arc<ModifierChain>,
  observers: RwLock<Vec<Arc<dyn Observer>>>,
  client: UpstreamClient,
  upstream_timeout: Duration,
  capture_bodies: bool,
  next_id: AtomicU64,
}

fn is_bodiless(method: &Method, status: StatusCode) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
}

impl RequestHandler {
  /// A handler sending upstream requests through `client`
  pub fn new(
    modifiers: Arc<ModifierChain>,
    client: UpstreamClient,
    upstream_timeout: Duration,
    capture_bodies: bool,
  ) -> Self {
    Self {
      modifiers,
      observers: RwLock::new(Vec::new()),
      client,
      upstream_timeout,
      capture_bodies,
      next_id: AtomicU64::new(1),
    }
  }

  /// Register an observer for completed requests
  pub fn add_observer(&self, observer: Arc<dyn Observer>) {
    self
      .observers
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .push(observer);
  }

  /// The modifier chain consulted for every request
  pub fn modifiers(&self) -> &Arc<ModifierChain> {
    &self.modifiers
  }

  /// Serve one request. Returns whether the client connection may carry
  /// another request.
  pub async fn handle<W>(
    &self,
    mut request: ProxyRequest,
    writer: &mut W,
    keep_alive: bool,
  ) -> Result<bool>
  where
    W: AsyncWrite + Unpin,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let record = Arc::new(RequestRecord::new(id, &request));
    let method = request.method().clone();
    let client_version = request.version();
    tracing::debug!("[HANDLER] #{} begin {} {}", id, method, request.uri());

    let direct = self.modifiers.direct_response(&request).await;
    let mut response = match direct {
      Some(mut response) => {
        request.take_body().drain_in_background("request");
        self.modifiers.change_response(&request, &mut response).await;
        response
      }
      None => {
        self.modifiers.change_request(&mut request).await;
        record.update_request(&request);
        let mut body = request.take_body();
        if self.capture_bodies {
          let (forwarded, capture) = body.tee();
          record.capture_request_body(capture);
          body = forwarded;
        }
        match tokio::time::timeout(self.upstream_timeout, self.client.send(&request, body)).await {
          Ok(Ok(mut response)) => {
            self.modifiers.change_response(&request, &mut response).await;
            response
          }
          Ok(Err(e)) => {
            e.log(&format!("[HANDLER] #{} {} {} failed:", id, request.method(), request.uri()));
            record.fail(e.to_string());
            ProxyResponse::bad_gateway(e.to_string())
          }
          Err(_) => {
            let e = Error::UpstreamTimeout(self.upstream_timeout);
            tracing::warn!("[HANDLER] #{} {} {} {}", id, request.method(), request.uri(), e);
            record.fail(e.to_string());
            ProxyResponse::bad_gateway(e.to_string())
          }
        }
      }
    };

    record.on_response(&response);
    let status = response.status_code();
    let bodiless = is_bodiless(&method, status);
    let mut headers = response.headers().clone();
    http1::strip_hop_by_hop(&mut headers);
    let mut body = response.take_body();
    if self.capture_bodies && !bodiless {
      let (forwarded, capture) = body.tee();
      record.capture_response_body(capture);
      body = forwarded;
    }
    let framing = http1::frame_response_body(client_version, &mut headers, &body, bodiless);
    let keep_alive = keep_alive && !framing.close;
    if !keep_alive {
      headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let written = async move {
      http1::write_response_head(writer, Version::HTTP_11, status, &headers).await?;
      if bodiless {
        body.drain_in_background("response");
        writer.flush().await?;
        Ok(0)
      } else {
        http1::write_body(writer, body, framing.chunked).await
      }
    }
    .await;

    let outcome = match written {
      Ok(n) => {
        tracing::debug!("[HANDLER] #{} done {} ({} body bytes)", id, status, n);
        Ok(keep_alive)
      }
      Err(e) => {
        let e = Error::from(e);
        e.log(&format!("[HANDLER] #{} writing response failed:", id));
        record.fail(e.to_string());
        Err(e)
      }
    };
    record.finish();
    self.notify(record);
    outcome
  }

  fn notify(&self, record: Arc<RequestRecord>) {
    let observers = self
      .observers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if observers.is_empty() {
      return;
    }
    tokio::spawn(async move {
      for observer in observers {
        observer.on_complete(record.clone()).await;
      }
    });
  }
}
