//! Traffic modification pipeline.
//!
//! A [`Modifier`] advertises the hooks it implements through [`Hooks`]; the
//! [`ModifierChain`] calls only those, in registration order, one at a time.
//! A hook that fails or panics is logged and counts as having returned nothing.

use crate::error::Result;
use crate::request::{ProxyRequest, RequestChange};
use crate::response::{ProxyResponse, ResponseChange};
use async_trait::async_trait;
use futures::FutureExt;
use http::Uri;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::ops::BitOr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

/// Set of hooks a modifier implements
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Hooks(u8);

impl Hooks {
  /// no hooks
  pub const NONE: Hooks = Hooks(0);
  /// [`Modifier::is_parse_secure`]
  pub const PARSE_SECURE: Hooks = Hooks(1);
  /// [`Modifier::direct_response`]
  pub const DIRECT_RESPONSE: Hooks = Hooks(1 << 1);
  /// [`Modifier::change_request`]
  pub const CHANGE_REQUEST: Hooks = Hooks(1 << 2);
  /// [`Modifier::change_response`]
  pub const CHANGE_RESPONSE: Hooks = Hooks(1 << 3);

  /// True if every hook in `other` is also in `self`
  pub const fn contains(self, other: Hooks) -> bool {
    self.0 & other.0 == other.0
  }
}

impl BitOr for Hooks {
  type Output = Hooks;

  fn bitor(self, rhs: Hooks) -> Hooks {
    Hooks(self.0 | rhs.0)
  }
}

impl fmt::Debug for Hooks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names = [
      (Hooks::PARSE_SECURE, "PARSE_SECURE"),
      (Hooks::DIRECT_RESPONSE, "DIRECT_RESPONSE"),
      (Hooks::CHANGE_REQUEST, "CHANGE_REQUEST"),
      (Hooks::CHANGE_RESPONSE, "CHANGE_RESPONSE"),
    ];
    f.debug_set()
      .entries(names.iter().filter(|(h, _)| self.contains(*h)).map(|(_, n)| n))
      .finish()
  }
}

/// A pluggable unit that inspects or rewrites traffic in flight.
///
/// Every hook has a no-op default; only hooks listed by [`Modifier::hooks`] are called.
#[async_trait]
pub trait Modifier: Send + Sync {
  /// Hooks this modifier implements
  fn hooks(&self) -> Hooks;

  /// Name used in logs
  fn name(&self) -> &str {
    std::any::type_name::<Self>()
  }

  /// Ask for CONNECT tunnels to `uri` to be decrypted
  fn is_parse_secure(&self, _uri: &Uri) -> bool {
    false
  }

  /// Answer the request without contacting the upstream
  async fn direct_response(&self, _request: &ProxyRequest) -> Result<Option<ProxyResponse>> {
    Ok(None)
  }

  /// Rewrite the request before it is sent upstream
  async fn change_request(&self, _request: &ProxyRequest) -> Result<Option<RequestChange>> {
    Ok(None)
  }

  /// Rewrite the response before it is written to the client
  async fn change_response(
    &self,
    _request: &ProxyRequest,
    _response: &ProxyResponse,
  ) -> Result<Option<ResponseChange>> {
    Ok(None)
  }
}

fn same_modifier(a: &Arc<dyn Modifier>, b: &Arc<dyn Modifier>) -> bool {
  std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    s
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.as_str()
  } else {
    "unknown panic"
  }
}

async fn guarded<T, F>(modifier: &dyn Modifier, hook: &str, call: F) -> Option<T>
where
  F: Future<Output = Result<Option<T>>>,
{
  match AssertUnwindSafe(call).catch_unwind().await {
    Ok(Ok(value)) => value,
    Ok(Err(e)) => {
      tracing::warn!("[MITM] modifier {} failed in {}: {}", modifier.name(), hook, e);
      None
    }
    Err(panic) => {
      tracing::warn!(
        "[MITM] modifier {} panicked in {}: {}",
        modifier.name(),
        hook,
        panic_message(panic.as_ref())
      );
      None
    }
  }
}

/// Ordered, shareable list of modifiers
pub struct ModifierChain {
  modifiers: RwLock<Vec<Arc<dyn Modifier>>>,
  intercept_all: bool,
}

impl fmt::Debug for ModifierChain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModifierChain")
      .field("len", &self.len())
      .field("intercept_all", &self.intercept_all)
      .finish()
  }
}

impl ModifierChain {
  /// An empty chain; `intercept_all` decrypts every CONNECT tunnel.
  pub fn new(intercept_all: bool) -> Self {
    Self {
      modifiers: RwLock::new(Vec::new()),
      intercept_all,
    }
  }

  /// Append `modifier`. Returns false if this exact instance is already registered.
  pub fn add(&self, modifier: Arc<dyn Modifier>) -> bool {
    let mut modifiers = self.modifiers.write().unwrap_or_else(PoisonError::into_inner);
    if modifiers.iter().any(|m| same_modifier(m, &modifier)) {
      return false;
    }
    tracing::debug!("[MITM] modifier {} added with {:?}", modifier.name(), modifier.hooks());
    modifiers.push(modifier);
    true
  }

  /// Remove `modifier` by identity. Returns whether it was registered.
  pub fn remove(&self, modifier: &Arc<dyn Modifier>) -> bool {
    let mut modifiers = self.modifiers.write().unwrap_or_else(PoisonError::into_inner);
    let before = modifiers.len();
    modifiers.retain(|m| !same_modifier(m, modifier));
    before != modifiers.len()
  }

  /// Number of registered modifiers
  pub fn len(&self) -> usize {
    self.modifiers.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  /// True if no modifier is registered
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn with_hook(&self, hook: Hooks) -> Vec<Arc<dyn Modifier>> {
    self
      .modifiers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .filter(|m| m.hooks().contains(hook))
      .cloned()
      .collect()
  }

  /// Whether a CONNECT to `uri` is decrypted
  pub fn should_intercept(&self, uri: &Uri) -> bool {
    if self.intercept_all {
      return true;
    }
    self.with_hook(Hooks::PARSE_SECURE).iter().any(|m| {
      match std::panic::catch_unwind(AssertUnwindSafe(|| m.is_parse_secure(uri))) {
        Ok(intercept) => intercept,
        Err(panic) => {
          tracing::warn!(
            "[MITM] modifier {} panicked in is_parse_secure: {}",
            m.name(),
            panic_message(panic.as_ref())
          );
          false
        }
      }
    })
  }

  /// First response produced by a `direct_response` hook, if any
  pub async fn direct_response(&self, request: &ProxyRequest) -> Option<ProxyResponse> {
    for m in self.with_hook(Hooks::DIRECT_RESPONSE) {
      if let Some(response) =
        guarded(m.as_ref(), "direct_response", m.direct_response(request)).await
      {
        tracing::debug!("[MITM] {} answered {} directly", m.name(), request.uri());
        return Some(response);
      }
    }
    None
  }

  /// Apply every `change_request` hook in turn
  pub async fn change_request(&self, request: &mut ProxyRequest) {
    for m in self.with_hook(Hooks::CHANGE_REQUEST) {
      if let Some(change) = guarded(m.as_ref(), "change_request", m.change_request(request)).await {
        request.apply(change);
      }
    }
  }

  /// Apply every `change_response` hook in turn
  pub async fn change_response(&self, request: &ProxyRequest, response: &mut ProxyResponse) {
    for m in self.with_hook(Hooks::CHANGE_RESPONSE) {
      if let Some(change) = guarded(
        m.as_ref(),
        "change_response",
        m.change_response(request, response),
      )
      .await
      {
        response.apply(change);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use http::{HeaderMap, HeaderValue, StatusCode};

  struct Intercept(&'static str);

  impl Modifier for Intercept {
    fn hooks(&self) -> Hooks {
      Hooks::PARSE_SECURE
    }
    fn is_parse_secure(&self, uri: &Uri) -> bool {
      uri.host() == Some(self.0)
    }
  }

  struct SetHeader;

  #[async_trait]
  impl Modifier for SetHeader {
    fn hooks(&self) -> Hooks {
      Hooks::CHANGE_REQUEST
    }
    async fn change_request(&self, request: &ProxyRequest) -> Result<Option<RequestChange>> {
      let mut headers = request.headers().clone();
      headers.insert("x-step", HeaderValue::from_static("1"));
      Ok(Some(RequestChange::new().headers(headers)))
    }
  }

  struct Failing;

  #[async_trait]
  impl Modifier for Failing {
    fn hooks(&self) -> Hooks {
      Hooks::CHANGE_REQUEST | Hooks::CHANGE_RESPONSE
    }
    async fn change_request(&self, _request: &ProxyRequest) -> Result<Option<RequestChange>> {
      Err(Error::other("boom"))
    }
    async fn change_response(
      &self,
      _request: &ProxyRequest,
      _response: &ProxyResponse,
    ) -> Result<Option<ResponseChange>> {
      panic!("hook panicked")
    }
  }

  struct Increment;

  #[async_trait]
  impl Modifier for Increment {
    fn hooks(&self) -> Hooks {
      Hooks::CHANGE_RESPONSE
    }
    async fn change_response(
      &self,
      _request: &ProxyRequest,
      response: &ProxyResponse,
    ) -> Result<Option<ResponseChange>> {
      let next = response
        .headers()
        .get("x")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
      let mut headers = response.headers().clone();
      headers.insert("x", HeaderValue::from(next));
      Ok(Some(ResponseChange::new().headers(headers)))
    }
  }

  fn request() -> ProxyRequest {
    ProxyRequest::from(
      http::Request::builder()
        .uri("http://example.com/")
        .body("")
        .expect("request"),
    )
  }

  #[test]
  fn add_and_remove_are_idempotent() {
    let chain = ModifierChain::new(false);
    let a: Arc<dyn Modifier> = Arc::new(SetHeader);
    let never_added: Arc<dyn Modifier> = Arc::new(SetHeader);
    assert!(!chain.remove(&never_added));
    assert_eq!(chain.len(), 0);
    assert!(chain.add(a.clone()));
    assert!(!chain.add(a.clone()), "same instance is not added twice");
    assert!(!chain.remove(&never_added));
    assert_eq!(chain.len(), 1);
    assert!(chain.remove(&a));
    assert!(chain.is_empty());
  }

  #[test]
  fn intercept_decision() {
    let uri = Uri::from_static("https://example.com:443");
    assert!(ModifierChain::new(true).should_intercept(&uri));
    let chain = ModifierChain::new(false);
    assert!(!chain.should_intercept(&uri));
    chain.add(Arc::new(Intercept("other.com")));
    assert!(!chain.should_intercept(&uri));
    chain.add(Arc::new(Intercept("example.com")));
    assert!(chain.should_intercept(&uri));
  }

  #[tokio::test]
  async fn failing_hooks_are_skipped() {
    let chain = ModifierChain::new(false);
    chain.add(Arc::new(Failing));
    chain.add(Arc::new(SetHeader));
    let mut req = request();
    chain.change_request(&mut req).await;
    assert_eq!(req.headers()["x-step"], "1", "later modifiers still run");

    chain.add(Arc::new(Increment));
    let mut response = ProxyResponse::new(StatusCode::OK, "body");
    chain.change_response(&req, &mut response).await;
    assert_eq!(response.headers()["x"], "1");
  }

  #[tokio::test]
  async fn response_changes_accumulate_in_order() {
    let chain = ModifierChain::new(false);
    chain.add(Arc::new(Increment));
    chain.add(Arc::new(Increment));
    let mut response = ProxyResponse::new(StatusCode::OK, "");
    *response.headers_mut() = HeaderMap::new();
    chain.change_response(&request(), &mut response).await;
    assert_eq!(response.headers()["x"], "2");
  }
}
