//! CONNECT tunnels.
//!
//! A tunnel either splices the client straight to the requested host
//! ([`TunnelDecision::Passthrough`]) or to the in-process TLS interception
//! listener ([`TunnelDecision::Intercept`]). Every live tunnel task is tracked
//! in a [`TunnelRegistry`] so shutdown can tear them all down.

use crate::connector::Connector;
use crate::duplex::VirtualConnector;
use crate::error::{new_io_error, Result};
use crate::modifier::ModifierChain;
use bytes::Bytes;
use http::uri::Authority;
use http::Uri;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::AbortHandle;
use tokio::time::Instant;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] =
  b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const SPLICE_BUFFER: usize = 16 * 1024;

/// How a CONNECT request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDecision {
  /// bytes are relayed untouched to the requested host
  Passthrough,
  /// TLS is terminated by the proxy and the requests inside are handled
  Intercept,
}

/// Lifecycle of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
  /// waiting for the far side
  Connecting,
  /// relaying both directions
  Established,
  /// one direction reached EOF, the other is still relaying
  Closing,
  /// both sides are torn down
  Closed,
}

/// What happened on a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
  /// far side connected
  Connected,
  /// one direction ended cleanly
  Eof,
  /// a read or write failed
  Error,
  /// connect or idle deadline passed
  Timeout,
  /// proxy shutdown
  Shutdown,
}

impl TunnelState {
  /// State after `event`
  pub fn next(self, event: TunnelEvent) -> TunnelState {
    match (self, event) {
      (TunnelState::Closed, _) => TunnelState::Closed,
      (_, TunnelEvent::Error | TunnelEvent::Timeout | TunnelEvent::Shutdown) => TunnelState::Closed,
      (TunnelState::Connecting, TunnelEvent::Connected) => TunnelState::Established,
      (TunnelState::Connecting, TunnelEvent::Eof) => TunnelState::Closed,
      (TunnelState::Established, TunnelEvent::Eof) => TunnelState::Closing,
      (TunnelState::Closing, TunnelEvent::Eof) => TunnelState::Closed,
      (state, TunnelEvent::Connected) => state,
    }
  }
}

/// Relay bytes between `client` and `upstream` until both directions end.
///
/// EOF on one side is forwarded as a write shutdown to the other. Any error,
/// or no progress in either direction for `idle_timeout`, drops both streams.
/// A peer that stops reading stalls its direction and counts as idle.
pub async fn splice<A, B>(client: A, upstream: B, idle_timeout: Duration) -> Result<(u64, u64)>
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  let (client_read, client_write) = tokio::io::split(client);
  let (upstream_read, upstream_write) = tokio::io::split(upstream);
  let started = Instant::now();
  let activity = AtomicU64::new(0);
  let up = relay(client_read, upstream_write, started, &activity);
  let down = relay(upstream_read, client_write, started, &activity);
  tokio::pin!(up, down);
  let (mut sent, mut received) = (None, None);
  let mut state = TunnelState::Established;

  while state != TunnelState::Closed {
    let last = started + Duration::from_micros(activity.load(Ordering::Relaxed));
    tokio::select! {
      done = &mut up, if sent.is_none() => {
        sent = Some(done?);
        state = state.next(TunnelEvent::Eof);
      }
      done = &mut down, if received.is_none() => {
        received = Some(done?);
        state = state.next(TunnelEvent::Eof);
      }
      _ = tokio::time::sleep_until(last + idle_timeout) => {
        let last = started + Duration::from_micros(activity.load(Ordering::Relaxed));
        if last.elapsed() >= idle_timeout {
          return Err(new_io_error(
            io::ErrorKind::TimedOut,
            &format!("tunnel idle for {:?}", idle_timeout),
          ));
        }
      }
    }
  }
  Ok((sent.unwrap_or_default(), received.unwrap_or_default()))
}

/// One direction of a splice. Every completed read or write stamps `activity`
/// with the time since `started`.
async fn relay<R, W>(
  mut reader: R,
  mut writer: W,
  started: Instant,
  activity: &AtomicU64,
) -> io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let touch = || activity.store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
  let mut buf = vec![0u8; SPLICE_BUFFER];
  let mut total = 0u64;
  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      let _ = writer.shutdown().await;
      return Ok(total);
    }
    touch();
    writer.write_all(&buf[..n]).await?;
    total += n as u64;
    touch();
  }
}

#[derive(Default)]
struct Tunnels {
  next_id: u64,
  live: HashMap<u64, AbortHandle>,
  closed: bool,
}

/// Set of live tunnel tasks shared between the dispatcher and shutdown
#[derive(Clone, Default)]
pub struct TunnelRegistry {
  inner: Arc<Mutex<Tunnels>>,
}

struct TunnelGuard {
  registry: TunnelRegistry,
  id: u64,
}

impl Drop for TunnelGuard {
  fn drop(&mut self) {
    self.registry.lock().live.remove(&self.id);
  }
}

impl TunnelRegistry {
  fn lock(&self) -> MutexGuard<'_, Tunnels> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Run `tunnel` as a tracked task. Returns false once shutdown has begun.
  pub fn spawn<F>(&self, tunnel: F) -> bool
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut tunnels = self.lock();
    if tunnels.closed {
      return false;
    }
    let id = tunnels.next_id;
    tunnels.next_id += 1;
    let guard = TunnelGuard {
      registry: self.clone(),
      id,
    };
    // the guard cannot remove the entry before it is inserted: we hold the lock
    let task = tokio::spawn(async move {
      let _guard = guard;
      tunnel.await;
    });
    tunnels.live.insert(id, task.abort_handle());
    true
  }

  /// Number of live tunnels
  pub fn len(&self) -> usize {
    self.lock().live.len()
  }

  /// True when no tunnel is live
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Refuse new tunnels and abort every live one. Returns how many were aborted.
  pub fn shutdown_all(&self) -> usize {
    let handles: Vec<AbortHandle> = {
      let mut tunnels = self.lock();
      tunnels.closed = true;
      tunnels.live.drain().map(|(_, handle)| handle).collect()
    };
    for handle in &handles {
      handle.abort();
    }
    if !handles.is_empty() {
      tracing::info!("[TUNNEL] closed {} open tunnels", handles.len());
    }
    handles.len()
  }
}

/// Where an intercepted tunnel came from; handed to the TLS listener
#[derive(Debug, Clone)]
pub struct TunnelOrigin {
  /// proxy client address
  pub client_addr: Option<SocketAddr>,
  /// `host:port` from the CONNECT request
  pub authority: Authority,
}

/// Decides and runs CONNECT tunnels
#[derive(Clone)]
pub struct TunnelDispatcher {
  modifiers: Arc<ModifierChain>,
  connector: Connector,
  interceptor: VirtualConnector<TunnelOrigin>,
  registry: TunnelRegistry,
  connect_timeout: Duration,
  idle_timeout: Duration,
}

impl TunnelDispatcher {
  /// A dispatcher relaying intercepted tunnels to `interceptor`
  pub fn new(
    modifiers: Arc<ModifierChain>,
    connector: Connector,
    interceptor: VirtualConnector<TunnelOrigin>,
    registry: TunnelRegistry,
    connect_timeout: Duration,
    idle_timeout: Duration,
  ) -> Self {
    Self {
      modifiers,
      connector,
      interceptor,
      registry,
      connect_timeout,
      idle_timeout,
    }
  }

  /// Passthrough or intercept, asked once per CONNECT
  pub fn decide(&self, authority: &Authority) -> TunnelDecision {
    let uri = Uri::builder()
      .scheme("https")
      .authority(authority.clone())
      .path_and_query("/")
      .build();
    match uri {
      Ok(uri) if self.modifiers.should_intercept(&uri) => TunnelDecision::Intercept,
      _ => TunnelDecision::Passthrough,
    }
  }

  /// Take over `client` after its CONNECT head. `leftover` holds bytes the
  /// client already sent past the head.
  pub fn dispatch<S>(
    &self,
    client: S,
    authority: Authority,
    leftover: Bytes,
    client_addr: Option<SocketAddr>,
  ) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let decision = self.decide(&authority);
    tracing::debug!("[TUNNEL] CONNECT {} {:?}", authority, decision);
    let this = self.clone();
    let spawned = self.registry.spawn(async move {
      let target = authority.to_string();
      if let Err(e) = this.run(client, authority, leftover, client_addr, decision).await {
        e.log(&format!("[TUNNEL] {} closed:", target));
      }
    });
    if !spawned {
      tracing::debug!("[TUNNEL] refusing CONNECT during shutdown");
    }
  }

  async fn run<S>(
    &self,
    mut client: S,
    authority: Authority,
    leftover: Bytes,
    client_addr: Option<SocketAddr>,
    decision: TunnelDecision,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let state = TunnelState::Connecting;
    let (sent, received) = match decision {
      TunnelDecision::Passthrough => {
        let port = authority.port_u16().unwrap_or(443);
        let connected = tokio::time::timeout(
          self.connect_timeout,
          self.connector.connect(authority.host(), port),
        )
        .await;
        let mut upstream = match connected {
          Ok(Ok(upstream)) => upstream,
          Ok(Err(e)) => {
            tracing::trace!("[TUNNEL] {} {:?}", authority, state.next(TunnelEvent::Error));
            let _ = client.write_all(BAD_GATEWAY).await;
            return Err(e);
          }
          Err(_) => {
            tracing::trace!("[TUNNEL] {} {:?}", authority, state.next(TunnelEvent::Timeout));
            let _ = client.write_all(BAD_GATEWAY).await;
            return Err(new_io_error(
              io::ErrorKind::TimedOut,
              &format!("connect to {} timed out", authority),
            ));
          }
        };
        tracing::trace!("[TUNNEL] {} {:?}", authority, state.next(TunnelEvent::Connected));
        client.write_all(ESTABLISHED).await?;
        if !leftover.is_empty() {
          upstream.write_all(&leftover).await?;
        }
        splice(client, upstream, self.idle_timeout).await?
      }
      TunnelDecision::Intercept => {
        let origin = TunnelOrigin {
          client_addr,
          authority: authority.clone(),
        };
        let mut inner = tokio::time::timeout(self.connect_timeout, self.interceptor.connect(origin))
          .await
          .map_err(|_| {
            new_io_error(
              io::ErrorKind::TimedOut,
              "interception listener did not accept",
            )
          })??;
        tracing::trace!("[TUNNEL] {} {:?}", authority, state.next(TunnelEvent::Connected));
        client.write_all(ESTABLISHED).await?;
        if !leftover.is_empty() {
          inner.write_all(&leftover).await?;
        }
        splice(client, inner, self.idle_timeout).await?
      }
    };
    tracing::debug!(
      "[TUNNEL] {} finished, {} bytes up, {} bytes down",
      authority,
      sent,
      received
    );
    Ok(())
  }
}
