//! Plain listener: proxied HTTP and CONNECT on one port.
//!
//! [`serve_connection`] is shared with the TLS interception listener, which
//! feeds it decrypted streams.

use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::http1::{self, RequestHead};
use crate::request::ProxyRequest;
use crate::tunnel::TunnelDispatcher;
use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Where a connection's requests come from
#[derive(Debug, Clone)]
pub struct ConnectionContext {
  /// proxy client address
  pub client_addr: Option<SocketAddr>,
  /// `Some` for decrypted connections: the authority relative targets resolve against
  pub secure_authority: Option<String>,
}

impl ConnectionContext {
  /// Context of a plain proxy connection
  pub fn plain(client_addr: SocketAddr) -> Self {
    Self {
      client_addr: Some(client_addr),
      secure_authority: None,
    }
  }
}

enum Target {
  Request(Uri),
  Connect(Authority),
}

fn resolve_target(head: &RequestHead, ctx: &ConnectionContext) -> Result<Target> {
  if head.method == Method::CONNECT {
    if ctx.secure_authority.is_some() {
      return Err(Error::invalid_request("CONNECT inside an intercepted tunnel"));
    }
    return Ok(Target::Connect(head.target.parse::<Authority>().map_err(|_| {
      Error::invalid_request(format!("invalid CONNECT target {}", head.target))
    })?));
  }
  match &ctx.secure_authority {
    Some(authority) if head.target.starts_with('/') => {
      let host = head
        .headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or(authority);
      let uri = format!("https://{}{}", host, head.target)
        .parse::<Uri>()
        .map_err(|_| Error::invalid_request(format!("invalid request target {}", head.target)))?;
      Ok(Target::Request(uri))
    }
    _ => {
      // proxies are addressed with absolute URLs
      let uri = head
        .target
        .parse::<Uri>()
        .ok()
        .filter(|u| {
          u.authority().is_some()
            && matches!(u.scheme(), Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS)
        })
        .ok_or_else(|| {
          Error::invalid_request(format!("request target is not an absolute URL: {}", head.target))
        })?;
      Ok(Target::Request(uri))
    }
  }
}

/// Serve requests on `stream` until the client closes or the connection is
/// handed over to a tunnel.
pub async fn serve_connection<S>(
  stream: S,
  ctx: ConnectionContext,
  handler: Arc<RequestHandler>,
  tunnels: Option<TunnelDispatcher>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (read_half, mut write_half) = tokio::io::split(stream);
  let mut reader = BufReader::new(read_half);
  loop {
    let head = match http1::read_request_head(&mut reader).await {
      Ok(Some(head)) => head,
      Ok(None) => return Ok(()),
      Err(e) if e.is_benign_disconnect() => return Ok(()),
      Err(e) => {
        // the stream position is unknown after a malformed head
        let _ = http1::write_simple_response(
          &mut write_half,
          StatusCode::BAD_REQUEST,
          &e.to_string(),
          true,
        )
        .await;
        return Err(e);
      }
    };

    let framing = match http1::request_framing(&head.headers) {
      Ok(framing) => framing,
      Err(e) => {
        let _ = http1::write_simple_response(
          &mut write_half,
          StatusCode::BAD_REQUEST,
          &e.to_string(),
          true,
        )
        .await;
        return Err(e);
      }
    };
    let keep_alive = http1::wants_keep_alive(head.version, &head.headers);

    let uri = match resolve_target(&head, &ctx) {
      Ok(Target::Request(uri)) => uri,
      Ok(Target::Connect(authority)) => {
        if let Some(dispatcher) = &tunnels {
          let leftover = Bytes::copy_from_slice(reader.buffer());
          let stream = reader.into_inner().unsplit(write_half);
          dispatcher.dispatch(stream, authority, leftover, ctx.client_addr);
          return Ok(());
        }
        let _ = http1::write_simple_response(
          &mut write_half,
          StatusCode::METHOD_NOT_ALLOWED,
          "CONNECT not supported",
          true,
        )
        .await;
        return Ok(());
      }
      Err(e) => {
        // the head was well formed, so skip its body and keep the connection
        let (body, returned) = http1::body_reader(reader, framing);
        let drained = body.drain().await;
        http1::write_simple_response(
          &mut write_half,
          StatusCode::BAD_REQUEST,
          &e.to_string(),
          !keep_alive,
        )
        .await?;
        match (drained, returned.await) {
          (Ok(_), Ok(next)) if keep_alive => {
            reader = next;
            continue;
          }
          _ => return Ok(()),
        }
      }
    };

    let (body, returned) = http1::body_reader(reader, framing);
    let RequestHead {
      method,
      version,
      headers,
      ..
    } = head;
    let request = ProxyRequest::new(method, uri, version, headers, body, ctx.client_addr);
    if !handler.handle(request, &mut write_half, keep_alive).await? {
      let _ = write_half.shutdown().await;
      return Ok(());
    }
    reader = match returned.await {
      Ok(reader) => reader,
      // the request body was not read to its end
      Err(_) => return Ok(()),
    };
  }
}

/// Accept loop of the plain listener
pub async fn run_plain_listener(
  listener: TcpListener,
  handler: Arc<RequestHandler>,
  tunnels: TunnelDispatcher,
  mut shutdown: watch::Receiver<bool>,
) {
  loop {
    let accepted: std::io::Result<(TcpStream, SocketAddr)> = tokio::select! {
      accepted = listener.accept() => accepted,
      _ = shutdown.changed() => break,
    };
    match accepted {
      Ok((stream, peer_addr)) => {
        let _ = stream.set_nodelay(true);
        let handler = handler.clone();
        let tunnels = tunnels.clone();
        tokio::spawn(async move {
          let ctx = ConnectionContext::plain(peer_addr);
          if let Err(e) = serve_connection(stream, ctx, handler, Some(tunnels)).await {
            e.log(&format!("[MITM] connection from {} ended:", peer_addr));
          }
        });
      }
      Err(e) => {
        tracing::error!("[MITM] Failed to accept connection: {}", e);
      }
    }
  }
  tracing::debug!("[MITM] plain listener stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{HeaderMap, HeaderValue, Version};

  fn head(method: Method, target: &str, host: Option<&'static str>) -> RequestHead {
    let mut headers = HeaderMap::new();
    if let Some(host) = host {
      headers.insert(http::header::HOST, HeaderValue::from_static(host));
    }
    RequestHead {
      method,
      target: target.to_string(),
      version: Version::HTTP_11,
      headers,
    }
  }

  fn plain() -> ConnectionContext {
    ConnectionContext::plain("127.0.0.1:5000".parse().expect("addr"))
  }

  fn secure() -> ConnectionContext {
    ConnectionContext {
      client_addr: None,
      secure_authority: Some("example.com:443".to_string()),
    }
  }

  #[test]
  fn plain_requests_need_absolute_urls() {
    assert!(matches!(
      resolve_target(&head(Method::GET, "http://example.com/a", None), &plain()),
      Ok(Target::Request(uri)) if uri == "http://example.com/a"
    ));
    assert!(resolve_target(&head(Method::GET, "/a", Some("example.com")), &plain()).is_err());
    assert!(resolve_target(&head(Method::GET, "ftp://example.com/a", None), &plain()).is_err());
  }

  #[test]
  fn connect_targets_are_authorities() {
    assert!(matches!(
      resolve_target(&head(Method::CONNECT, "example.com:443", None), &plain()),
      Ok(Target::Connect(a)) if a.host() == "example.com" && a.port_u16() == Some(443)
    ));
    assert!(resolve_target(&head(Method::CONNECT, "example.com:443", None), &secure()).is_err());
  }

  #[test]
  fn decrypted_relative_targets_become_https_urls() {
    assert!(matches!(
      resolve_target(&head(Method::GET, "/p?q=1", Some("example.com")), &secure()),
      Ok(Target::Request(uri)) if uri == "https://example.com/p?q=1"
    ));
    assert!(matches!(
      resolve_target(&head(Method::GET, "/p", None), &secure()),
      Ok(Target::Request(uri)) if uri == "https://example.com:443/p"
    ));
  }
}
