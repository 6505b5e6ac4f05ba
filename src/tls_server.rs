//! TLS interception listener.
//!
//! The client hello is read before any certificate is chosen; its SNI (or the
//! CONNECT host when SNI is absent) selects the leaf issued by the CA.

use crate::ca::CertificateAuthority;
use crate::duplex::VirtualListener;
use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::server::{serve_connection, ConnectionContext};
use crate::tls;
use crate::tunnel::TunnelOrigin;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::LazyConfigAcceptor;

/// Authority that decrypted requests are sent to. The CONNECT port survives
/// even when the SNI names a different host.
fn secure_authority(sni: Option<&str>, origin: Option<&TunnelOrigin>, hostname: &str) -> String {
  match origin {
    Some(origin) if sni.map_or(true, |s| s == origin.authority.host()) => {
      origin.authority.to_string()
    }
    Some(origin) => match origin.authority.port_u16() {
      Some(port) => format!("{}:{}", hostname, port),
      None => hostname.to_string(),
    },
    None => hostname.to_string(),
  }
}

/// Terminates TLS for intercepted tunnels
#[derive(Clone)]
pub struct TlsInterceptor {
  ca: Arc<CertificateAuthority>,
  handler: Arc<RequestHandler>,
}

impl TlsInterceptor {
  /// An interceptor presenting leaves from `ca`
  pub fn new(ca: Arc<CertificateAuthority>, handler: Arc<RequestHandler>) -> Self {
    Self { ca, handler }
  }

  /// Handshake with the client on `stream`, then serve the decrypted requests.
  pub async fn accept<S>(&self, stream: S, origin: Option<TunnelOrigin>) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
      .await
      .map_err(|e| Error::tls_error(format!("reading client hello failed: {}", e)))?;
    let sni = start.client_hello().server_name().map(str::to_string);
    let hostname = match (&sni, &origin) {
      (Some(sni), _) => sni.clone(),
      (None, Some(origin)) => origin.authority.host().to_string(),
      (None, None) => {
        return Err(Error::tls_error(
          "client sent no SNI and no CONNECT host is known",
        ))
      }
    };

    let leaf = self.ca.leaf_certificate(&hostname).await.map_err(|e| {
      tracing::error!("[TLS] no certificate for {}, aborting handshake: {}", hostname, e);
      e
    })?;
    let config = Arc::new(tls::server_config(&leaf)?);
    let stream = start.into_stream(config).await.map_err(|e| {
      Error::tls_error(format!("handshake for {} failed: {}", hostname, e))
    })?;
    tracing::debug!("[TLS] intercepting {}", hostname);

    let ctx = ConnectionContext {
      secure_authority: Some(secure_authority(sni.as_deref(), origin.as_ref(), &hostname)),
      client_addr: origin.and_then(|o| o.client_addr),
    };
    serve_connection(stream, ctx, self.handler.clone(), None).await
  }

  fn spawn_accept<S>(&self, stream: S, origin: Option<TunnelOrigin>, peer: String)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let this = self.clone();
    tokio::spawn(async move {
      if let Err(e) = this.accept(stream, origin).await {
        e.log(&format!("[TLS] intercepted connection {} ended:", peer));
      }
    });
  }

  /// Serve tunnels handed over in process by the dispatcher
  pub async fn run_virtual(&self, mut listener: VirtualListener<TunnelOrigin>) {
    while let Some((socket, origin)) = listener.accept().await {
      let peer = origin.authority.to_string();
      self.spawn_accept(socket, Some(origin), peer);
    }
    tracing::debug!("[TLS] in-process listener stopped");
  }

  /// Serve TLS clients on a real loopback port
  pub async fn run_loopback(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
      let accepted: std::io::Result<(tokio::net::TcpStream, SocketAddr)> = tokio::select! {
        accepted = listener.accept() => accepted,
        _ = shutdown.changed() => break,
      };
      match accepted {
        Ok((stream, peer_addr)) => self.spawn_accept(stream, None, peer_addr.to_string()),
        Err(e) => tracing::error!("[TLS] Failed to accept connection: {}", e),
      }
    }
    tracing::debug!("[TLS] loopback listener stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::uri::Authority;

  fn origin(authority: &'static str) -> TunnelOrigin {
    TunnelOrigin {
      client_addr: None,
      authority: Authority::from_static(authority),
    }
  }

  #[test]
  fn sni_matching_connect_keeps_connect_authority() {
    let origin = origin("example.com:8443");
    assert_eq!(
      secure_authority(Some("example.com"), Some(&origin), "example.com"),
      "example.com:8443"
    );
    assert_eq!(secure_authority(None, Some(&origin), "example.com"), "example.com:8443");
  }

  #[test]
  fn differing_sni_keeps_connect_port() {
    let origin = origin("10.0.0.5:8443");
    assert_eq!(
      secure_authority(Some("api.example.com"), Some(&origin), "api.example.com"),
      "api.example.com:8443"
    );
  }

  #[test]
  fn loopback_clients_use_sni_alone() {
    assert_eq!(secure_authority(Some("example.com"), None, "example.com"), "example.com");
  }
}
