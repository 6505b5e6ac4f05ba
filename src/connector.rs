use crate::error::{new_io_error, Error, Result};
use crate::socket::Socket;
use crate::tls::{crypto_provider, Certificate};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  native_roots: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      native_roots: true,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Trust the platform certificate store for upstream TLS.
  ///
  /// Defaults to `true`.
  pub fn native_roots(mut self, value: bool) -> ConnectorBuilder {
    self.native_roots = value;
    self
  }
  /// Adds certificates to the set of roots that upstream TLS will trust.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate.extend(value);
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if self.native_roots {
      let native = rustls_native_certs::load_native_certs();
      for error in &native.errors {
        tracing::debug!("[TLS] skipping native certificate source: {}", error);
      }
      let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
      tracing::debug!(
        "[TLS] loaded {} native trust anchors ({} ignored)",
        added,
        ignored
      );
    }
    for cert in self.certificate.clone() {
      cert.add_to_tls(&mut root_cert_store)?;
    }
    if root_cert_store.is_empty() {
      tracing::warn!("[TLS] no trust anchors available, upstream TLS will fail verification");
    }
    let tls = rustls::ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
      .with_root_certificates(root_cert_store)
      .with_no_client_auth();
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
}

/// Opens upstream TCP connections and upgrades them to TLS
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl Connector {
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    socket.set_nodelay(true)?;
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| {
          new_io_error(
            std::io::ErrorKind::TimedOut,
            &format!("connect to {} timed out", addr),
          )
        })??,
    };
    Ok(Socket::new(s, addr))
  }

  /// Resolve `host` and connect to the first address that accepts
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
      Error::connection_error(format!("cannot resolve {}: {}", host, e))
    })?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| {
      Error::connection_error(format!("no addresses found for {}", host))
    }))
  }

  /// Perform a verified TLS handshake with `domain` over `stream`
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", domain, e)))?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await?;
    Ok(tls)
  }
}
