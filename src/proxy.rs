//! Proxy configuration and lifecycle

use crate::ca::{CertificateAuthority, DEFAULT_CACHE_CAPACITY};
use crate::client::UpstreamClient;
use crate::connector::{Connector, ConnectorBuilder};
use crate::duplex;
use crate::error::{Error, Result};
use crate::handler::RequestHandler;
use crate::modifier::{Modifier, ModifierChain};
use crate::record::Observer;
use crate::server::run_plain_listener;
use crate::tls::Certificate;
use crate::tls_server::TlsInterceptor;
use crate::tunnel::{TunnelDispatcher, TunnelOrigin, TunnelRegistry};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Port of the plain listener unless configured otherwise
pub const DEFAULT_PORT: u16 = 7888;
const ENV_PREFIX: &str = "MITM_RELAY_";

/// Configuration for the proxy
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// Address of the plain HTTP/CONNECT listener
  pub listen: SocketAddr,
  /// Directory holding the root and leaf certificates
  pub data_dir: PathBuf,
  /// Decrypt every CONNECT tunnel, not only those a modifier asks for
  pub intercept_https: bool,
  /// Deadline for connecting to the upstream and receiving its response head
  pub upstream_timeout: Duration,
  /// Deadline for opening a tunnel's far side
  pub connect_timeout: Duration,
  /// Tunnels without traffic for this long are closed
  pub tunnel_idle_timeout: Duration,
  /// Number of leaf certificates kept in memory
  pub cache_capacity: u64,
  /// Keep copies of request/response bodies on records
  pub capture_bodies: bool,
  /// Also expose the interception listener on this loopback port
  pub tls_loopback_port: Option<u16>,
  /// PEM bundle trusted for upstream HTTPS in addition to the platform roots
  pub extra_ca_certs: Option<PathBuf>,
  /// Per-direction buffer of in-process tunnel sockets
  pub duplex_capacity: usize,
}

fn default_data_dir() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_default()
    .join(".mitm-relay")
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
      data_dir: default_data_dir(),
      intercept_https: false,
      upstream_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(10),
      tunnel_idle_timeout: Duration::from_secs(30),
      cache_capacity: DEFAULT_CACHE_CAPACITY,
      capture_bodies: true,
      tls_loopback_port: None,
      extra_ca_certs: None,
      duplex_capacity: duplex::DEFAULT_CAPACITY,
    }
  }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(Error::config(format!("{}{} must be a boolean, got {:?}", ENV_PREFIX, name, value))),
  }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T> {
  value
    .trim()
    .parse()
    .map_err(|_| Error::config(format!("{}{} has an invalid value {:?}", ENV_PREFIX, name, value)))
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
  let ms: u64 = parse_value(name, value)?;
  if ms == 0 {
    return Err(Error::config(format!("{}{} must be positive", ENV_PREFIX, name)));
  }
  Ok(Duration::from_millis(ms))
}

impl MitmConfig {
  /// Defaults overridden by `MITM_RELAY_*` environment variables
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Defaults overridden by whatever `lookup` returns for each `MITM_RELAY_*` key
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());
    let mut config = Self::default();
    if let Some(v) = get("LISTEN") {
      config.listen = parse_value("LISTEN", &v)?;
    }
    if let Some(v) = get("DATA_DIR") {
      config.data_dir = PathBuf::from(v);
    }
    if let Some(v) = get("INTERCEPT") {
      config.intercept_https = parse_bool("INTERCEPT", &v)?;
    }
    if let Some(v) = get("UPSTREAM_TIMEOUT_MS") {
      config.upstream_timeout = parse_millis("UPSTREAM_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("CONNECT_TIMEOUT_MS") {
      config.connect_timeout = parse_millis("CONNECT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("TUNNEL_IDLE_TIMEOUT_MS") {
      config.tunnel_idle_timeout = parse_millis("TUNNEL_IDLE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("CACHE_CAPACITY") {
      config.cache_capacity = parse_value("CACHE_CAPACITY", &v)?;
      if config.cache_capacity == 0 {
        return Err(Error::config(format!("{}CACHE_CAPACITY must be positive", ENV_PREFIX)));
      }
    }
    if let Some(v) = get("CAPTURE_BODIES") {
      config.capture_bodies = parse_bool("CAPTURE_BODIES", &v)?;
    }
    if let Some(v) = get("TLS_LOOPBACK_PORT") {
      config.tls_loopback_port = Some(parse_value("TLS_LOOPBACK_PORT", &v)?);
    }
    if let Some(v) = get("EXTRA_CA_CERTS") {
      config.extra_ca_certs = Some(PathBuf::from(v));
    }
    Ok(config)
  }
}

/// MITM Proxy main struct
pub struct MitmProxy {
  config: MitmConfig,
  ca: Arc<CertificateAuthority>,
  modifiers: Arc<ModifierChain>,
  handler: Arc<RequestHandler>,
  connector: Connector,
}

impl MitmProxy {
  /// Create a proxy: loads or generates the root and builds the upstream connector.
  pub async fn new(config: MitmConfig) -> Result<Self> {
    let ca = Arc::new(CertificateAuthority::with_capacity(
      &config.data_dir,
      config.cache_capacity,
    ));
    ca.initialize_root().await?;

    let mut builder = ConnectorBuilder::default().connect_timeout(Some(config.connect_timeout));
    if let Some(path) = &config.extra_ca_certs {
      let extra = Certificate::from_pem_file(path).await?;
      tracing::info!("[TLS] trusting {} extra upstream CA certificates", extra.len());
      builder = builder.certificate(extra);
    }
    let connector = builder.build()?;

    let modifiers = Arc::new(ModifierChain::new(config.intercept_https));
    let handler = Arc::new(RequestHandler::new(
      modifiers.clone(),
      UpstreamClient::new(connector.clone()),
      config.upstream_timeout,
      config.capture_bodies,
    ));
    Ok(Self {
      config,
      ca,
      modifiers,
      handler,
      connector,
    })
  }

  /// Register a modifier. Returns false if it is already registered.
  pub fn add_modifier(&self, modifier: Arc<dyn Modifier>) -> bool {
    self.modifiers.add(modifier)
  }

  /// Unregister a modifier by identity. Returns whether it was registered.
  pub fn remove_modifier(&self, modifier: &Arc<dyn Modifier>) -> bool {
    self.modifiers.remove(modifier)
  }

  /// Register an observer of completed requests
  pub fn add_observer(&self, observer: Arc<dyn Observer>) {
    self.handler.add_observer(observer);
  }

  /// The certificate authority; its root must be trusted by clients
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Active configuration
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// Bind the listeners and start serving.
  pub async fn start(&self) -> Result<ProxyHandle> {
    let listener = TcpListener::bind(self.config.listen)
      .await
      .map_err(|source| Error::Bind {
        addr: self.config.listen.to_string(),
        source,
      })?;
    let local_addr = listener.local_addr()?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let interceptor = TlsInterceptor::new(self.ca.clone(), self.handler.clone());
    let mut tasks = Vec::new();

    let tls_loopback_addr = match self.config.tls_loopback_port {
      Some(port) => {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let tls_listener = TcpListener::bind(addr)
          .await
          .map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
          })?;
        let bound = tls_listener.local_addr()?;
        let interceptor = interceptor.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
          interceptor.run_loopback(tls_listener, rx).await
        }));
        tracing::info!("[TLS] interception listener on {}", bound);
        Some(bound)
      }
      None => None,
    };

    let (virtual_connector, virtual_listener) =
      duplex::listener::<TunnelOrigin>(self.config.duplex_capacity);
    tasks.push(tokio::spawn(async move {
      interceptor.run_virtual(virtual_listener).await
    }));

    let registry = TunnelRegistry::default();
    let dispatcher = TunnelDispatcher::new(
      self.modifiers.clone(),
      self.connector.clone(),
      virtual_connector,
      registry.clone(),
      self.config.connect_timeout,
      self.config.tunnel_idle_timeout,
    );
    tasks.push(tokio::spawn(run_plain_listener(
      listener,
      self.handler.clone(),
      dispatcher,
      shutdown_rx,
    )));
    tracing::info!(
      "[MITM] listening on {} (intercept all https: {})",
      local_addr,
      self.config.intercept_https
    );
    Ok(ProxyHandle {
      local_addr,
      tls_loopback_addr,
      shutdown,
      registry,
      tasks,
    })
  }
}

/// A running proxy
pub struct ProxyHandle {
  local_addr: SocketAddr,
  tls_loopback_addr: Option<SocketAddr>,
  shutdown: watch::Sender<bool>,
  registry: TunnelRegistry,
  tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
  /// Bound address of the plain listener
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Bound address of the loopback interception listener, if enabled
  pub fn tls_loopback_addr(&self) -> Option<SocketAddr> {
    self.tls_loopback_addr
  }

  /// Number of CONNECT tunnels currently open
  pub fn open_tunnels(&self) -> usize {
    self.registry.len()
  }

  /// Stop accepting and forcibly close every open tunnel
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    let closed = self.registry.shutdown_all();
    for task in &self.tasks {
      task.abort();
    }
    for task in self.tasks {
      let _ = task.await;
    }
    tracing::info!("[MITM] proxy stopped, {} tunnels closed", closed);
  }
}
