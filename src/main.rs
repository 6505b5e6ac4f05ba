use mitm_relay::{CertificateAuthority, LogObserver, MitmConfig, MitmProxy, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

async fn run() -> Result<()> {
  let config = MitmConfig::from_env()?;

  if std::env::var("MITM_RELAY_GEN_ROOT").is_ok_and(|v| v == "1") {
    let ca = CertificateAuthority::with_capacity(&config.data_dir, config.cache_capacity);
    ca.initialize_root().await?;
    println!("{}", ca.root_cert_path().display());
    return Ok(());
  }

  let proxy = MitmProxy::new(config).await?;
  proxy.add_observer(Arc::new(LogObserver));
  tracing::info!(
    "[MITM] root certificate: {}",
    proxy.ca().root_cert_path().display()
  );
  let handle = proxy.start().await?;

  tokio::signal::ctrl_c().await?;
  tracing::info!("[MITM] shutting down");
  handle.shutdown().await;
  Ok(())
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  if let Err(e) = run().await {
    tracing::error!("[MITM] fatal: {}", e);
    std::process::exit(1);
  }
}
