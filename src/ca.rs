//! Certificate Authority (CA) management for the relay
//!
//! A self-signed root is loaded from (or created in) the data directory the first
//! time it is needed. Leaf certificates are minted per hostname, mirrored to disk
//! and kept in a bounded in-memory LRU cache. Concurrent requests for the same
//! hostname are coalesced so that a leaf is only ever signed once.
//!
//! Disk layout:
//!
//! ```text
//! <data dir>/root.pem          root certificate
//! <data dir>/root.public.key   root public key
//! <data dir>/root.private.key  root private key
//! <data dir>/{hostname}.pem    leaf certificate
//! <data dir>/{hostname}.key    leaf private key
//! ```

use crate::error::{Error, Result};
use crate::single_flight::SingleFlight;
use crate::tls::crypto_provider;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_rustls::rustls::client::danger::ServerCertVerifier;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::RootCertStore;

const ROOT_CERT_FILE: &str = "root.pem";
const ROOT_PUBLIC_KEY_FILE: &str = "root.public.key";
const ROOT_PRIVATE_KEY_FILE: &str = "root.private.key";
/// Root validity (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity (2 years)
const LEAF_VALIDITY_DAYS: i64 = 730;
/// Backdating of not_before to tolerate clock skew
const NOT_BEFORE_SKEW_DAYS: i64 = 1;
const SERIAL_LEN: usize = 16;
const MAX_HOSTNAME_LEN: usize = 253;
/// Default number of leaf certificates held in memory
pub const DEFAULT_CACHE_CAPACITY: u64 = 100;

/// The self-signed root every leaf is issued from
pub struct RootCertificate {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  public_key_pem: String,
  verifier: Arc<WebPkiServerVerifier>,
}

impl RootCertificate {
  fn from_pem(cert_pem: String, public_key_pem: String, private_key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(private_key_pem)
      .map_err(|e| Error::root_material(format!("unreadable {}: {}", ROOT_PRIVATE_KEY_FILE, e)))?;
    if key_pair.public_key_pem().trim() != public_key_pem.trim() {
      return Err(Error::root_material(format!(
        "{} does not belong to {}",
        ROOT_PUBLIC_KEY_FILE, ROOT_PRIVATE_KEY_FILE
      )));
    }

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::root_material(format!("no certificate found in {}", ROOT_CERT_FILE)))?
      .map_err(|e| Error::root_material(format!("unreadable {}: {}", ROOT_CERT_FILE, e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::root_material(format!("{} is not a usable CA: {}", ROOT_CERT_FILE, e)))?;

    let mut roots = RootCertStore::empty();
    roots
      .add(cert_der.clone())
      .map_err(|e| Error::root_material(format!("{} is not a trust anchor: {}", ROOT_CERT_FILE, e)))?;
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
      .build()
      .map_err(|e| Error::root_material(format!("cannot build verifier: {}", e)))?;

    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
      public_key_pem,
      verifier,
    })
  }

  /// Root certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Root certificate in PEM format, for installation into client trust stores
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Root public key in PEM format
  pub fn public_key_pem(&self) -> &str {
    &self.public_key_pem
  }

  /// Check that `leaf` chains to this root and is valid for `hostname` right now
  pub fn verify_leaf(&self, hostname: &str, leaf: &CertificateDer<'_>) -> Result<()> {
    let server_name = ServerName::try_from(hostname.to_string())
      .map_err(|e| Error::CertificateError(format!("invalid server name {}: {}", hostname, e)))?;
    self
      .verifier
      .verify_server_cert(leaf, &[], &server_name, &[], UnixTime::now())
      .map(|_| ())
      .map_err(|e| Error::CertificateError(e.to_string()))
  }
}

/// A certificate/key pair issued for exactly one hostname
#[derive(Debug)]
pub struct LeafCertificate {
  hostname: String,
  cert_pem: String,
  key_pem: String,
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
  root_der: CertificateDer<'static>,
}

impl Clone for LeafCertificate {
  fn clone(&self) -> Self {
    Self {
      hostname: self.hostname.clone(),
      cert_pem: self.cert_pem.clone(),
      key_pem: self.key_pem.clone(),
      cert_der: self.cert_der.clone(),
      key_der: self.key_der.clone_key(),
      root_der: self.root_der.clone(),
    }
  }
}

impl LeafCertificate {
  fn from_pem(
    hostname: &str,
    cert_pem: String,
    key_pem: String,
    root: &RootCertificate,
  ) -> Result<Self> {
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::CertificateError(format!("no certificate for {}", hostname)))?
      .map_err(|e| Error::CertificateError(format!("unreadable certificate for {}: {}", hostname, e)))?;
    let key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
      .map_err(|e| Error::CertificateError(format!("unreadable key for {}: {}", hostname, e)))?
      .ok_or_else(|| Error::CertificateError(format!("no private key for {}", hostname)))?;
    Ok(Self {
      hostname: hostname.to_string(),
      cert_pem,
      key_pem,
      cert_der,
      key_der,
      root_der: root.cert_der.clone(),
    })
  }

  /// Hostname this certificate was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Leaf certificate in PEM format
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Leaf private key in PEM format
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  /// Leaf certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Chain presented to clients: `[leaf, root]`
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    vec![self.cert_der.clone(), self.root_der.clone()]
  }

  /// Leaf private key
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }
}

/// Counters describing how leaf requests were satisfied
#[derive(Debug, Default)]
pub struct CaStats {
  issued: AtomicU64,
  loaded: AtomicU64,
  cache_hits: AtomicU64,
}

impl CaStats {
  /// Leaves freshly signed by this process
  pub fn issued(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// Leaves reloaded from disk
  pub fn loaded(&self) -> u64 {
    self.loaded.load(Ordering::Relaxed)
  }

  /// Requests answered from the in-memory cache
  pub fn cache_hits(&self) -> u64 {
    self.cache_hits.load(Ordering::Relaxed)
  }
}

type LeafOutcome = std::result::Result<Arc<LeafCertificate>, Arc<Error>>;

/// Certificate Authority issuing per-host leaf certificates
pub struct CertificateAuthority {
  storage_path: PathBuf,
  root: OnceCell<Arc<RootCertificate>>,
  cache: Cache<String, Arc<LeafCertificate>>,
  pending: SingleFlight<String, LeafOutcome>,
  stats: Arc<CaStats>,
}

impl CertificateAuthority {
  /// Create a CA rooted at `storage_path` with the default cache capacity.
  ///
  /// Nothing is touched on disk until the root is first needed.
  pub fn new(storage_path: impl AsRef<Path>) -> Self {
    Self::with_capacity(storage_path, DEFAULT_CACHE_CAPACITY)
  }

  /// Create a CA whose leaf cache holds at most `capacity` entries
  pub fn with_capacity(storage_path: impl AsRef<Path>, capacity: u64) -> Self {
    let cache = Cache::builder()
      .max_capacity(capacity)
      .eviction_policy(EvictionPolicy::lru())
      .build();
    Self {
      storage_path: storage_path.as_ref().to_path_buf(),
      root: OnceCell::new(),
      cache,
      pending: SingleFlight::new(),
      stats: Arc::new(CaStats::default()),
    }
  }

  /// Load the root from disk, or generate and persist one if none exists.
  ///
  /// Runs at most once per CA; later calls return the same root. A data
  /// directory holding only some of the three root files is rejected rather
  /// than overwritten.
  pub async fn initialize_root(&self) -> Result<Arc<RootCertificate>> {
    self
      .root
      .get_or_try_init(|| load_or_generate_root(&self.storage_path))
      .await
      .cloned()
  }

  /// Certificate/key pair for `hostname`.
  ///
  /// Resolution order: memory cache, then (coalesced per hostname) the
  /// persisted files, then a freshly signed leaf which is written to disk.
  pub async fn leaf_certificate(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let hostname = normalize_hostname(hostname)?;
    if let Some(leaf) = self.cache.get(&hostname).await {
      self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
      return Ok(leaf);
    }

    let resolver = LeafResolver {
      storage_path: self.storage_path.clone(),
      root: self.initialize_root().await?,
      cache: self.cache.clone(),
      stats: Arc::clone(&self.stats),
    };
    let key = hostname.clone();
    self
      .pending
      .run(key, move || async move {
        resolver.resolve(hostname).await.map_err(Arc::new)
      })
      .await
      .map_err(|e| Arc::try_unwrap(e).unwrap_or_else(Error::Shared))
  }

  /// Root certificate in PEM format, for client installation
  pub async fn root_cert_pem(&self) -> Result<String> {
    Ok(self.initialize_root().await?.cert_pem().to_string())
  }

  /// Path of the root certificate file
  pub fn root_cert_path(&self) -> PathBuf {
    self.storage_path.join(ROOT_CERT_FILE)
  }

  /// Directory holding root and leaf material
  pub fn storage_path(&self) -> &Path {
    &self.storage_path
  }

  /// Issuance counters
  pub fn stats(&self) -> &CaStats {
    &self.stats
  }

  /// Leaves currently coalesced in flight
  pub fn pending_issuances(&self) -> usize {
    self.pending.in_flight()
  }
}

struct LeafResolver {
  storage_path: PathBuf,
  root: Arc<RootCertificate>,
  cache: Cache<String, Arc<LeafCertificate>>,
  stats: Arc<CaStats>,
}

impl LeafResolver {
  async fn resolve(self, hostname: String) -> Result<Arc<LeafCertificate>> {
    // a flight for this host may have landed between our cache miss and now
    if let Some(leaf) = self.cache.get(&hostname).await {
      return Ok(leaf);
    }
    let leaf = match self.load(&hostname).await? {
      Some(leaf) => {
        self.stats.loaded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("[CA] Loaded leaf certificate for {} from disk", hostname);
        leaf
      }
      None => {
        let leaf = self.issue(&hostname).await?;
        self.stats.issued.fetch_add(1, Ordering::Relaxed);
        tracing::info!("[CA] Issued leaf certificate for {}", hostname);
        leaf
      }
    };
    let leaf = Arc::new(leaf);
    self.cache.insert(hostname, Arc::clone(&leaf)).await;
    Ok(leaf)
  }

  fn paths(&self, hostname: &str) -> (PathBuf, PathBuf) {
    (
      self.storage_path.join(format!("{}.pem", hostname)),
      self.storage_path.join(format!("{}.key", hostname)),
    )
  }

  async fn load(&self, hostname: &str) -> Result<Option<LeafCertificate>> {
    let (cert_path, key_path) = self.paths(hostname);
    let (Some(cert_pem), Some(key_pem)) = (read_optional(&cert_path).await?, read_optional(&key_path).await?)
    else {
      return Ok(None);
    };
    let leaf = match LeafCertificate::from_pem(hostname, cert_pem, key_pem, &self.root) {
      Ok(leaf) => leaf,
      Err(e) => {
        tracing::warn!("[CA] Discarding stored leaf for {}: {}", hostname, e);
        return Ok(None);
      }
    };
    if let Err(e) = self.root.verify_leaf(hostname, leaf.cert_der()) {
      tracing::warn!("[CA] Stored leaf for {} no longer verifies, reissuing: {}", hostname, e);
      return Ok(None);
    }
    Ok(Some(leaf))
  }

  async fn issue(&self, hostname: &str) -> Result<LeafCertificate> {
    let root = Arc::clone(&self.root);
    let host = hostname.to_string();
    let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || sign_leaf(&root, &host))
      .await
      .map_err(|e| Error::other(format!("leaf signing task failed: {}", e)))??;

    let (cert_path, key_path) = self.paths(hostname);
    fs::write(&key_path, key_pem.as_bytes())
      .await
      .map_err(|e| fs_error(&key_path, e))?;
    fs::write(&cert_path, cert_pem.as_bytes())
      .await
      .map_err(|e| fs_error(&cert_path, e))?;
    LeafCertificate::from_pem(hostname, cert_pem, key_pem, &self.root)
  }
}

async fn load_or_generate_root(dir: &Path) -> Result<Arc<RootCertificate>> {
  fs::create_dir_all(dir).await.map_err(|e| fs_error(dir, e))?;
  let cert_path = dir.join(ROOT_CERT_FILE);
  let public_path = dir.join(ROOT_PUBLIC_KEY_FILE);
  let private_path = dir.join(ROOT_PRIVATE_KEY_FILE);

  let found = (
    read_optional(&cert_path).await?,
    read_optional(&public_path).await?,
    read_optional(&private_path).await?,
  );
  let root = match found {
    (Some(cert_pem), Some(public_pem), Some(private_pem)) => {
      let root = RootCertificate::from_pem(cert_pem, public_pem, &private_pem)?;
      tracing::info!("[CA] Loaded root certificate from {}", cert_path.display());
      root
    }
    (None, None, None) => {
      let (cert_pem, public_pem, private_pem) = tokio::task::spawn_blocking(generate_root)
        .await
        .map_err(|e| Error::other(format!("root generation task failed: {}", e)))??;
      // never clobber a root that appeared in the meantime
      write_new(&private_path, &private_pem).await?;
      write_new(&public_path, &public_pem).await?;
      write_new(&cert_path, &cert_pem).await?;
      let root = RootCertificate::from_pem(cert_pem, public_pem, &private_pem)?;
      tracing::info!(
        "[CA] Generated new root certificate at {}; add it to your trust store",
        cert_path.display()
      );
      root
    }
    (cert, public, private) => {
      let present = [cert.is_some(), public.is_some(), private.is_some()]
        .iter()
        .filter(|p| **p)
        .count();
      return Err(Error::root_material(format!(
        "found {} of 3 root files in {}; restore or remove {}, {} and {}",
        present,
        dir.display(),
        ROOT_CERT_FILE,
        ROOT_PUBLIC_KEY_FILE,
        ROOT_PRIVATE_KEY_FILE
      )));
    }
  };
  Ok(Arc::new(root))
}

fn generate_root() -> Result<(String, String, String)> {
  let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
    .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

  let mut params = CertificateParams::default();
  params.serial_number = Some(random_serial());
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "mitm-relay Root CA");
  dn.push(DnType::OrganizationName, "mitm-relay");
  dn.push(DnType::OrganizationalUnitName, "Local interception");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![
    KeyUsagePurpose::KeyCertSign,
    KeyUsagePurpose::CrlSign,
    KeyUsagePurpose::DigitalSignature,
  ];
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::days(NOT_BEFORE_SKEW_DAYS);
  params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;
  Ok((cert.pem(), key_pair.public_key_pem(), key_pair.serialize_pem()))
}

fn sign_leaf(root: &RootCertificate, hostname: &str) -> Result<(String, String)> {
  let mut params = CertificateParams::default();
  params.serial_number = Some(random_serial());
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, hostname);
  params.distinguished_name = dn;
  params.subject_alt_names = vec![subject_alt_name(hostname)?];
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
  params.use_authority_key_identifier_extension = true;
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::days(NOT_BEFORE_SKEW_DAYS);
  params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

  let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
    .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
  let cert = params
    .signed_by(&key_pair, &root.issuer)
    .map_err(|e| Error::certificate_error(format!("Failed to sign leaf for {}: {}", hostname, e)))?;
  Ok((cert.pem(), key_pair.serialize_pem()))
}

fn random_serial() -> SerialNumber {
  SerialNumber::from(random_serial_bytes().to_vec())
}

/// 16 random bytes with the top bit cleared so the DER integer stays positive.
fn random_serial_bytes() -> [u8; SERIAL_LEN] {
  let mut bytes = [0u8; SERIAL_LEN];
  rand::thread_rng().fill_bytes(&mut bytes);
  bytes[0] &= 0x7f;
  bytes
}

/// IP-typed SAN for address literals, DNS-typed otherwise.
pub(crate) fn subject_alt_name(hostname: &str) -> Result<SanType> {
  if let Ok(ip) = hostname.parse::<IpAddr>() {
    return Ok(SanType::IpAddress(ip));
  }
  if hostname.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
    return Err(Error::certificate_error(format!(
      "{} looks numeric but is not an IP address",
      hostname
    )));
  }
  let dns_name = hostname
    .try_into()
    .map_err(|_| Error::certificate_error(format!("Invalid domain name: {}", hostname)))?;
  Ok(SanType::DnsName(dns_name))
}

/// Canonical cache/file key for a hostname. Anything that could escape the
/// data directory is refused.
pub(crate) fn normalize_hostname(hostname: &str) -> Result<String> {
  let host = hostname
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(hostname)
    .trim_end_matches('.')
    .to_ascii_lowercase();
  let valid = !host.is_empty()
    && host.len() <= MAX_HOSTNAME_LEN
    && !host.starts_with('.')
    && !host.contains("..")
    && host
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':'));
  // leaf files would shadow the root material
  let reserved = matches!(host.as_str(), "root" | "root.public" | "root.private");
  if !valid || reserved {
    return Err(Error::certificate_error(format!(
      "refusing to issue for hostname {:?}",
      hostname
    )));
  }
  Ok(host)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
  match fs::read_to_string(path).await {
    Ok(contents) => Ok(Some(contents)),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(fs_error(path, e)),
  }
}

async fn write_new(path: &Path, contents: &str) -> Result<()> {
  let mut file = fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(path)
    .await
    .map_err(|e| {
      if e.kind() == io::ErrorKind::AlreadyExists {
        Error::root_material(format!("{} appeared while generating the root", path.display()))
      } else {
        fs_error(path, e)
      }
    })?;
  file
    .write_all(contents.as_bytes())
    .await
    .map_err(|e| fs_error(path, e))?;
  file.flush().await.map_err(|e| fs_error(path, e))?;
  Ok(())
}

fn fs_error(path: &Path, e: io::Error) -> Error {
  let error = Error::Io(io::Error::new(e.kind(), format!("{}: {}", path.display(), e)));
  tracing::error!("[CA] {}", error);
  error
}

#[cfg(test)]
mod tests {
  use super::*;
  use x509_parser::extensions::GeneralName;
  use x509_parser::parse_x509_certificate;

  fn san_names(der: &[u8]) -> Vec<String> {
    let (_, cert) = parse_x509_certificate(der).expect("parse x509");
    let san = cert
      .subject_alternative_name()
      .expect("valid extensions")
      .expect("SAN present");
    san
      .value
      .general_names
      .iter()
      .map(|name| match name {
        GeneralName::DNSName(dns) => format!("dns:{}", dns),
        GeneralName::IPAddress(ip) => format!("ip:{:?}", ip),
        other => format!("other:{:?}", other),
      })
      .collect()
  }

  #[tokio::test]
  async fn root_is_generated_once_and_reloaded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = CertificateAuthority::new(dir.path());
    let root = first.initialize_root().await.expect("root generated");
    let again = first.initialize_root().await.expect("root cached");
    assert!(Arc::ptr_eq(&root, &again), "root is initialized once per CA");
    for file in [ROOT_CERT_FILE, ROOT_PUBLIC_KEY_FILE, ROOT_PRIVATE_KEY_FILE] {
      assert!(dir.path().join(file).exists(), "{} persisted", file);
    }

    let restarted = CertificateAuthority::new(dir.path());
    let reloaded = restarted.initialize_root().await.expect("root reloaded");
    assert_eq!(root.cert_der(), reloaded.cert_der(), "restart keeps the same root");

    let (_, cert) = parse_x509_certificate(root.cert_der()).expect("parse root");
    assert!(cert.is_ca());
    let validity = cert.validity().time_to_expiration().expect("not expired");
    assert!(validity.whole_days() > 3600);
  }

  #[tokio::test]
  async fn partial_root_material_fails_loudly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca = CertificateAuthority::new(dir.path());
    let root_pem = ca.root_cert_pem().await.expect("root");
    std::fs::remove_file(dir.path().join(ROOT_PRIVATE_KEY_FILE)).expect("remove key");

    let broken = CertificateAuthority::new(dir.path());
    let err = broken
      .initialize_root()
      .await
      .err()
      .expect("partial root must not be regenerated");
    assert!(matches!(err, Error::RootMaterial(_)), "got {:?}", err);
    let on_disk = std::fs::read_to_string(dir.path().join(ROOT_CERT_FILE)).expect("cert kept");
    assert_eq!(on_disk, root_pem, "existing root file is left untouched");
  }

  #[tokio::test]
  async fn concurrent_requests_sign_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca = Arc::new(CertificateAuthority::new(dir.path()));
    ca.initialize_root().await.expect("root");

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let ca = Arc::clone(&ca);
        tokio::spawn(async move { ca.leaf_certificate("example.com").await })
      })
      .collect();
    let mut ders = Vec::new();
    for handle in handles {
      let leaf = handle.await.expect("join").expect("leaf");
      ders.push(leaf.cert_der().to_vec());
    }

    assert_eq!(ca.stats().issued(), 1, "exactly one signing operation");
    assert!(ders.windows(2).all(|w| w[0] == w[1]), "bit-identical certificates");
    assert_eq!(ca.pending_issuances(), 0);
  }

  #[tokio::test]
  async fn persisted_leaf_survives_restart_and_verifies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = CertificateAuthority::new(dir.path());
    let issued = first.leaf_certificate("Example.COM").await.expect("leaf");
    assert_eq!(issued.hostname(), "example.com");
    assert!(dir.path().join("example.com.pem").exists());
    assert!(dir.path().join("example.com.key").exists());

    let restarted = CertificateAuthority::new(dir.path());
    let loaded = restarted.leaf_certificate("example.com").await.expect("leaf");
    assert_eq!(restarted.stats().issued(), 0);
    assert_eq!(restarted.stats().loaded(), 1);
    assert_eq!(loaded.cert_der(), issued.cert_der());

    let root = restarted.initialize_root().await.expect("root");
    root
      .verify_leaf("example.com", loaded.cert_der())
      .expect("leaf chains to the current root");
    assert!(root.verify_leaf("other.example", loaded.cert_der()).is_err());

    let chain = loaded.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(&chain[1], root.cert_der());
  }

  #[tokio::test]
  async fn leaf_from_foreign_root_is_reissued() {
    let foreign = tempfile::tempdir().expect("tempdir");
    let other = CertificateAuthority::new(foreign.path());
    other.leaf_certificate("example.com").await.expect("leaf");

    let dir = tempfile::tempdir().expect("tempdir");
    for file in ["example.com.pem", "example.com.key"] {
      std::fs::copy(foreign.path().join(file), dir.path().join(file)).expect("copy");
    }
    let ca = CertificateAuthority::new(dir.path());
    let leaf = ca.leaf_certificate("example.com").await.expect("leaf");
    assert_eq!(ca.stats().loaded(), 0);
    assert_eq!(ca.stats().issued(), 1);
    let root = ca.initialize_root().await.expect("root");
    root
      .verify_leaf("example.com", leaf.cert_der())
      .expect("reissued under the local root");
  }

  #[tokio::test]
  async fn dotted_numeric_hosts_get_ip_san() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca = CertificateAuthority::new(dir.path());
    let ip_leaf = ca.leaf_certificate("127.0.0.1").await.expect("ip leaf");
    let names = san_names(ip_leaf.cert_der());
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("ip:"), "expected IP SAN, got {:?}", names);

    let dns_leaf = ca.leaf_certificate("example.com").await.expect("dns leaf");
    assert_eq!(san_names(dns_leaf.cert_der()), vec!["dns:example.com".to_string()]);
  }

  #[tokio::test]
  async fn eviction_only_drops_memory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ca = CertificateAuthority::with_capacity(dir.path(), 1);
    let a = ca.leaf_certificate("a.example").await.expect("a");
    ca.leaf_certificate("b.example").await.expect("b");
    ca.cache.run_pending_tasks().await;
    assert!(ca.cache.entry_count() <= 1);

    let a_again = ca.leaf_certificate("a.example").await.expect("a again");
    assert_eq!(a.cert_der(), a_again.cert_der(), "served from cache or disk, never re-signed");
    assert_eq!(ca.stats().issued(), 2);
  }

  #[test]
  fn hostnames_that_escape_the_directory_are_refused() {
    for bad in ["", "../etc", "a/b", "a\\b", ".hidden", "a..b", "root", "root.private"] {
      assert!(normalize_hostname(bad).is_err(), "{:?} accepted", bad);
    }
    assert_eq!(normalize_hostname("[::1]").expect("ipv6"), "::1");
    assert_eq!(normalize_hostname("WWW.Example.com.").expect("dns"), "www.example.com");
  }

  #[test]
  fn numeric_non_ip_is_rejected() {
    assert!(subject_alt_name("1.2.3").is_err());
    assert!(matches!(
      subject_alt_name("10.0.0.1").expect("ip"),
      SanType::IpAddress(_)
    ));
  }

  #[test]
  fn serials_are_positive_and_random() {
    let a = random_serial_bytes();
    let b = random_serial_bytes();
    assert_ne!(a, b);
    assert!(a[0] < 0x80 && b[0] < 0x80);
  }
}
