//! Error types for the relay

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for relay operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// The root certificate material on disk is incomplete or unreadable
  #[error("Root certificate material error: {0}")]
  RootMaterial(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// The upstream did not answer before the deadline
  #[error("upstream request timed out after {0:?}")]
  UpstreamTimeout(Duration),

  /// Listener could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// address that was requested
    addr: String,
    /// underlying socket error
    source: io::Error,
  },

  /// Invalid configuration value
  #[error("Config error: {0}")]
  Config(String),

  /// An error produced once and handed to every coalesced waiter
  #[error("{0}")]
  Shared(Arc<Error>),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("[CA] {}", error);
    error
  }

  /// Create a root material error and log it
  pub fn root_material(msg: impl Into<String>) -> Self {
    let error = Error::RootMaterial(msg.into());
    tracing::error!("[CA] {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::error!("[TLS] {}", error);
    error
  }

  /// Create an invalid request error
  ///
  /// Malformed client input is routine for a proxy, so this only logs at debug.
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a config error
  pub fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  /// True for the disconnects a client or server produces by simply going away.
  ///
  /// These are logged at a lower severity than real failures.
  pub fn is_benign_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => is_benign_io(e),
      Error::Shared(inner) => inner.is_benign_disconnect(),
      _ => false,
    }
  }

  /// Log this error at a severity matching its kind
  pub fn log(&self, context: &str) {
    if self.is_benign_disconnect() {
      tracing::debug!("{} {}", context, self);
    } else {
      tracing::warn!("{} {}", context, self);
    }
  }
}

pub(crate) fn is_benign_io(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::ConnectionReset
      | io::ErrorKind::BrokenPipe
      | io::ErrorKind::UnexpectedEof
      | io::ErrorKind::ConnectionAborted
  )
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    if is_benign_io(&value) {
      tracing::debug!("IO error: {}", value);
    } else {
      tracing::trace!("IO error: {}", value);
    }
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::debug!("HTTP error: {}", error);
    error
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::from(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::from(http::Error::from(value))
  }
}

impl From<Arc<Error>> for Error {
  fn from(value: Arc<Error>) -> Self {
    Error::Shared(value)
  }
}

impl From<Error> for io::Error {
  fn from(value: Error) -> Self {
    match value {
      Error::Io(e) => e,
      Error::UpstreamTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, value.to_string()),
      other => io::Error::other(other.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resets_and_broken_pipes_are_benign() {
    let reset = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
    let pipe = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
    let refused = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
    assert!(reset.is_benign_disconnect());
    assert!(pipe.is_benign_disconnect());
    assert!(!refused.is_benign_disconnect());
    assert!(!Error::config("bad").is_benign_disconnect());
  }

  #[test]
  fn shared_errors_keep_their_message() {
    let inner = Arc::new(Error::CertificateError("no key".to_string()));
    let shared = Error::from(inner.clone());
    assert_eq!(shared.to_string(), inner.to_string());
    let shared_reset = Error::Shared(Arc::new(Error::Io(io::Error::from(
      io::ErrorKind::ConnectionReset,
    ))));
    assert!(shared_reset.is_benign_disconnect());
  }
}
