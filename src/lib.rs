#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitm-relay
//!
//! A man-in-the-middle forward proxy. Clients point their HTTP proxy setting
//! at it; plain requests are forwarded, and CONNECT tunnels are either spliced
//! through untouched or decrypted with a leaf certificate minted on the fly by
//! the proxy's own root CA.
//!
//! - Root CA generated once and persisted, leaves issued per hostname and cached
//! - Pluggable [`Modifier`]s that answer, rewrite or inspect traffic
//! - A [`RequestRecord`] per exchange, handed to [`Observer`]s when it completes
//! - Tunnels closed forcibly on shutdown
//!
//! ## Starting a proxy
//!
//! ```no_run
//! use mitm_relay::{MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> mitm_relay::Result<()> {
//!   let proxy = MitmProxy::new(MitmConfig::default()).await?;
//!   println!("trust {}", proxy.ca().root_cert_path().display());
//!   let handle = proxy.start().await?;
//!   tokio::signal::ctrl_c().await?;
//!   handle.shutdown().await;
//!   Ok(())
//! }
//! ```
//!
//! ## Writing a modifier
//!
//! A modifier lists the hooks it implements and overrides only those.
//!
//! ```rust
//! use async_trait::async_trait;
//! use mitm_relay::{Hooks, Modifier, ProxyRequest, ProxyResponse, ResponseChange};
//!
//! struct Tag;
//!
//! #[async_trait]
//! impl Modifier for Tag {
//!   fn hooks(&self) -> Hooks {
//!     Hooks::CHANGE_RESPONSE
//!   }
//!
//!   async fn change_response(
//!     &self,
//!     _request: &ProxyRequest,
//!     response: &ProxyResponse,
//!   ) -> mitm_relay::Result<Option<ResponseChange>> {
//!     let mut headers = response.headers().clone();
//!     headers.insert("x-relayed", http::HeaderValue::from_static("1"));
//!     Ok(Some(ResponseChange::new().headers(headers)))
//!   }
//! }
//! ```

mod body;
mod ca;
mod client;
mod connector;
pub mod duplex;
mod error;
mod handler;
pub mod http1;
mod modifier;
mod proxy;
mod record;
mod request;
mod response;
mod server;
mod single_flight;
mod socket;
mod tls;
mod tls_server;
pub mod tunnel;

pub use body::{Body, BodyCapture};
pub use ca::{CaStats, CertificateAuthority, LeafCertificate, RootCertificate, DEFAULT_CACHE_CAPACITY};
pub use connector::{Connector, ConnectorBuilder};
pub use error::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use modifier::{Hooks, Modifier, ModifierChain};
pub use proxy::{MitmConfig, MitmProxy, ProxyHandle, DEFAULT_PORT};
pub use record::{LogObserver, Observer, RecordMetadata, RecordSnapshot, RequestRecord};
pub use request::{ProxyRequest, RequestChange};
pub use response::{ProxyResponse, ResponseChange};
pub use socket::Socket;
pub use tls::Certificate;
pub use tokio_rustls;
