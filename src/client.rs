use crate::body::Body;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::http1;
use crate::request::ProxyRequest;
use crate::response::ProxyResponse;
use http::header::{CONNECTION, HOST};
use http::uri::Scheme;
use http::HeaderValue;
use tokio::io::BufReader;

/// Issues proxied requests to origin servers.
///
/// Every request uses a fresh connection closed after the response
/// (`Connection: close`); the response body streams straight from that socket.
#[derive(Clone)]
pub struct UpstreamClient {
  connector: Connector,
}

impl UpstreamClient {
  /// Constructs a new `UpstreamClient` on top of `connector`.
  pub fn new(connector: Connector) -> UpstreamClient {
    UpstreamClient { connector }
  }

  /// Send `request` with `body` and return once the response head arrived.
  pub async fn send(&self, request: &ProxyRequest, body: Body) -> Result<ProxyResponse> {
    let uri = request.uri();
    let secure = match uri.scheme() {
      Some(s) if *s == Scheme::HTTPS => true,
      Some(s) if *s == Scheme::HTTP => false,
      _ => {
        return Err(Error::invalid_request(format!(
          "unsupported upstream url {}",
          uri
        )))
      }
    };
    let authority = uri
      .authority()
      .ok_or_else(|| Error::invalid_request(format!("upstream url without host {}", uri)))?;
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(if secure { 443 } else { 80 });

    let mut socket = self.connector.connect(host, port).await?;
    if secure {
      socket = self.connector.upgrade_to_tls(socket, host).await?;
    }
    let remote_addr = socket.remote_addr();

    let mut headers = request.headers().clone();
    http1::strip_hop_by_hop(&mut headers);
    headers.insert(HOST, HeaderValue::from_str(authority.as_str())?);
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    let chunked = http1::frame_request_body(request.method(), &mut headers, &body);
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    http1::write_request_head(&mut socket, request.method(), target, &headers).await?;
    http1::write_body(&mut socket, body, chunked).await?;

    let mut reader = BufReader::new(socket);
    let head = http1::read_response_head(&mut reader).await?;
    let framing = http1::response_framing(request.method(), head.status, &head.headers)
      .map_err(|e| Error::connection_error(format!("upstream response framing: {}", e)))?;
    // the reader is never reused, the connection closes with the body
    let (body, _) = http1::body_reader(reader, framing);
    tracing::debug!(
      "[HANDLER] upstream {} answered {} {}",
      remote_addr,
      head.status,
      uri
    );
    Ok(ProxyResponse::upstream(
      head.status,
      head.version,
      head.headers,
      body,
      remote_addr,
    ))
  }
}
