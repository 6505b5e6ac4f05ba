//! HTTP/1.1 message heads and body framing.
//!
//! Heads are parsed from any [`AsyncBufRead`] with a fixed size budget. Bodies
//! are exposed as streaming [`Body`] values; once a body has been read to its end
//! the underlying reader is handed back through a oneshot channel so the
//! connection can serve the next request.

use crate::body::Body;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{stream, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

const CR_LF: &[u8] = b"\r\n";
const SPACE: &[u8] = b" ";
/// Upper bound for a request/status line plus all header lines
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: u64 = 4096;
const READ_CHUNK: usize = 16 * 1024;

/// Headers that only describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
  /// request method
  pub method: Method,
  /// raw request target: origin-form, absolute-form or authority-form
  pub target: String,
  /// protocol version
  pub version: Version,
  /// request headers
  pub headers: HeaderMap,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
  /// protocol version
  pub version: Version,
  /// status code
  pub status: StatusCode,
  /// response headers
  pub headers: HeaderMap,
}

/// How the end of a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// no body
  Empty,
  /// `Content-Length` bytes
  Length(u64),
  /// chunked transfer coding
  Chunked,
  /// body runs until the peer closes
  UntilClose,
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, budget: &mut usize) -> Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  let n = (&mut *reader)
    .take(*budget as u64 + 1)
    .read_until(b'\n', line)
    .await?;
  if n > *budget {
    return Err(Error::invalid_request("message head too large"));
  }
  *budget -= n;
  Ok(n)
}

fn parser_version(raw: &[u8]) -> Result<Version> {
  match raw {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::invalid_request(format!(
      "unsupported http version {}",
      String::from_utf8_lossy(raw)
    ))),
  }
}

fn parser_header(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
    return Err(Error::invalid_request("obsolete header line folding"));
  }
  let colon = line
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::invalid_request("header line without colon"))?;
  let name = HeaderName::from_bytes(&line[..colon]).map_err(|e| Error::from(http::Error::from(e)))?;
  let value = line[colon + 1..].trim_ascii();
  let value = HeaderValue::from_bytes(value).map_err(|e| Error::from(http::Error::from(e)))?;
  Ok((name, value))
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    let n = read_line(reader, &mut line, budget).await?;
    if n == 0 {
      return Err(Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)));
    }
    if line == CR_LF || line == b"\n" {
      return Ok(headers);
    }
    let (name, value) = parser_header(&line)?;
    headers.append(name, value);
  }
}

/// Read the next request head. `Ok(None)` means the peer closed cleanly
/// between requests.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
  R: AsyncBufRead + Unpin,
{
  let mut budget = MAX_HEAD_SIZE;
  let mut line = Vec::new();
  loop {
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Ok(None);
    }
    // stray CRLF between pipelined requests is allowed
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
  let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
  let parts: Vec<&[u8]> = trimmed.split(|b| *b == SPACE[0]).collect();
  let [method, target, version] = parts.as_slice() else {
    return Err(Error::invalid_request("invalid request line"));
  };
  let method =
    Method::from_bytes(method).map_err(|_| Error::invalid_request("invalid request method"))?;
  let target = std::str::from_utf8(target)
    .ok()
    .filter(|t| !t.is_empty())
    .ok_or_else(|| Error::invalid_request("invalid request target"))?
    .to_string();
  let version = parser_version(version)?;
  let headers = read_headers(reader, &mut budget).await?;
  Ok(Some(RequestHead {
    method,
    target,
    version,
    headers,
  }))
}

/// Read a status line and headers, skipping interim `1xx` responses other
/// than `101`.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut budget = MAX_HEAD_SIZE;
    let mut line = Vec::new();
    if read_line(reader, &mut line, &mut budget).await? == 0 {
      return Err(Error::from(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "upstream closed before sending a response",
      )));
    }
    let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    let mut parts = trimmed.splitn(3, |b| *b == SPACE[0]);
    let version = parser_version(parts.next().unwrap_or_default())
      .map_err(|_| Error::connection_error("upstream sent an invalid status line"))?;
    let status = parts
      .next()
      .and_then(|code| StatusCode::from_bytes(code).ok())
      .ok_or_else(|| Error::connection_error("upstream sent an invalid status code"))?;
    let headers = read_headers(reader, &mut budget).await?;
    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    return Ok(ResponseHead {
      version,
      status,
      headers,
    });
  }
}

fn is_chunked(headers: &HeaderMap) -> Option<bool> {
  let last = headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .last()?;
  Some(last.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(CONTENT_LENGTH) {
    for part in value
      .to_str()
      .map_err(|_| Error::invalid_request("invalid content-length"))?
      .split(',')
    {
      let parsed: u64 = part
        .trim()
        .parse()
        .map_err(|_| Error::invalid_request("invalid content-length"))?;
      if length.is_some_and(|l| l != parsed) {
        return Err(Error::invalid_request("conflicting content-length values"));
      }
      length = Some(parsed);
    }
  }
  Ok(length)
}

/// Framing of a request body
pub fn request_framing(headers: &HeaderMap) -> Result<Framing> {
  match is_chunked(headers) {
    Some(true) => return Ok(Framing::Chunked),
    Some(false) => return Err(Error::invalid_request("unsupported transfer-encoding")),
    None => {}
  }
  Ok(match content_length(headers)? {
    None | Some(0) => Framing::Empty,
    Some(n) => Framing::Length(n),
  })
}

/// Framing of a response body to a request made with `method`
pub fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Result<Framing> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(Framing::Empty);
  }
  match is_chunked(headers) {
    Some(true) => return Ok(Framing::Chunked),
    Some(false) => return Ok(Framing::UntilClose),
    None => {}
  }
  Ok(match content_length(headers)? {
    Some(0) => Framing::Empty,
    Some(n) => Framing::Length(n),
    None => Framing::UntilClose,
  })
}

/// Whether the sender of these headers wants the connection kept open
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
  let tokens: Vec<String> = headers
    .get_all(CONNECTION)
    .iter()
    .chain(headers.get_all("proxy-connection").iter())
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .collect();
  if tokens.iter().any(|t| t == "close") {
    return false;
  }
  version != Version::HTTP_10 || tokens.iter().any(|t| t == "keep-alive")
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

/// Set `Content-Length` or chunked coding for an outgoing request body.
/// Returns true when the body must be written chunked.
pub fn frame_request_body(method: &Method, headers: &mut HeaderMap, body: &Body) -> bool {
  headers.remove(CONTENT_LENGTH);
  headers.remove(TRANSFER_ENCODING);
  match body.size_hint() {
    Some(0) if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) => false,
    Some(n) => {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(n));
      false
    }
    None => {
      headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
      true
    }
  }
}

/// How a response body is delimited towards the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFraming {
  /// write the body chunked
  pub chunked: bool,
  /// the body ends with the connection
  pub close: bool,
}

/// Set framing headers for a response sent to a client speaking `version`.
pub fn frame_response_body(
  version: Version,
  headers: &mut HeaderMap,
  body: &Body,
  bodiless: bool,
) -> ResponseFraming {
  if bodiless {
    headers.remove(TRANSFER_ENCODING);
    return ResponseFraming {
      chunked: false,
      close: false,
    };
  }
  headers.remove(CONTENT_LENGTH);
  headers.remove(TRANSFER_ENCODING);
  match body.size_hint() {
    Some(n) => {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(n));
      ResponseFraming {
        chunked: false,
        close: false,
      }
    }
    None if version == Version::HTTP_11 => {
      headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
      ResponseFraming {
        chunked: true,
        close: false,
      }
    }
    None => ResponseFraming {
      chunked: false,
      close: true,
    },
  }
}

fn encode_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (name, value) in headers {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(CR_LF);
  }
  buf.extend_from_slice(CR_LF);
}

fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

/// Write an HTTP/1.1 request line and headers
pub async fn write_request_head<W>(
  writer: &mut W,
  method: &Method,
  target: &str,
  headers: &HeaderMap,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut buf = Vec::with_capacity(256);
  buf.extend_from_slice(method.as_str().as_bytes());
  buf.extend_from_slice(SPACE);
  buf.extend_from_slice(target.as_bytes());
  buf.extend_from_slice(b" HTTP/1.1\r\n");
  encode_headers(&mut buf, headers);
  writer.write_all(&buf).await
}

/// Write a status line and headers
pub async fn write_response_head<W>(
  writer: &mut W,
  version: Version,
  status: StatusCode,
  headers: &HeaderMap,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut buf = Vec::with_capacity(256);
  let status_line = format!(
    "{} {} {}\r\n",
    version_str(version),
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  );
  buf.extend_from_slice(status_line.as_bytes());
  encode_headers(&mut buf, headers);
  writer.write_all(&buf).await
}

/// Write `body`, optionally with chunked coding, and flush. Returns the
/// number of payload bytes written.
pub async fn write_body<W>(writer: &mut W, mut body: Body, chunked: bool) -> io::Result<u64>
where
  W: AsyncWrite + Unpin,
{
  let mut total = 0u64;
  while let Some(chunk) = body.next().await {
    let chunk = chunk?;
    if chunk.is_empty() {
      continue;
    }
    if chunked {
      writer
        .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
        .await?;
      writer.write_all(&chunk).await?;
      writer.write_all(CR_LF).await?;
    } else {
      writer.write_all(&chunk).await?;
    }
    total += chunk.len() as u64;
  }
  if chunked {
    writer.write_all(b"0\r\n\r\n").await?;
  }
  writer.flush().await?;
  Ok(total)
}

/// Write a complete short response with a text body
pub async fn write_simple_response<W>(
  writer: &mut W,
  status: StatusCode,
  message: &str,
  close: bool,
) -> io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut headers = HeaderMap::new();
  headers.insert(
    http::header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
  if close {
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
  }
  write_response_head(writer, Version::HTTP_11, status, &headers).await?;
  writer.write_all(message.as_bytes()).await?;
  writer.flush().await
}

enum ChunkState {
  Size,
  Data(u64),
  DataEnd,
  /// bytes of trailer section still allowed
  Trailers(usize),
}

enum ReadState {
  Length(u64),
  Chunked(ChunkState),
  UntilClose,
  Done,
}

struct BodyReader<R> {
  reader: R,
  state: ReadState,
  giveback: Option<oneshot::Sender<R>>,
}

impl<R: AsyncBufRead + Unpin> BodyReader<R> {
  async fn read_some(&mut self, limit: u64) -> io::Result<Bytes> {
    let available = self.reader.fill_buf().await?;
    let n = available.len().min(READ_CHUNK).min(limit.min(usize::MAX as u64) as usize);
    let chunk = Bytes::copy_from_slice(&available[..n]);
    self.reader.consume(n);
    Ok(chunk)
  }

  async fn read_crlf_line(&mut self) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = (&mut self.reader)
      .take(MAX_CHUNK_LINE)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 || line.last() != Some(&b'\n') {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "truncated chunked body",
      ));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    Ok(line)
  }

  async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
    loop {
      match self.state {
        ReadState::Done | ReadState::Length(0) => {
          self.state = ReadState::Done;
          return Ok(None);
        }
        ReadState::Length(remaining) => {
          let chunk = self.read_some(remaining).await?;
          if chunk.is_empty() {
            return Err(io::Error::new(
              io::ErrorKind::UnexpectedEof,
              "body shorter than content-length",
            ));
          }
          self.state = ReadState::Length(remaining - chunk.len() as u64);
          return Ok(Some(chunk));
        }
        ReadState::UntilClose => {
          let chunk = self.read_some(u64::MAX).await?;
          if chunk.is_empty() {
            self.state = ReadState::Done;
            return Ok(None);
          }
          return Ok(Some(chunk));
        }
        ReadState::Chunked(ChunkState::Size) => {
          let line = self.read_crlf_line().await?;
          let size = parse_chunk_size(&line)?;
          self.state = ReadState::Chunked(if size == 0 {
            ChunkState::Trailers(MAX_HEAD_SIZE)
          } else {
            ChunkState::Data(size)
          });
        }
        ReadState::Chunked(ChunkState::Data(remaining)) => {
          let chunk = self.read_some(remaining).await?;
          if chunk.is_empty() {
            return Err(io::Error::new(
              io::ErrorKind::UnexpectedEof,
              "truncated chunk",
            ));
          }
          let left = remaining - chunk.len() as u64;
          self.state = ReadState::Chunked(if left == 0 {
            ChunkState::DataEnd
          } else {
            ChunkState::Data(left)
          });
          return Ok(Some(chunk));
        }
        ReadState::Chunked(ChunkState::DataEnd) => {
          if !self.read_crlf_line().await?.is_empty() {
            return Err(io::Error::new(
              io::ErrorKind::InvalidData,
              "missing CRLF after chunk",
            ));
          }
          self.state = ReadState::Chunked(ChunkState::Size);
        }
        ReadState::Chunked(ChunkState::Trailers(budget)) => {
          let line = self.read_crlf_line().await?;
          if line.is_empty() {
            self.state = ReadState::Done;
            continue;
          }
          let budget = budget.checked_sub(line.len() + 2).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "chunked trailers too large")
          })?;
          self.state = ReadState::Chunked(ChunkState::Trailers(budget));
        }
      }
    }
  }

  fn finish(self) {
    if let Some(giveback) = self.giveback {
      let _ = giveback.send(self.reader);
    }
  }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
  std::str::from_utf8(size)
    .ok()
    .and_then(|s| u64::from_str_radix(s, 16).ok())
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

/// Expose the body that follows a head as a stream.
///
/// The receiver yields the reader back once the body has been read to its end
/// (immediately for [`Framing::Empty`]). It is never fulfilled when the body is
/// dropped early or fails, in which case the connection cannot be reused.
pub fn body_reader<R>(reader: R, framing: Framing) -> (Body, oneshot::Receiver<R>)
where
  R: AsyncBufRead + Unpin + Send + 'static,
{
  let (giveback, returned) = oneshot::channel();
  let state = match framing {
    Framing::Empty => {
      let _ = giveback.send(reader);
      return (Body::empty(), returned);
    }
    Framing::Length(n) => ReadState::Length(n),
    Framing::Chunked => ReadState::Chunked(ChunkState::Size),
    Framing::UntilClose => ReadState::UntilClose,
  };
  let body_reader = BodyReader {
    reader,
    state,
    giveback: Some(giveback),
  };
  let chunks = stream::unfold(Some(body_reader), |body_reader| async move {
    let mut body_reader = body_reader?;
    match body_reader.next_chunk().await {
      Ok(Some(chunk)) => Some((Ok(chunk), Some(body_reader))),
      Ok(None) => {
        body_reader.finish();
        None
      }
      Err(e) => Some((Err(e), None)),
    }
  });
  let body = match framing {
    Framing::Length(n) => Body::sized_stream(chunks, n),
    _ => Body::wrap_stream(chunks),
  };
  (body, returned)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  fn reader(raw: &str) -> BufReader<Cursor<Vec<u8>>> {
    BufReader::new(Cursor::new(raw.as_bytes().to_vec()))
  }

  #[tokio::test]
  async fn parses_absolute_form_request() {
    let mut r = reader("GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nX-A: 1\r\nX-A: 2\r\n\r\n");
    let head = read_request_head(&mut r).await.expect("parse").expect("head");
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "http://example.com/a?b=1");
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.headers.get_all("x-a").iter().count(), 2);
    assert!(read_request_head(&mut r).await.expect("eof").is_none());
  }

  #[tokio::test]
  async fn rejects_malformed_heads() {
    for raw in [
      "GET /\r\n\r\n",
      "GET / HTTP/9.9\r\n\r\n",
      "GET / HTTP/1.1\r\nno-colon\r\n\r\n",
      "GET / HTTP/1.1\r\nA: b\r\n folded\r\n\r\n",
    ] {
      assert!(read_request_head(&mut reader(raw)).await.is_err(), "{:?}", raw);
    }
    let huge = format!("GET / HTTP/1.1\r\nX: {}\r\n\r\n", "a".repeat(MAX_HEAD_SIZE));
    assert!(read_request_head(&mut reader(&huge)).await.is_err());
  }

  #[tokio::test]
  async fn response_head_skips_continue() {
    let mut r = reader("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
    let head = read_response_head(&mut r).await.expect("head");
    assert_eq!(head.status, StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn chunked_body_returns_reader_for_next_request() {
    let mut r = reader(
      "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nTrailer: x\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
    );
    let head = read_request_head(&mut r).await.expect("parse").expect("head");
    let framing = request_framing(&head.headers).expect("framing");
    assert_eq!(framing, Framing::Chunked);
    let (body, returned) = body_reader(r, framing);
    assert_eq!(body.collect().await.expect("body"), "hello world");
    let mut r = returned.await.expect("reader handed back");
    let next = read_request_head(&mut r).await.expect("parse").expect("head");
    assert_eq!(next.target, "/next");
  }

  #[tokio::test]
  async fn oversized_trailers_are_rejected() {
    let line = format!("X-Pad: {}\r\n", "a".repeat(1000));
    let raw = format!("3\r\nabc\r\n0\r\n{}\r\n", line.repeat(MAX_HEAD_SIZE / line.len() + 1));
    let (body, returned) = body_reader(reader(&raw), Framing::Chunked);
    assert!(body.collect().await.is_err());
    assert!(returned.await.is_err(), "connection is not reused");
  }

  #[tokio::test]
  async fn length_body_is_sized_and_bounded() {
    let (body, returned) = body_reader(reader("abcdefEXTRA"), Framing::Length(6));
    assert_eq!(body.size_hint(), Some(6));
    assert_eq!(body.collect().await.expect("body"), "abcdef");
    let mut rest = String::new();
    returned
      .await
      .expect("reader")
      .read_to_string(&mut rest)
      .await
      .expect("rest");
    assert_eq!(rest, "EXTRA");
  }

  #[tokio::test]
  async fn truncated_body_is_an_error_and_keeps_reader() {
    let (body, returned) = body_reader(reader("abc"), Framing::Length(10));
    assert!(body.collect().await.is_err());
    assert!(returned.await.is_err(), "connection is not reusable");
  }

  #[test]
  fn response_framing_rules() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
    assert_eq!(
      response_framing(&Method::HEAD, StatusCode::OK, &headers).expect("framing"),
      Framing::Empty
    );
    assert_eq!(
      response_framing(&Method::GET, StatusCode::NO_CONTENT, &headers).expect("framing"),
      Framing::Empty
    );
    assert_eq!(
      response_framing(&Method::GET, StatusCode::OK, &headers).expect("framing"),
      Framing::Length(10)
    );
    assert_eq!(
      response_framing(&Method::GET, StatusCode::OK, &HeaderMap::new()).expect("framing"),
      Framing::UntilClose
    );
    headers.append(CONTENT_LENGTH, HeaderValue::from_static("11"));
    assert!(request_framing(&headers).is_err(), "conflicting lengths");
  }

  #[test]
  fn hop_by_hop_headers_are_removed() {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("close, x-session"));
    headers.insert("x-session", HeaderValue::from_static("abc"));
    headers.insert("proxy-authorization", HeaderValue::from_static("Basic Zm9v"));
    headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
    headers.insert("x-kept", HeaderValue::from_static("1"));
    strip_hop_by_hop(&mut headers);
    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key("x-kept"));
  }

  #[test]
  fn keep_alive_defaults_follow_version() {
    let mut headers = HeaderMap::new();
    assert!(wants_keep_alive(Version::HTTP_11, &headers));
    assert!(!wants_keep_alive(Version::HTTP_10, &headers));
    headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
    assert!(wants_keep_alive(Version::HTTP_10, &headers));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    assert!(!wants_keep_alive(Version::HTTP_11, &headers));
  }

  #[tokio::test]
  async fn chunked_writer_encodes_stream() {
    let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"hello")), Ok(Bytes::new())];
    let body = Body::wrap_stream(stream::iter(chunks));
    let mut headers = HeaderMap::new();
    let framing = frame_response_body(Version::HTTP_11, &mut headers, &body, false);
    assert!(framing.chunked);
    let mut out = Vec::new();
    let written = write_body(&mut out, body, framing.chunked).await.expect("write");
    assert_eq!(written, 5);
    assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
  }

  #[test]
  fn request_framing_skips_empty_get_bodies() {
    let mut headers = HeaderMap::new();
    assert!(!frame_request_body(&Method::GET, &mut headers, &Body::empty()));
    assert!(!headers.contains_key(CONTENT_LENGTH));
    assert!(!frame_request_body(&Method::POST, &mut headers, &Body::empty()));
    assert_eq!(headers.get(CONTENT_LENGTH).expect("length"), "0");
  }
}
