//! In-process socket pairs.
//!
//! Intercepted CONNECT tunnels are handed to the TLS listener through a
//! [`VirtualSocket`] pair instead of a loopback connection. Each direction is a
//! bounded byte buffer: a writer that fills it is parked until the reader drains
//! it, a shutdown or drop surfaces as EOF on the peer, and [`VirtualSocket::abort`]
//! fails both directions with an error.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

/// Default per-direction buffer size
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
struct Pipe {
  buf: VecDeque<u8>,
  capacity: usize,
  /// writer shut down or dropped
  write_closed: bool,
  /// reader dropped
  read_closed: bool,
  aborted: Option<io::ErrorKind>,
  read_waker: Option<Waker>,
  write_waker: Option<Waker>,
}

impl Pipe {
  fn new(capacity: usize) -> Arc<Mutex<Pipe>> {
    Arc::new(Mutex::new(Pipe {
      buf: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
      capacity,
      write_closed: false,
      read_closed: false,
      aborted: None,
      read_waker: None,
      write_waker: None,
    }))
  }

  fn wake_reader(&mut self) {
    if let Some(waker) = self.read_waker.take() {
      waker.wake();
    }
  }

  fn wake_writer(&mut self) {
    if let Some(waker) = self.write_waker.take() {
      waker.wake();
    }
  }
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
  pipe.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One end of an in-memory full-duplex byte stream
#[derive(Debug)]
pub struct VirtualSocket {
  incoming: Arc<Mutex<Pipe>>,
  outgoing: Arc<Mutex<Pipe>>,
}

/// Create two linked sockets; bytes written to one are read from the other.
pub fn pair(capacity: usize) -> (VirtualSocket, VirtualSocket) {
  let capacity = capacity.max(1);
  let a_to_b = Pipe::new(capacity);
  let b_to_a = Pipe::new(capacity);
  (
    VirtualSocket {
      incoming: Arc::clone(&b_to_a),
      outgoing: Arc::clone(&a_to_b),
    },
    VirtualSocket {
      incoming: a_to_b,
      outgoing: b_to_a,
    },
  )
}

impl VirtualSocket {
  /// Tear down both directions; the peer's pending and future I/O fails
  /// with `ConnectionAborted`.
  pub fn abort(&self) {
    for pipe in [&self.incoming, &self.outgoing] {
      let mut pipe = lock(pipe);
      pipe.aborted = Some(io::ErrorKind::ConnectionAborted);
      pipe.wake_reader();
      pipe.wake_writer();
    }
  }
}

impl AsyncRead for VirtualSocket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let mut pipe = lock(&self.incoming);
    if let Some(kind) = pipe.aborted {
      return Poll::Ready(Err(io::Error::from(kind)));
    }
    if !pipe.buf.is_empty() {
      let n = buf.remaining().min(pipe.buf.len());
      let (front, back) = pipe.buf.as_slices();
      let from_front = n.min(front.len());
      buf.put_slice(&front[..from_front]);
      if n > from_front {
        buf.put_slice(&back[..n - from_front]);
      }
      pipe.buf.drain(..n);
      pipe.wake_writer();
      return Poll::Ready(Ok(()));
    }
    if pipe.write_closed {
      return Poll::Ready(Ok(()));
    }
    pipe.read_waker = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl AsyncWrite for VirtualSocket {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    data: &[u8],
  ) -> Poll<io::Result<usize>> {
    let mut pipe = lock(&self.outgoing);
    if let Some(kind) = pipe.aborted {
      return Poll::Ready(Err(io::Error::from(kind)));
    }
    if pipe.read_closed || pipe.write_closed {
      return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
    }
    if data.is_empty() {
      return Poll::Ready(Ok(0));
    }
    let room = pipe.capacity - pipe.buf.len();
    if room == 0 {
      pipe.write_waker = Some(cx.waker().clone());
      return Poll::Pending;
    }
    let n = room.min(data.len());
    pipe.buf.extend(&data[..n]);
    pipe.wake_reader();
    Poll::Ready(Ok(n))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match lock(&self.outgoing).aborted {
      Some(kind) => Poll::Ready(Err(io::Error::from(kind))),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let mut pipe = lock(&self.outgoing);
    pipe.write_closed = true;
    pipe.wake_reader();
    Poll::Ready(Ok(()))
  }
}

impl Drop for VirtualSocket {
  fn drop(&mut self) {
    let mut outgoing = lock(&self.outgoing);
    outgoing.write_closed = true;
    outgoing.wake_reader();
    drop(outgoing);
    let mut incoming = lock(&self.incoming);
    incoming.read_closed = true;
    incoming.buf.clear();
    incoming.wake_writer();
  }
}

struct Handoff<M> {
  socket: VirtualSocket,
  meta: M,
  connected: oneshot::Sender<()>,
}

/// Dialing side of an in-process listener
pub struct VirtualConnector<M> {
  tx: mpsc::Sender<Handoff<M>>,
  capacity: usize,
}

impl<M> Clone for VirtualConnector<M> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      capacity: self.capacity,
    }
  }
}

/// Accepting side of an in-process listener
pub struct VirtualListener<M> {
  rx: mpsc::Receiver<Handoff<M>>,
}

/// Create a connected listener/connector couple. `capacity` is the
/// per-direction buffer size of every socket pair created through it.
pub fn listener<M>(capacity: usize) -> (VirtualConnector<M>, VirtualListener<M>) {
  let (tx, rx) = mpsc::channel(64);
  (VirtualConnector { tx, capacity }, VirtualListener { rx })
}

impl<M: Send> VirtualConnector<M> {
  /// Open a socket to the listener.
  ///
  /// Resolves once the listener has accepted the other end, which is the
  /// "connected" signal; fails with `ConnectionRefused` if the listener is gone.
  pub async fn connect(&self, meta: M) -> io::Result<VirtualSocket> {
    let (local, remote) = pair(self.capacity);
    let (connected, accepted) = oneshot::channel();
    self
      .tx
      .send(Handoff {
        socket: remote,
        meta,
        connected,
      })
      .await
      .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
    accepted
      .await
      .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
    Ok(local)
  }
}

impl<M> VirtualListener<M> {
  /// Wait for the next connection; `None` once every connector is dropped.
  pub async fn accept(&mut self) -> Option<(VirtualSocket, M)> {
    loop {
      let handoff = self.rx.recv().await?;
      // the dialer may have given up while queued
      if handoff.connected.send(()).is_ok() {
        return Some((handoff.socket, handoff.meta));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn bytes_flow_both_ways() {
    let (mut a, mut b) = pair(16);
    a.write_all(b"ping").await.expect("write");
    let mut buf = [0u8; 4];
    b.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping");

    b.write_all(b"pong").await.expect("write");
    a.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"pong");
  }

  #[tokio::test]
  async fn full_buffer_blocks_writer_without_dropping_data() {
    let (mut a, mut b) = pair(8);
    let payload: Vec<u8> = (0..64u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
      a.write_all(&payload).await.expect("write");
      a
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished(), "writer parks while the buffer is full");

    let mut received = vec![0u8; 64];
    b.read_exact(&mut received).await.expect("read");
    assert_eq!(received, expected);
    writer.await.expect("writer finishes once drained");
  }

  #[tokio::test]
  async fn shutdown_is_eof_for_peer() {
    let (mut a, mut b) = pair(16);
    a.write_all(b"bye").await.expect("write");
    a.shutdown().await.expect("shutdown");
    let mut rest = Vec::new();
    b.read_to_end(&mut rest).await.expect("read to eof");
    assert_eq!(rest, b"bye");
    assert!(a.write_all(b"more").await.is_err());
  }

  #[tokio::test]
  async fn dropped_peer_breaks_pipe() {
    let (mut a, b) = pair(16);
    drop(b);
    let err = a.write_all(b"x").await.expect_err("peer is gone");
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    let mut buf = [0u8; 1];
    assert_eq!(a.read(&mut buf).await.expect("eof"), 0);
  }

  #[tokio::test]
  async fn abort_fails_pending_reader() {
    let (a, mut b) = pair(16);
    let reader = tokio::spawn(async move {
      let mut buf = [0u8; 1];
      b.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    a.abort();
    let err = reader.await.expect("join").expect_err("aborted");
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
  }

  #[tokio::test]
  async fn connect_resolves_after_accept() {
    let (connector, mut listener) = listener::<&'static str>(32);
    let server = tokio::spawn(async move {
      let (mut socket, meta) = listener.accept().await.expect("accepted");
      let mut buf = [0u8; 5];
      socket.read_exact(&mut buf).await.expect("read");
      (meta, buf)
    });
    let mut client = connector.connect("example.com:443").await.expect("connected");
    client.write_all(b"hello").await.expect("write");
    let (meta, buf) = server.await.expect("join");
    assert_eq!(meta, "example.com:443");
    assert_eq!(&buf, b"hello");
  }

  #[tokio::test]
  async fn connect_is_refused_without_listener() {
    let (connector, listener) = listener::<()>(32);
    drop(listener);
    let err = connector.connect(()).await.expect_err("no listener");
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
  }
}
