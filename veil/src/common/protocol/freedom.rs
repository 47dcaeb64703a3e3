// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Direct dispatch of sessions to their requested destination over plain TCP and UDP
use std::{
  io,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
  time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing_futures::Instrument;

use super::{
  address::{Destination, Network},
  traits::{DispatchError, Dispatcher},
};
use crate::{
  common::{
    buf::{
      BufferPool, MultiBuffer, MultiBufferReader, MultiBufferWriter, StreamReader, StreamWriter,
    },
    policy::SessionPolicy,
  },
  transfer::{link_pair, DuplexPump, Link, DEFAULT_PIPE_CAPACITY},
  util::{cancellation::CancellationListener, retry::exponential_backoff},
};

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

const DEFAULT_DIAL_ATTEMPTS: u32 = 5;
const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_millis(100);

struct DatagramReader {
  socket: Arc<UdpSocket>,
  pool: Arc<BufferPool>,
}

impl MultiBufferReader for DatagramReader {
  /// Datagram sockets never report end of stream; sessions end by idling out
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>> {
    async move {
      let mut buffer = self.pool.acquire(MAX_DATAGRAM_LEN);
      let received = self.socket.recv(buffer.spare_mut()).await?;
      buffer.commit(received);
      Ok(Some(MultiBuffer::from(buffer)))
    }
    .boxed()
  }
}

struct DatagramWriter {
  socket: Arc<UdpSocket>,
}

impl MultiBufferWriter for DatagramWriter {
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    async move {
      if data.segment_count() == 1 {
        for buffer in data {
          self.socket.send(buffer.bytes()).await?;
        }
      } else {
        let datagram = data.to_vec();
        data.release();
        self.socket.send(&datagram).await?;
      }
      Ok(())
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    futures::future::ready(Ok(())).boxed()
  }
}

/// Dials the requested destination and relays the returned link against it
#[derive(Debug, Clone)]
pub struct FreedomDispatcher {
  redirect: Option<Destination>,
  pool: Arc<BufferPool>,
  dial_attempts: u32,
  dial_backoff: Duration,
}

impl Default for FreedomDispatcher {
  fn default() -> Self {
    Self::new()
  }
}

impl FreedomDispatcher {
  pub fn new() -> Self {
    Self {
      redirect: None,
      pool: BufferPool::shared(),
      dial_attempts: DEFAULT_DIAL_ATTEMPTS,
      dial_backoff: DEFAULT_DIAL_BACKOFF,
    }
  }

  /// Sends every session to `redirect` instead; a zero port keeps the requested port
  pub fn with_redirect(mut self, redirect: Option<Destination>) -> Self {
    self.redirect = redirect;
    self
  }

  pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
    self.dial_attempts = attempts;
    self.dial_backoff = backoff;
    self
  }

  pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
    self.pool = pool;
    self
  }

  fn target(&self, requested: &Destination) -> Destination {
    match &self.redirect {
      None => requested.clone(),
      Some(redirect) => Destination {
        network: requested.network,
        address: redirect.address.clone(),
        port: if redirect.port == 0 {
          requested.port
        } else {
          redirect.port
        },
      },
    }
  }

  async fn connect(
    &self,
    target: &Destination,
  ) -> io::Result<(Box<dyn MultiBufferReader>, Box<dyn MultiBufferWriter>)> {
    let addr = target.resolve().await?;
    match target.network {
      Network::Tcp => {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok((
          Box::new(StreamReader::with_pool(reader, Arc::clone(&self.pool))),
          Box::new(StreamWriter::new(writer)),
        ))
      }
      Network::Udp => {
        let local: SocketAddr = match addr {
          SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
          SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        let socket = Arc::new(socket);
        Ok((
          Box::new(DatagramReader {
            socket: Arc::clone(&socket),
            pool: Arc::clone(&self.pool),
          }),
          Box::new(DatagramWriter { socket }),
        ))
      }
    }
  }
}

impl Dispatcher for FreedomDispatcher {
  fn dispatch<'a>(
    &'a self,
    destination: &'a Destination,
    policy: SessionPolicy,
    shutdown: CancellationListener,
  ) -> BoxFuture<'a, Result<Link, DispatchError>> {
    async move {
      let target = self.target(destination);
      let unreachable = |source: io::Error| DispatchError::Unreachable {
        destination: target.clone(),
        source,
      };
      let dial = exponential_backoff(self.dial_attempts, self.dial_backoff, || {
        self.connect(&target)
      });
      let (remote_reader, remote_writer) = shutdown
        .run_until_cancelled(dial)
        .await
        .ok_or_else(|| unreachable(io::Error::new(io::ErrorKind::Interrupted, "shutting down")))?
        .map_err(|e| unreachable(e.last))?;
      tracing::debug!(%target, "connected");

      let (local, far) = link_pair(DEFAULT_PIPE_CAPACITY);
      let (far_reader, far_writer) = far.into_parts();
      let pump = DuplexPump::new(shutdown.child_token(), policy.timeouts);
      tokio::task::spawn(
        async move {
          if let Err(e) = pump
            .run((far_reader, remote_writer), (remote_reader, far_writer))
            .await
          {
            tracing::debug!(error = %e, "outbound relay ended");
          }
        }
        .instrument(tracing::debug_span!("freedom", %target)),
      );
      Ok(local)
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::{io, time::Duration};

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
  };

  use super::FreedomDispatcher;
  use crate::{
    common::{
      buf::{BufferPool, MultiBuffer, MultiBufferReader, MultiBufferWriter},
      policy::{SessionPolicy, Timeouts},
      protocol::{
        address::{Address, Destination},
        traits::{DispatchError, Dispatcher},
      },
    },
    util::cancellation::CancellationListener,
  };

  async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::task::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut received = Vec::new();
      stream.read_to_end(&mut received).await.unwrap();
      stream.write_all(&received).await.unwrap();
      stream.shutdown().await.unwrap();
    });
    addr
  }

  async fn read_all(link: &mut crate::transfer::Link) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = link.reader.read_multi_buffer().await.unwrap() {
      out.extend(chunk.to_vec());
    }
    out
  }

  #[tokio::test]
  async fn tcp_sessions_relay_and_half_close() {
    let pool = BufferPool::new();
    let addr = echo_server().await;
    let dispatcher = FreedomDispatcher::default();
    let mut link = dispatcher
      .dispatch(&addr.into(), SessionPolicy::default(), CancellationListener::default())
      .await
      .unwrap();
    link
      .writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"echo me"))
      .await
      .unwrap();
    link.writer.close().await.unwrap();
    assert_eq!(read_all(&mut link).await, b"echo me");
  }

  #[tokio::test]
  async fn redirect_overrides_address_but_keeps_zero_port() {
    let addr = echo_server().await;
    let dispatcher = FreedomDispatcher::default().with_redirect(Some(Destination::tcp(
      Address::Ip(addr.ip()),
      0,
    )));
    let requested = Destination::tcp(Address::Domain("unresolvable.invalid".into()), addr.port());
    let mut link = dispatcher
      .dispatch(&requested, SessionPolicy::default(), CancellationListener::default())
      .await
      .unwrap();
    link.writer.close().await.unwrap();
    assert!(read_all(&mut link).await.is_empty());
  }

  #[tokio::test]
  async fn udp_sessions_relay_datagrams() {
    let pool = BufferPool::new();
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::task::spawn(async move {
      let mut datagram = [0u8; 512];
      let (n, peer) = server.recv_from(&mut datagram).await.unwrap();
      server.send_to(&datagram[..n], peer).await.unwrap();
    });

    let destination = Destination::udp(Address::Ip(addr.ip()), addr.port());
    let mut link = FreedomDispatcher::default()
      .dispatch(&destination, SessionPolicy::default(), CancellationListener::default())
      .await
      .unwrap();
    let mut query = MultiBuffer::copy_from_slice(&pool, b"query:");
    query.extend(MultiBuffer::copy_from_slice(&pool, b"a"));
    link.writer.write_multi_buffer(query).await.unwrap();
    let answer = link.reader.read_multi_buffer().await.unwrap().unwrap();
    assert_eq!(answer.to_vec(), b"query:a");
  }

  #[tokio::test]
  async fn session_policy_bounds_the_outbound_leg() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let holding = tokio::task::spawn(async move {
      // Accept and stay silent without closing
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(30)).await;
      drop(stream);
    });
    let policy = SessionPolicy {
      timeouts: Timeouts {
        connection_idle: Duration::from_millis(200),
        ..Timeouts::default()
      },
    };

    let mut link = FreedomDispatcher::default()
      .dispatch(&addr.into(), policy, CancellationListener::default())
      .await
      .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), link.reader.read_multi_buffer())
      .await
      .expect("outbound leg outlived its idle timeout")
      .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    holding.abort();
  }

  #[tokio::test]
  async fn unreachable_destinations_fail_after_retries() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = FreedomDispatcher::default()
      .with_retry(2, Duration::from_millis(10))
      .dispatch(&addr.into(), SessionPolicy::default(), CancellationListener::default())
      .await
      .unwrap_err();
    match err {
      DispatchError::Unreachable { source, .. } => {
        assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused)
      }
      other => panic!("unexpected error {:?}", other),
    }
  }
}
