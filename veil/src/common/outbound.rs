// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client side of the tagged protocol: relays a local link through a remote server
use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpStream;

use super::{
  authentication::{Clock, HmacMd5IdHasher, IdHasher, SecretId, SystemClock},
  buf::{BufferPool, BufferedWriter, MultiBufferReader, MultiBufferWriter, StreamWriter},
  policy::Timeouts,
  protocol::{packet, tagged, Destination, FramingError, Network},
};
use crate::{
  transfer::{DuplexPump, Link, TransferError, TransferStats},
  util::{cancellation::CancellationListener, retry::exponential_backoff},
};

/// How long the request header waits to share a segment with the first payload chunk
const FIRST_CHUNK_WAIT: Duration = Duration::from_millis(100);

const DIAL_ATTEMPTS: u32 = 5;
const DIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum OutboundError {
  #[error("Failed to connect to server {server}")]
  Dial {
    server: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("Request header cannot be encoded")]
  Framing(#[from] FramingError),
  #[error("Failed sending request header")]
  Io(#[from] io::Error),
  #[error("Relay failed")]
  Transfer(#[from] TransferError),
}

pub struct TaggedOutbound {
  server: SocketAddr,
  identifiers: Vec<SecretId>,
  hasher: Arc<dyn IdHasher>,
  clock: Arc<dyn Clock>,
  pool: Arc<BufferPool>,
  timeouts: Timeouts,
}

impl std::fmt::Debug for TaggedOutbound {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaggedOutbound")
      .field("server", &self.server)
      .field("identifiers", &self.identifiers.len())
      .finish_non_exhaustive()
  }
}

impl TaggedOutbound {
  /// Authenticates as `primary`, rotating through `alternate_count` derived identifiers
  pub fn new(server: SocketAddr, primary: SecretId, alternate_count: u16) -> Self {
    let mut identifiers = vec![primary];
    identifiers.extend(primary.derive_alternates(alternate_count));
    Self {
      server,
      identifiers,
      hasher: Arc::new(HmacMd5IdHasher),
      clock: Arc::new(SystemClock),
      pool: BufferPool::shared(),
      timeouts: Timeouts::default(),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
    self.timeouts = timeouts;
    self
  }

  /// The request header a fresh session toward `destination` would open with
  pub fn request_header(&self, destination: &Destination) -> Result<Vec<u8>, FramingError> {
    let timestamp = self.clock.now();
    // Non-empty by construction: the primary is always present
    let index = (timestamp % self.identifiers.len() as u64) as usize;
    let tag = self
      .hasher
      .digest(self.identifiers[index].as_bytes(), timestamp);
    tagged::encode_request(&tag, destination)
  }

  /// Relays `local` to `destination` through the server until either side finishes
  #[tracing::instrument(level = "debug", skip(self, local, shutdown), fields(server = %self.server), err)]
  pub async fn relay(
    &self,
    destination: &Destination,
    local: Link,
    shutdown: &CancellationListener,
  ) -> Result<TransferStats, OutboundError> {
    let header = self.request_header(destination)?;
    let server = self.server;
    let stream = exponential_backoff(DIAL_ATTEMPTS, DIAL_BACKOFF, || TcpStream::connect(server))
      .await
      .map_err(|e| OutboundError::Dial {
        server,
        source: e.last,
      })?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let remote_reader = tagged::body_reader_for(destination.network, &self.pool, Box::new(reader));

    // The header travels unframed on the transport; only the body is framed
    // per network, so a UDP first chunk becomes its own packet.
    let (mut local_reader, local_writer) = local.into_parts();
    let mut request = BufferedWriter::new(StreamWriter::new(writer));
    request.write_bytes(&header).await?;
    let mut first_len = 0;
    match tokio::time::timeout(FIRST_CHUNK_WAIT, local_reader.read_multi_buffer()).await {
      Ok(Ok(Some(first))) => {
        first_len = first.len() as u64;
        if destination.network == Network::Udp {
          request.write_bytes(&packet::length_prefix(first.len())?).await?;
        }
        request.write_multi_buffer(first).await?;
      }
      Ok(Ok(None)) | Err(_) => {}
      Ok(Err(e)) => return Err(e.into()),
    }
    request.flush().await?;
    let remote_writer =
      tagged::body_writer_for(destination.network, Box::new(request.into_inner().into_inner()));

    let mut stats = DuplexPump::new(shutdown.child_token(), self.timeouts)
      .run((local_reader, remote_writer), (remote_reader, local_writer))
      .await?;
    stats.uplink += first_len;
    Ok(stats)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
  };

  use super::TaggedOutbound;
  use crate::{
    common::{
      authentication::{HmacMd5IdHasher, IdHasher, ManualClock, SecretId, TAG_LEN},
      buf::{BufferPool, MultiBuffer, MultiBufferReader, MultiBufferWriter},
      protocol::{tagged, Destination},
    },
    transfer::link_pair,
    util::cancellation::CancellationListener,
  };

  const NOW: u64 = 1_700_000_123;

  fn secret() -> SecretId {
    "5d1a4f0e-1c7b-4a4c-9d3e-52b3b0f7a901".parse().unwrap()
  }

  #[test]
  fn headers_rotate_through_identifiers() {
    let clock = Arc::new(ManualClock::new(NOW));
    let outbound = TaggedOutbound::new("127.0.0.1:1".parse().unwrap(), secret(), 2)
      .with_clock(clock.clone());
    let destination: Destination = "example.net:80".parse().unwrap();
    let alternates = secret().derive_alternates(2);
    let expected = [secret(), alternates[0], alternates[1]];

    for offset in 0..3u64 {
      clock.set(NOW + offset);
      let header = outbound.request_header(&destination).unwrap();
      let timestamp = NOW + offset;
      let id = expected[(timestamp % 3) as usize];
      assert_eq!(
        &header[..TAG_LEN],
        &HmacMd5IdHasher.digest(id.as_bytes(), timestamp)[..]
      );
    }
  }

  #[tokio::test]
  async fn header_and_first_chunk_arrive_together() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    let destination: Destination = "example.net:80".parse().unwrap();
    let header_len = tagged::encode_request(&[0u8; 16], &destination)
      .unwrap()
      .len();

    let accepting = tokio::task::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut received = Vec::new();
      stream.read_to_end(&mut received).await.unwrap();
      stream.write_all(b"pong").await.unwrap();
      stream.shutdown().await.unwrap();
      received
    });

    let pool = BufferPool::new();
    let (mut app, local) = link_pair(4);
    let outbound = TaggedOutbound::new(server, secret(), 0)
      .with_clock(Arc::new(ManualClock::new(NOW)));
    app
      .writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"ping"))
      .await
      .unwrap();
    app.writer.close().await.unwrap();
    let relaying = tokio::task::spawn(async move {
      outbound
        .relay(&destination, local, &CancellationListener::default())
        .await
    });

    let mut echoed = Vec::new();
    while let Some(chunk) = app.reader.read_multi_buffer().await.unwrap() {
      echoed.extend(chunk.to_vec());
    }
    assert_eq!(echoed, b"pong");
    let stats = relaying.await.unwrap().unwrap();
    let received = accepting.await.unwrap();
    assert_eq!(&received[header_len..], b"ping");
    assert_eq!(
      &received[..TAG_LEN],
      &HmacMd5IdHasher.digest(secret().as_bytes(), NOW)[..]
    );
    assert_eq!(stats.uplink, 4);
    assert_eq!(stats.downlink, 4);
  }

  #[tokio::test]
  async fn udp_header_is_unframed_and_first_datagram_is_a_packet() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = listener.local_addr().unwrap();
    let destination: Destination = "udp:192.0.2.53:53".parse().unwrap();
    let tag = HmacMd5IdHasher.digest(secret().as_bytes(), NOW);
    let header = tagged::encode_request(&tag, &destination).unwrap();

    let accepting = tokio::task::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut received = Vec::new();
      stream.read_to_end(&mut received).await.unwrap();
      stream.write_all(&[0, 3, b'a', b'n', b's']).await.unwrap();
      stream.shutdown().await.unwrap();
      received
    });

    let pool = BufferPool::new();
    let (mut app, local) = link_pair(4);
    let outbound = TaggedOutbound::new(server, secret(), 0)
      .with_clock(Arc::new(ManualClock::new(NOW)));
    app
      .writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"qry1"))
      .await
      .unwrap();
    app
      .writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"q2"))
      .await
      .unwrap();
    app.writer.close().await.unwrap();
    let relaying = tokio::task::spawn(async move {
      outbound
        .relay(&destination, local, &CancellationListener::default())
        .await
    });

    let answer = app.reader.read_multi_buffer().await.unwrap().unwrap();
    assert_eq!(answer.to_vec(), b"ans");
    let stats = relaying.await.unwrap().unwrap();
    let received = accepting.await.unwrap();
    assert_eq!(&received[..header.len()], &header[..]);
    assert_eq!(
      &received[header.len()..],
      &[0, 4, b'q', b'r', b'y', b'1', 0, 2, b'q', b'2'][..]
    );
    assert_eq!(stats.uplink, 6);
  }
}
