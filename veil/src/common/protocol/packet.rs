// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Datagrams carried over a byte stream, each prefixed with its u16 big-endian length
use std::{io, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::traits::FramingError;
use crate::common::buf::{BufferPool, MultiBuffer, MultiBufferReader, MultiBufferWriter};

pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

/// The length prefix announcing a packet of `length` bytes
pub fn length_prefix(length: usize) -> Result<[u8; 2], FramingError> {
  u16::try_from(length)
    .map(u16::to_be_bytes)
    .map_err(|_| FramingError::OversizedPacket(length))
}

pub struct PacketReader<R> {
  inner: R,
  pool: Arc<BufferPool>,
}

impl<R> PacketReader<R> {
  pub fn new(inner: R) -> Self {
    Self::with_pool(inner, BufferPool::shared())
  }

  pub fn with_pool(inner: R, pool: Arc<BufferPool>) -> Self {
    Self { inner, pool }
  }
}

impl<R: AsyncRead + Send + Unpin> MultiBufferReader for PacketReader<R> {
  /// Each chunk is exactly one packet; only a stream ending at a packet boundary is a clean end
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>> {
    async move {
      let high = match self.inner.read_u8().await {
        Ok(high) => high,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
      };
      let low = self.inner.read_u8().await?;
      let length = usize::from(u16::from_be_bytes([high, low]));
      let mut buffer = self.pool.acquire(length);
      self.inner.read_exact(&mut buffer.spare_mut()[..length]).await?;
      buffer.commit(length);
      Ok(Some(MultiBuffer::from(buffer)))
    }
    .boxed()
  }
}

pub struct PacketWriter<W> {
  inner: W,
}

impl<W> PacketWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

impl<W: AsyncWrite + Send + Unpin> MultiBufferWriter for PacketWriter<W> {
  /// Writes the whole chunk as a single packet
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    async move {
      let prefix = length_prefix(data.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
      self.inner.write_all(&prefix).await?;
      for buffer in data {
        self.inner.write_all(buffer.bytes()).await?;
      }
      self.inner.flush().await
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.inner.shutdown().boxed()
  }
}
