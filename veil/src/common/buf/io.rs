// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! MultiBuffer-oriented reader and writer seams, and their byte-stream adapters

use std::{io, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Buffer, BufferPool, MultiBuffer, BASE_SIZE};

/// A source producing one owned [MultiBuffer] per read
pub trait MultiBufferReader: Send {
  /// Reads the next chunk; `Ok(None)` marks a clean end of stream
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>>;
}

/// A sink taking ownership of each [MultiBuffer] written to it
pub trait MultiBufferWriter: Send {
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>>;

  /// Half-closes the sink once its source is exhausted
  fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;

  /// Closes the sink after its source failed, so the far end can tell a
  /// truncated stream from a complete one
  ///
  /// Sinks without a way to carry `error` leave it to their drop.
  fn close_with_error(&mut self, error: io::Error) {
    let _ = error;
  }
}

impl<T: MultiBufferReader + ?Sized> MultiBufferReader for Box<T> {
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>> {
    (**self).read_multi_buffer()
  }
}

impl<T: MultiBufferWriter + ?Sized> MultiBufferWriter for Box<T> {
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    (**self).write_multi_buffer(data)
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    (**self).close()
  }

  fn close_with_error(&mut self, error: io::Error) {
    (**self).close_with_error(error)
  }
}

// Read sizes climb the class ladder while reads fill their buffer, and step
// back down once they come back less than a quarter full.
const MAX_READ_CLASS: usize = 2;

#[derive(Debug)]
struct ReadSizing {
  class: usize,
}

impl ReadSizing {
  fn capacity(&self) -> usize {
    BufferPool::class_capacity(self.class)
  }

  fn adjust(&mut self, read: usize, capacity: usize) {
    if read == capacity && self.class < MAX_READ_CLASS {
      self.class += 1;
    } else if read < capacity / 4 && self.class > 0 {
      self.class -= 1;
    }
  }
}

/// Reads pooled buffers from a byte stream
pub struct StreamReader<R> {
  inner: R,
  pool: Arc<BufferPool>,
  sizing: ReadSizing,
}

impl<R> StreamReader<R> {
  pub fn new(inner: R) -> Self {
    Self::with_pool(inner, BufferPool::shared())
  }

  pub fn with_pool(inner: R, pool: Arc<BufferPool>) -> Self {
    Self {
      inner,
      pool,
      sizing: ReadSizing { class: 0 },
    }
  }

  pub fn into_inner(self) -> R {
    self.inner
  }
}

impl<R: AsyncRead + Send + Unpin> MultiBufferReader for StreamReader<R> {
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>> {
    async move {
      let mut buffer = self.pool.acquire(self.sizing.capacity());
      let read = self.inner.read(buffer.spare_mut()).await?;
      if read == 0 {
        return Ok(None);
      }
      buffer.commit(read);
      self.sizing.adjust(read, buffer.capacity());
      Ok(Some(MultiBuffer::from(buffer)))
    }
    .boxed()
  }
}

/// Writes each segment of a [MultiBuffer] to a byte stream, releasing them as they drain
pub struct StreamWriter<W> {
  inner: W,
}

impl<W> StreamWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

impl<W: AsyncWrite + Send + Unpin> MultiBufferWriter for StreamWriter<W> {
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    async move {
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

/// Coalesces writes into a single pooled buffer until flushed
///
/// Used to send a protocol header and the first payload chunk as one
/// segment; once [BufferedWriter::set_buffered] turns buffering off, writes
/// pass straight through.
pub struct BufferedWriter<W> {
  inner: W,
  pending: Option<Buffer>,
  buffered: bool,
}

impl<W: MultiBufferWriter> BufferedWriter<W> {
  pub fn new(inner: W) -> Self {
    Self {
      inner,
      pending: None,
      buffered: true,
    }
  }

  pub async fn write_bytes(&mut self, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
      let pending = self.pending.get_or_insert_with(|| Buffer::with_capacity(BASE_SIZE));
      let taken = pending.append(data);
      data = &data[taken..];
      if !self.buffered || pending.is_full() {
        self.flush().await?;
      }
    }
    Ok(())
  }

  pub async fn flush(&mut self) -> io::Result<()> {
    match self.pending.take() {
      Some(pending) if !pending.is_empty() => {
        self
          .inner
          .write_multi_buffer(MultiBuffer::from(pending))
          .await
      }
      _ => Ok(()),
    }
  }

  /// Flushes pending content before switching to pass-through mode
  pub async fn set_buffered(&mut self, buffered: bool) -> io::Result<()> {
    self.buffered = buffered;
    if !buffered {
      self.flush().await?;
    }
    Ok(())
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

impl<W: MultiBufferWriter> MultiBufferWriter for BufferedWriter<W> {
  fn write_multi_buffer(&mut self, mut data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    async move {
      if !self.buffered {
        self.flush().await?;
        return self.inner.write_multi_buffer(data).await;
      }
      while !data.is_empty() {
        let pending = self.pending.get_or_insert_with(|| Buffer::with_capacity(BASE_SIZE));
        let copied = data.read_into(pending.spare_mut());
        pending.commit(copied);
        if pending.is_full() {
          self.flush().await?;
        }
      }
      data.release();
      Ok(())
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    async move {
      self.flush().await?;
      self.inner.close().await
    }
    .boxed()
  }

  fn close_with_error(&mut self, error: io::Error) {
    self.pending = None;
    self.inner.close_with_error(error);
  }
}

#[cfg(test)]
mod tests {
  use futures::future::{BoxFuture, FutureExt};
  use std::io;

  use super::{
    super::{BufferPool, MultiBuffer},
    BufferedWriter, MultiBufferReader, MultiBufferWriter, StreamReader, StreamWriter,
  };

  #[derive(Default)]
  struct RecordingWriter {
    writes: Vec<Vec<u8>>,
    closed: bool,
  }

  impl MultiBufferWriter for RecordingWriter {
    fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
      self.writes.push(data.to_vec());
      data.release();
      futures::future::ready(Ok(())).boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
      self.closed = true;
      futures::future::ready(Ok(())).boxed()
    }
  }

  #[tokio::test]
  async fn stream_reader_reports_end_of_stream() {
    let pool = BufferPool::new();
    let mut reader = StreamReader::with_pool(&b"payload"[..], pool.clone());
    let first = reader.read_multi_buffer().await.unwrap().unwrap();
    assert_eq!(first.to_vec(), b"payload");
    first.release();
    assert!(reader.read_multi_buffer().await.unwrap().is_none());
    assert_eq!(pool.stats(0).outstanding, 0);
  }

  #[tokio::test]
  async fn stream_reader_grows_read_size() {
    let pool = BufferPool::new();
    let data = vec![1u8; 64 * 1024];
    let mut reader = StreamReader::with_pool(&data[..], pool.clone());
    let first = reader.read_multi_buffer().await.unwrap().unwrap();
    assert_eq!(first.len(), BufferPool::class_capacity(0));
    let second = reader.read_multi_buffer().await.unwrap().unwrap();
    assert_eq!(second.len(), BufferPool::class_capacity(1));
  }

  #[tokio::test]
  async fn stream_writer_preserves_order() {
    let pool = BufferPool::new();
    let mut writer = StreamWriter::new(Vec::new());
    let mut mb = MultiBuffer::copy_from_slice(&pool, b"first ");
    mb.extend(MultiBuffer::copy_from_slice(&pool, b"second"));
    writer.write_multi_buffer(mb).await.unwrap();
    assert_eq!(writer.into_inner(), b"first second");
    assert_eq!(pool.stats(0).outstanding, 0);
  }

  #[tokio::test]
  async fn buffered_writer_coalesces_until_unbuffered() {
    let pool = BufferPool::new();
    let mut writer = BufferedWriter::new(RecordingWriter::default());
    writer.write_bytes(b"header|").await.unwrap();
    writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"body"))
      .await
      .unwrap();
    writer.set_buffered(false).await.unwrap();
    writer
      .write_multi_buffer(MultiBuffer::copy_from_slice(&pool, b"tail"))
      .await
      .unwrap();
    writer.close().await.unwrap();

    let inner = writer.into_inner();
    assert_eq!(inner.writes, vec![b"header|body".to_vec(), b"tail".to_vec()]);
    assert!(inner.closed);
    assert_eq!(pool.stats(0).outstanding, 0);
  }
}
