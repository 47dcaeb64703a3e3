// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::common::buf::{MultiBuffer, MultiBufferReader, MultiBufferWriter};

/// Chunks in flight before a pipe writer waits on its reader
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// An in-memory MultiBuffer channel
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
  let (sender, receiver) = mpsc::channel(capacity.max(1));
  let failure = Arc::new(Mutex::new(None));
  (
    PipeWriter {
      sender: Some(sender),
      failure: Arc::clone(&failure),
    },
    PipeReader { receiver, failure },
  )
}

#[derive(Debug)]
pub struct PipeWriter {
  sender: Option<mpsc::Sender<MultiBuffer>>,
  /// Set before the sender drops, read by the reader once the queue drains
  failure: Arc<Mutex<Option<io::Error>>>,
}

impl PipeWriter {
  pub fn is_closed(&self) -> bool {
    self.sender.as_ref().map_or(true, mpsc::Sender::is_closed)
  }
}

impl MultiBufferWriter for PipeWriter {
  fn write_multi_buffer(&mut self, data: MultiBuffer) -> BoxFuture<'_, io::Result<()>> {
    async move {
      let sender = self
        .sender
        .as_ref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed for writing"))?;
      sender
        .send(data)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }
    .boxed()
  }

  fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.sender = None;
    futures::future::ready(Ok(())).boxed()
  }

  /// The reader sees `error` after any chunks already queued
  fn close_with_error(&mut self, error: io::Error) {
    if let Some(sender) = self.sender.take() {
      *self.failure.lock() = Some(error);
      drop(sender);
    }
  }
}

#[derive(Debug)]
pub struct PipeReader {
  receiver: mpsc::Receiver<MultiBuffer>,
  failure: Arc<Mutex<Option<io::Error>>>,
}

impl MultiBufferReader for PipeReader {
  fn read_multi_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<MultiBuffer>>> {
    async move {
      match self.receiver.recv().await {
        Some(data) => Ok(Some(data)),
        None => match self.failure.lock().take() {
          Some(error) => Err(error),
          None => Ok(None),
        },
      }
    }
    .boxed()
  }
}

/// One endpoint handed to a transfer: a source and a sink
pub struct Link {
  pub reader: Box<dyn MultiBufferReader>,
  pub writer: Box<dyn MultiBufferWriter>,
}

impl Link {
  pub fn new<R, W>(reader: R, writer: W) -> Self
  where
    R: MultiBufferReader + 'static,
    W: MultiBufferWriter + 'static,
  {
    Self {
      reader: Box::new(reader),
      writer: Box::new(writer),
    }
  }

  pub fn into_parts(self) -> (Box<dyn MultiBufferReader>, Box<dyn MultiBufferWriter>) {
    (self.reader, self.writer)
  }
}

impl std::fmt::Debug for Link {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Link").finish_non_exhaustive()
  }
}

/// Two crossed links: what one writes, the other reads
pub fn link_pair(capacity: usize) -> (Link, Link) {
  let (near_writer, far_reader) = pipe(capacity);
  let (far_writer, near_reader) = pipe(capacity);
  (
    Link::new(near_reader, near_writer),
    Link::new(far_reader, far_writer),
  )
}
