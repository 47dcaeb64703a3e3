// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  sync::atomic::{AtomicU64, Ordering},
};

use super::activity::ActivityTimer;
use crate::common::buf::{MultiBufferReader, MultiBufferWriter};

/// Running byte total, readable while a copy is in flight
#[derive(Debug, Default)]
pub struct SizeCounter(AtomicU64);

impl SizeCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, bytes: u64) {
    self.0.fetch_add(bytes, Ordering::Relaxed);
  }

  pub fn get(&self) -> u64 {
    self.0.load(Ordering::Relaxed)
  }
}

/// Hooks invoked for every non-empty chunk a [copy] moves
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyOptions<'a> {
  timer: Option<&'a ActivityTimer>,
  counter: Option<&'a SizeCounter>,
}

impl<'a> CopyOptions<'a> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update_activity(mut self, timer: &'a ActivityTimer) -> Self {
    self.timer = Some(timer);
    self
  }

  pub fn count_size(mut self, counter: &'a SizeCounter) -> Self {
    self.counter = Some(counter);
    self
  }
}

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
  #[error("Failed reading from source")]
  Read(#[source] io::Error),
  #[error("Failed writing to destination")]
  Write(#[source] io::Error),
}

impl CopyError {
  pub fn into_io_error(self) -> io::Error {
    match self {
      CopyError::Read(e) | CopyError::Write(e) => e,
    }
  }
}

/// Moves chunks from `reader` to `writer` until the reader reports end of stream
///
/// Ownership of each chunk passes to the writer in a single call. The writer
/// is not closed; that is left to the caller.
pub async fn copy<R, W>(
  reader: &mut R,
  writer: &mut W,
  options: CopyOptions<'_>,
) -> Result<u64, CopyError>
where
  R: MultiBufferReader + ?Sized,
  W: MultiBufferWriter + ?Sized,
{
  let mut total = 0u64;
  loop {
    let chunk = match reader.read_multi_buffer().await.map_err(CopyError::Read)? {
      Some(chunk) => chunk,
      None => return Ok(total),
    };
    if chunk.is_empty() {
      chunk.release();
      continue;
    }
    let length = chunk.len() as u64;
    if let Some(timer) = options.timer {
      timer.update();
    }
    if let Some(counter) = options.counter {
      counter.add(length);
    }
    writer.write_multi_buffer(chunk).await.map_err(CopyError::Write)?;
    total += length;
  }
}
