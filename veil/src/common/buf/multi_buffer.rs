// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{collections::VecDeque, sync::Arc};

use super::{
  buffer::Buffer,
  pool::{BufferPool, BASE_SIZE},
};

/// An ordered sequence of [Buffer]s owned as one transfer unit
///
/// Writers receiving a `MultiBuffer` take ownership of every segment and
/// release each one as it is consumed.
#[derive(Debug, Default)]
pub struct MultiBuffer {
  buffers: VecDeque<Buffer>,
}

impl MultiBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(segments: usize) -> Self {
    Self {
      buffers: VecDeque::with_capacity(segments),
    }
  }

  /// Copies `data` into base-size segments drawn from `pool`
  pub fn copy_from_slice(pool: &Arc<BufferPool>, data: &[u8]) -> Self {
    let mut mb = Self::with_capacity((data.len() + BASE_SIZE - 1) / BASE_SIZE);
    for chunk in data.chunks(BASE_SIZE) {
      let mut buffer = pool.acquire(BASE_SIZE);
      buffer.append(chunk);
      mb.push(buffer);
    }
    mb
  }

  pub fn push(&mut self, buffer: Buffer) {
    self.buffers.push_back(buffer);
  }

  pub fn extend(&mut self, other: MultiBuffer) {
    self.buffers.extend(other.buffers);
  }

  /// Total number of content bytes across all segments
  pub fn len(&self) -> usize {
    self.buffers.iter().map(Buffer::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.buffers.iter().all(Buffer::is_empty)
  }

  pub fn segment_count(&self) -> usize {
    self.buffers.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
    self.buffers.iter()
  }

  /// Detaches the first segment, transferring its ownership to the caller
  pub fn pop_front(&mut self) -> Option<Buffer> {
    self.buffers.pop_front()
  }

  /// Moves bytes from the front into `out`, releasing each segment once drained
  pub fn read_into(&mut self, out: &mut [u8]) -> usize {
    let mut total = 0;
    while total < out.len() {
      let front = match self.buffers.front_mut() {
        Some(front) => front,
        None => break,
      };
      total += front.read_into(&mut out[total..]);
      if front.is_empty() {
        if let Some(drained) = self.buffers.pop_front() {
          drained.release();
        }
      }
    }
    total
  }

  /// Copies the content into a contiguous vector without consuming it
  pub fn to_vec(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(self.len());
    for buffer in self.buffers.iter() {
      out.extend_from_slice(buffer.bytes());
    }
    out
  }

  /// Releases every contained segment
  pub fn release(self) {
    for buffer in self.buffers {
      buffer.release();
    }
  }
}

impl From<Buffer> for MultiBuffer {
  fn from(buffer: Buffer) -> Self {
    let mut mb = Self::with_capacity(1);
    mb.push(buffer);
    mb
  }
}

impl FromIterator<Buffer> for MultiBuffer {
  fn from_iter<T: IntoIterator<Item = Buffer>>(iter: T) -> Self {
    Self {
      buffers: iter.into_iter().collect(),
    }
  }
}

impl IntoIterator for MultiBuffer {
  type Item = Buffer;
  type IntoIter = std::collections::vec_deque::IntoIter<Buffer>;

  fn into_iter(self) -> Self::IntoIter {
    self.buffers.into_iter()
  }
}
