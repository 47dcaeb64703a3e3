// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::pool::{BufferPool, BASE_SIZE};

pub(super) enum Origin {
  Pooled { pool: Arc<BufferPool>, class: usize },
  Unpooled,
}

/// A bounded view `[start, end)` over a fixed-capacity backing block
///
/// Buffers are move-only; whichever component owns one is responsible for
/// releasing it, either through [Buffer::release] or by dropping it. The
/// backing block returns to its size class once released, and may be handed
/// to a later acquirer with stale content beyond its tracked view.
pub struct Buffer {
  block: Box<[u8]>,
  start: usize,
  end: usize,
  origin: Origin,
}

impl Buffer {
  pub(super) fn from_parts(block: Box<[u8]>, origin: Origin) -> Self {
    Self {
      block,
      start: 0,
      end: 0,
      origin,
    }
  }

  /// An empty buffer of the base size class from the shared pool
  pub fn new() -> Self {
    BufferPool::shared().acquire(BASE_SIZE)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    BufferPool::shared().acquire(capacity)
  }

  pub fn capacity(&self) -> usize {
    self.block.len()
  }

  pub fn len(&self) -> usize {
    self.end - self.start
  }

  pub fn is_empty(&self) -> bool {
    self.start == self.end
  }

  /// True once no more bytes can be appended
  pub fn is_full(&self) -> bool {
    self.end == self.block.len()
  }

  pub fn is_pooled(&self) -> bool {
    matches!(self.origin, Origin::Pooled { .. })
  }

  pub fn bytes(&self) -> &[u8] {
    &self.block[self.start..self.end]
  }

  pub fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.block[self.start..self.end]
  }

  /// Non-copying sub-view relative to the current start
  ///
  /// Panics if the range escapes the tracked view.
  pub fn bytes_range(&self, range: std::ops::Range<usize>) -> &[u8] {
    assert!(range.end <= self.len(), "range escapes buffer view");
    &self.block[self.start + range.start..self.start + range.end]
  }

  /// Unused tail of the block, writable ahead of a [Buffer::commit]
  pub fn spare_mut(&mut self) -> &mut [u8] {
    &mut self.block[self.end..]
  }

  /// Extends the view over `n` bytes previously written into [Buffer::spare_mut]
  pub fn commit(&mut self, n: usize) {
    assert!(self.end + n <= self.block.len(), "commit beyond capacity");
    self.end += n;
  }

  /// Appends as much of `data` as fits, returning the number of bytes taken
  pub fn append(&mut self, data: &[u8]) -> usize {
    let n = std::cmp::min(data.len(), self.block.len() - self.end);
    self.block[self.end..self.end + n].copy_from_slice(&data[..n]);
    self.end += n;
    n
  }

  /// Lets `supplier` fill the unused tail, committing whatever it reports as written
  pub fn append_with<E>(
    &mut self,
    supplier: impl FnOnce(&mut [u8]) -> Result<usize, E>,
  ) -> Result<usize, E> {
    let n = supplier(self.spare_mut())?;
    self.commit(n);
    Ok(n)
  }

  /// Moves bytes out of the front of the view into `out`
  pub fn read_into(&mut self, out: &mut [u8]) -> usize {
    let n = std::cmp::min(out.len(), self.len());
    out[..n].copy_from_slice(&self.block[self.start..self.start + n]);
    self.advance(n);
    n
  }

  /// Drops a consumed prefix of `n` bytes from the view
  pub fn advance(&mut self, n: usize) {
    assert!(n <= self.len(), "advance beyond buffer view");
    self.start += n;
    if self.start == self.end {
      self.clear();
    }
  }

  /// Narrows the view to `[from, to)` relative to the current start
  pub fn resize(&mut self, from: usize, to: usize) {
    assert!(from <= to, "invalid buffer resize");
    assert!(self.start + to <= self.block.len(), "resize beyond capacity");
    self.end = self.start + to;
    self.start += from;
  }

  pub fn clear(&mut self) {
    self.start = 0;
    self.end = 0;
  }

  /// Returns the backing block to its pool; oversized blocks are discarded
  pub fn release(self) {
    drop(self)
  }
}

impl Default for Buffer {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    if let Origin::Pooled { pool, class } = &self.origin {
      let block = std::mem::take(&mut self.block);
      pool.recycle(*class, block);
    }
  }
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Buffer")
      .field("start", &self.start)
      .field("end", &self.end)
      .field("capacity", &self.capacity())
      .field("pooled", &self.is_pooled())
      .finish()
  }
}

impl std::io::Write for Buffer {
  fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
    Ok(self.append(data))
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}
