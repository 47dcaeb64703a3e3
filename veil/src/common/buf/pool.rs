// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Size-classed recycling of byte blocks shared by every connection

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc, OnceLock,
};

use parking_lot::Mutex;

use super::buffer::{Buffer, Origin};

/// Capacity of the smallest size class, and of a default [Buffer]
pub const BASE_SIZE: usize = 2 * 1024;
/// Each class holds blocks this many times larger than the previous one
pub const SIZE_MULTIPLIER: usize = 4;
/// Number of pooled size classes; larger requests bypass the pool entirely
pub const NUM_CLASSES: usize = 5;

// Idle blocks retained per class are capped by bytes rather than count
const IDLE_BYTES_PER_CLASS: usize = 8 * 1024 * 1024;
const MIN_IDLE_BLOCKS: usize = 4;

struct SizeClass {
  capacity: usize,
  max_idle: usize,
  idle: Mutex<Vec<Box<[u8]>>>,
  outstanding: AtomicUsize,
}

impl SizeClass {
  fn new(capacity: usize) -> Self {
    Self {
      capacity,
      max_idle: std::cmp::max(IDLE_BYTES_PER_CLASS / capacity, MIN_IDLE_BLOCKS),
      idle: Mutex::new(Vec::new()),
      outstanding: AtomicUsize::new(0),
    }
  }
}

/// Occupancy of a single size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
  pub capacity: usize,
  /// Blocks currently owned by a [Buffer]
  pub outstanding: usize,
  /// Blocks waiting in the free list
  pub idle: usize,
}

pub struct BufferPool {
  classes: [SizeClass; NUM_CLASSES],
}

impl std::fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list()
      .entries((0..NUM_CLASSES).map(|class| self.stats(class)))
      .finish()
  }
}

impl BufferPool {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      classes: std::array::from_fn(|idx| SizeClass::new(Self::class_capacity(idx))),
    })
  }

  /// The process-wide pool used by [Buffer::new] and the stream adapters
  pub fn shared() -> Arc<Self> {
    static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();
    SHARED.get_or_init(BufferPool::new).clone()
  }

  pub const fn class_capacity(class: usize) -> usize {
    BASE_SIZE * SIZE_MULTIPLIER.pow(class as u32)
  }

  pub const fn largest_class_capacity() -> usize {
    Self::class_capacity(NUM_CLASSES - 1)
  }

  /// Smallest class able to hold `capacity` bytes, or `None` if it exceeds every class
  pub fn class_for(capacity: usize) -> Option<usize> {
    (0..NUM_CLASSES).find(|&class| capacity <= Self::class_capacity(class))
  }

  /// Produces an empty buffer holding at least `capacity` bytes
  ///
  /// Requests above [BufferPool::largest_class_capacity] are served by a
  /// one-off allocation that is discarded, not recycled, on release.
  pub fn acquire(self: &Arc<Self>, capacity: usize) -> Buffer {
    let class = match Self::class_for(capacity) {
      Some(class) => class,
      None => {
        tracing::trace!(capacity, "unpooled buffer allocation");
        return Buffer::from_parts(vec![0u8; capacity].into_boxed_slice(), Origin::Unpooled);
      }
    };
    let size_class = &self.classes[class];
    size_class.outstanding.fetch_add(1, Ordering::Relaxed);
    let block = size_class
      .idle
      .lock()
      .pop()
      .unwrap_or_else(|| vec![0u8; size_class.capacity].into_boxed_slice());
    Buffer::from_parts(
      block,
      Origin::Pooled {
        pool: Arc::clone(self),
        class,
      },
    )
  }

  pub(super) fn recycle(&self, class: usize, block: Box<[u8]>) {
    let size_class = &self.classes[class];
    debug_assert_eq!(block.len(), size_class.capacity);
    size_class.outstanding.fetch_sub(1, Ordering::Relaxed);
    let mut idle = size_class.idle.lock();
    if idle.len() < size_class.max_idle {
      idle.push(block);
    }
  }

  pub fn stats(&self, class: usize) -> ClassStats {
    let size_class = &self.classes[class];
    ClassStats {
      capacity: size_class.capacity,
      outstanding: size_class.outstanding.load(Ordering::Relaxed),
      idle: size_class.idle.lock().len(),
    }
  }
}
