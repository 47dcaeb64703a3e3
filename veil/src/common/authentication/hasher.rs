// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

use hmac::{Hmac, Mac};
use md5::Md5;

use super::identity::Timestamp;

pub const TAG_LEN: usize = 16;

/// Opaque per-connection proof of identity, presented in place of a credential
pub type AuthTag = [u8; TAG_LEN];

/// Produces the tag a peer holding `id` presents at `timestamp`
pub trait IdHasher: Send + Sync {
  fn digest(&self, id: &[u8], timestamp: Timestamp) -> AuthTag;
}

/// HMAC-MD5 keyed by the identifier over the big-endian timestamp
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacMd5IdHasher;

impl IdHasher for HmacMd5IdHasher {
  fn digest(&self, id: &[u8], timestamp: Timestamp) -> AuthTag {
    let mut mac = <Hmac<Md5> as Mac>::new_from_slice(id)
      .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(&timestamp.to_be_bytes());
    mac.finalize().into_bytes().into()
  }
}

/// Wall-clock source for bucket generation
pub trait Clock: Send + Sync {
  fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Timestamp {
    std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|elapsed| elapsed.as_secs())
      .unwrap_or(0)
  }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
  pub fn new(now: Timestamp) -> Self {
    Self(AtomicU64::new(now))
  }

  pub fn set(&self, now: Timestamp) {
    self.0.store(now, Ordering::SeqCst);
  }

  pub fn advance(&self, seconds: u64) {
    self.0.fetch_add(seconds, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Timestamp {
    self.0.load(Ordering::SeqCst)
  }
}
