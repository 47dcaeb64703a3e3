// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};
use md5::{Digest, Md5};
use uuid::Uuid;

/// Seconds since the Unix epoch
pub type Timestamp = u64;

pub const SECRET_ID_LEN: usize = 16;

// Salts of the alternate-id derivation chain
const ALTERNATE_ID_SALT: &[u8] = b"16167dc8-16b6-4e6d-b8bb-65dd68113a81";
const ALTERNATE_ID_COLLISION_SALT: &[u8] = b"533eff8a-4113-4b10-b5ce-0f5d76b98cd2";

/// A fixed-length binary identifier that peers prove knowledge of
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecretId([u8; SECRET_ID_LEN]);

impl SecretId {
  pub fn new(bytes: [u8; SECRET_ID_LEN]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; SECRET_ID_LEN] {
    &self.0
  }

  pub fn uuid(&self) -> Uuid {
    Uuid::from_bytes(self.0)
  }

  fn next_in_chain(&self) -> SecretId {
    let mut hasher = Md5::new();
    hasher.update(self.0);
    hasher.update(ALTERNATE_ID_SALT);
    loop {
      let candidate = SecretId(hasher.clone().finalize().into());
      if candidate != *self {
        return candidate;
      }
      hasher.update(ALTERNATE_ID_COLLISION_SALT);
    }
  }

  /// Derives `count` rotation identifiers, each hashed from its predecessor
  pub fn derive_alternates(&self, count: u16) -> Vec<SecretId> {
    let mut previous = *self;
    (0..count)
      .map(|_| {
        previous = previous.next_in_chain();
        previous
      })
      .collect()
  }
}

impl From<Uuid> for SecretId {
  fn from(uuid: Uuid) -> Self {
    Self(uuid.into_bytes())
  }
}

impl std::str::FromStr for SecretId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Into::into)
  }
}

impl std::fmt::Debug for SecretId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "SecretId({})", self.uuid())
  }
}

impl std::fmt::Display for SecretId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.uuid(), f)
  }
}

/// Protocol-specific account data carried alongside an identity
///
/// Authentication never inspects the payload; codecs recover their concrete
/// type through [Identity::account].
pub trait AccountPayload: DowncastSync + std::fmt::Debug {}
impl_downcast!(sync AccountPayload);

impl AccountPayload for () {}

#[derive(Debug)]
pub struct Identity {
  display_key: String,
  level: u32,
  primary: SecretId,
  alternates: Vec<SecretId>,
  account: Arc<dyn AccountPayload>,
}

impl Identity {
  pub fn new<K: Into<String>>(display_key: K, level: u32, primary: SecretId) -> Self {
    Self {
      display_key: display_key.into(),
      level,
      primary,
      alternates: Vec::new(),
      account: Arc::new(()),
    }
  }

  pub fn with_alternates(mut self, alternates: Vec<SecretId>) -> Self {
    self.alternates = alternates;
    self
  }

  /// Shorthand for [SecretId::derive_alternates] of the primary identifier
  pub fn with_alternate_count(self, count: u16) -> Self {
    let alternates = self.primary.derive_alternates(count);
    self.with_alternates(alternates)
  }

  pub fn with_account<A: AccountPayload>(mut self, account: A) -> Self {
    self.account = Arc::new(account);
    self
  }

  pub fn display_key(&self) -> &str {
    &self.display_key
  }

  /// Display keys compare case-insensitively
  pub fn normalized_key(&self) -> String {
    normalize_key(&self.display_key)
  }

  pub fn level(&self) -> u32 {
    self.level
  }

  pub fn primary(&self) -> &SecretId {
    &self.primary
  }

  pub fn alternates(&self) -> &[SecretId] {
    &self.alternates
  }

  /// The primary identifier followed by every alternate, in order
  pub fn identifiers(&self) -> impl Iterator<Item = &SecretId> {
    std::iter::once(&self.primary).chain(self.alternates.iter())
  }

  pub fn account<A: AccountPayload>(&self) -> Option<&A> {
    self.account.downcast_ref::<A>()
  }
}

pub(crate) fn normalize_key(key: &str) -> String {
  key.to_lowercase()
}
