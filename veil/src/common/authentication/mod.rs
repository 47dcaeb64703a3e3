// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Identity registration and tag-based authentication of inbound connections
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

mod hasher;
mod identity;
mod registry;
mod timed_table;

pub use hasher::{AuthTag, Clock, HmacMd5IdHasher, IdHasher, ManualClock, SystemClock, TAG_LEN};
pub use identity::{AccountPayload, Identity, SecretId, Timestamp, SECRET_ID_LEN};
pub use registry::IdentityRegistry;
pub use timed_table::{
  TableConfig, TimedIdentityTable, DEFAULT_REFRESH_INTERVAL, DEFAULT_WINDOW_SECS,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
  #[error("Authentication tag must be 16 bytes, got {length}")]
  MalformedTag { length: usize },
  #[error("Authentication tag does not match any registered identity")]
  UnknownTag,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("An identity with display key {0:?} is already registered")]
  DuplicateIdentity(String),
  #[error("No identity with display key {0:?} is registered")]
  IdentityNotFound(String),
  #[error("Identities without a display key cannot be removed")]
  EmptyDisplayKey,
}

/// Identity matched by a tag, with the bucket the tag was generated for
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
  pub identity: Arc<Identity>,
  pub timestamp: Timestamp,
}

pub trait TagResolver: Send + Sync {
  fn resolve(&self, tag: &[u8]) -> Result<ResolvedIdentity, AuthenticationError>;
}

impl<T: TagResolver + ?Sized> TagResolver for Arc<T> {
  fn resolve(&self, tag: &[u8]) -> Result<ResolvedIdentity, AuthenticationError> {
    (**self).resolve(tag)
  }
}

/// Runtime management of the identities an inbound handler accepts
pub trait IdentityManager: Send + Sync {
  fn add_identity(&self, identity: Identity) -> BoxFuture<'_, Result<(), RegistryError>>;

  fn remove_identity<'a>(&'a self, display_key: &'a str)
    -> BoxFuture<'a, Result<(), RegistryError>>;
}

impl IdentityManager for IdentityRegistry {
  fn add_identity(&self, identity: Identity) -> BoxFuture<'_, Result<(), RegistryError>> {
    futures::future::ready(self.add(identity).map(|_| ())).boxed()
  }

  fn remove_identity<'a>(
    &'a self,
    display_key: &'a str,
  ) -> BoxFuture<'a, Result<(), RegistryError>> {
    futures::future::ready(self.remove(display_key).map(|_| ())).boxed()
  }
}
