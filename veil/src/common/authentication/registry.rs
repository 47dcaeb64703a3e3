// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use super::{
  identity::{normalize_key, Identity},
  timed_table::TimedIdentityTable,
  AuthenticationError, RegistryError, ResolvedIdentity, TagResolver,
};

/// Keys identities by case-insensitive display key in front of a [TimedIdentityTable]
///
/// Identities without a display key are accepted but can never be removed.
#[derive(Debug)]
pub struct IdentityRegistry {
  by_key: DashMap<String, Arc<Identity>>,
  table: Arc<TimedIdentityTable>,
}

impl IdentityRegistry {
  pub fn new(table: Arc<TimedIdentityTable>) -> Self {
    Self {
      by_key: DashMap::new(),
      table,
    }
  }

  pub fn table(&self) -> &Arc<TimedIdentityTable> {
    &self.table
  }

  #[tracing::instrument(level = "debug", skip(self, identity), fields(key = identity.display_key()), err)]
  pub fn add(&self, identity: Identity) -> Result<Arc<Identity>, RegistryError> {
    let identity = Arc::new(identity);
    if identity.display_key().is_empty() {
      self.table.add(Arc::clone(&identity));
      return Ok(identity);
    }
    match self.by_key.entry(identity.normalized_key()) {
      Entry::Occupied(_) => Err(RegistryError::DuplicateIdentity(
        identity.display_key().to_string(),
      )),
      Entry::Vacant(vacant) => {
        // Entry lock is held until the table has the identity, so a concurrent
        // remove cannot observe a half-registered key
        self.table.add(Arc::clone(&identity));
        vacant.insert(Arc::clone(&identity));
        Ok(identity)
      }
    }
  }

  #[tracing::instrument(level = "debug", skip(self), err)]
  pub fn remove(&self, display_key: &str) -> Result<Arc<Identity>, RegistryError> {
    if display_key.is_empty() {
      return Err(RegistryError::EmptyDisplayKey);
    }
    let (_, identity) = self
      .by_key
      .remove(&normalize_key(display_key))
      .ok_or_else(|| RegistryError::IdentityNotFound(display_key.to_string()))?;
    self.table.remove(display_key);
    Ok(identity)
  }

  pub fn get(&self, display_key: &str) -> Option<Arc<Identity>> {
    self
      .by_key
      .get(&normalize_key(display_key))
      .map(|entry| Arc::clone(entry.value()))
  }

  pub fn len(&self) -> usize {
    self.table.identity_count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl TagResolver for IdentityRegistry {
  fn resolve(&self, tag: &[u8]) -> Result<ResolvedIdentity, AuthenticationError> {
    self.table.lookup(tag)
  }
}
