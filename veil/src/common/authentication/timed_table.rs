// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Time-windowed index from authentication tags to the identities that produced them
//!
//! Every registered identifier is hashed against each second of a window
//! around the current time, so that authenticating a connection is a single
//! map lookup. A periodic refresh extends each identity's hashes forward from
//! its watermark and prunes buckets that have aged out of the window.

use std::{
  collections::HashMap,
  ops::ControlFlow,
  sync::{Arc, Weak},
  time::Duration,
};

use parking_lot::{Mutex, RwLock};

use super::{
  hasher::{AuthTag, Clock, HmacMd5IdHasher, IdHasher, SystemClock, TAG_LEN},
  identity::{normalize_key, Identity, Timestamp},
  AuthenticationError, ResolvedIdentity, TagResolver,
};
use crate::util::periodic::PeriodicTask;

/// Seconds either side of now for which a tag remains valid
pub const DEFAULT_WINDOW_SECS: u64 = 120;
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
  pub window_secs: u64,
  pub refresh_interval: Duration,
}

impl Default for TableConfig {
  fn default() -> Self {
    Self {
      window_secs: DEFAULT_WINDOW_SECS,
      refresh_interval: DEFAULT_REFRESH_INTERVAL,
    }
  }
}

struct Registered {
  identity: Arc<Identity>,
  /// Latest bucket hashes have been generated through
  watermark: Timestamp,
}

#[derive(Clone)]
struct HashEntry {
  identity: Arc<Identity>,
  /// Bucket, as seconds past the table's base time
  offset: u32,
}

#[derive(Default)]
struct TableState {
  registered: Vec<Registered>,
  index: HashMap<AuthTag, HashEntry>,
}

pub struct TimedIdentityTable {
  state: RwLock<TableState>,
  hasher: Arc<dyn IdHasher>,
  clock: Arc<dyn Clock>,
  base_time: Timestamp,
  config: TableConfig,
  refresh_task: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for TimedIdentityTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.state.read();
    f.debug_struct("TimedIdentityTable")
      .field("identities", &state.registered.len())
      .field("entries", &state.index.len())
      .field("base_time", &self.base_time)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl TimedIdentityTable {
  /// Builds a table without a refresh task; see [TimedIdentityTable::start_refresh]
  pub fn new(hasher: Arc<dyn IdHasher>, clock: Arc<dyn Clock>, config: TableConfig) -> Arc<Self> {
    let base_time = clock.now().saturating_sub(config.window_secs * 2);
    Arc::new(Self {
      state: RwLock::new(TableState::default()),
      hasher,
      clock,
      base_time,
      config,
      refresh_task: Mutex::new(None),
    })
  }

  /// A table using the system clock and HMAC-MD5 tags, refreshing in the background
  ///
  /// Must be called within a tokio runtime.
  pub fn spawn_default() -> Arc<Self> {
    let table = Self::new(
      Arc::new(HmacMd5IdHasher),
      Arc::new(SystemClock),
      TableConfig::default(),
    );
    table.start_refresh();
    table
  }

  pub fn config(&self) -> &TableConfig {
    &self.config
  }

  /// Starts the periodic refresh, replacing any previous refresh task
  ///
  /// The task holds only a weak reference, and ends once the table is dropped.
  pub fn start_refresh(self: &Arc<Self>) {
    let weak: Weak<Self> = Arc::downgrade(self);
    let task = PeriodicTask::spawn(
      "identity_table_refresh",
      self.config.refresh_interval,
      move || match weak.upgrade() {
        Some(table) => {
          table.refresh();
          ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
      },
    );
    *self.refresh_task.lock() = Some(task);
  }

  /// Stops the background refresh; lookups keep working against the current index
  pub async fn close(&self) {
    let task = self.refresh_task.lock().take();
    if let Some(task) = task {
      task.close().await;
    }
  }

  /// Registers `identity` and generates its hashes for `[now - window, now + window]`
  ///
  /// Display keys are not checked for uniqueness here; that belongs to
  /// [super::IdentityRegistry].
  pub fn add(&self, identity: Arc<Identity>) {
    let now = self.clock.now();
    let mut registered = Registered {
      identity,
      watermark: now.saturating_sub(self.config.window_secs),
    };
    let mut state = self.state.write();
    self.generate_hashes(&mut state.index, &mut registered, now);
    tracing::debug!(
      key = registered.identity.display_key(),
      entries = state.index.len(),
      "identity added"
    );
    state.registered.push(registered);
  }

  /// Removes the identity with `display_key`, purging its hashes immediately
  ///
  /// Returns false if no such identity is registered.
  pub fn remove(&self, display_key: &str) -> bool {
    let key = normalize_key(display_key);
    let mut state = self.state.write();
    let position = match state
      .registered
      .iter()
      .position(|r| r.identity.normalized_key() == key)
    {
      Some(position) => position,
      None => return false,
    };
    let removed = state.registered.swap_remove(position);
    state
      .index
      .retain(|_, entry| !Arc::ptr_eq(&entry.identity, &removed.identity));
    tracing::debug!(key = display_key, "identity removed");
    true
  }

  /// Resolves a tag without mutating the index
  pub fn lookup(&self, tag: &[u8]) -> Result<ResolvedIdentity, AuthenticationError> {
    let tag: &AuthTag = tag
      .try_into()
      .map_err(|_| AuthenticationError::MalformedTag { length: tag.len() })?;
    let state = self.state.read();
    state
      .index
      .get(tag)
      .map(|entry| ResolvedIdentity {
        identity: Arc::clone(&entry.identity),
        timestamp: self.base_time + Timestamp::from(entry.offset),
      })
      .ok_or(AuthenticationError::UnknownTag)
  }

  /// Extends every identity's hashes through `now + window` and prunes expired buckets
  pub fn refresh(&self) {
    let now = self.clock.now();
    let mut guard = self.state.write();
    let state = &mut *guard;
    for registered in state.registered.iter_mut() {
      self.generate_hashes(&mut state.index, registered, now);
    }

    let expire = now.saturating_sub(self.config.window_secs);
    if expire > self.base_time {
      let min_offset = expire - self.base_time;
      let before = state.index.len();
      state
        .index
        .retain(|_, entry| Timestamp::from(entry.offset) >= min_offset);
      tracing::trace!(pruned = before - state.index.len(), "identity table refreshed");
    }
  }

  pub fn identity_count(&self) -> usize {
    self.state.read().registered.len()
  }

  pub fn entry_count(&self) -> usize {
    self.state.read().index.len()
  }

  fn generate_hashes(
    &self,
    index: &mut HashMap<AuthTag, HashEntry>,
    registered: &mut Registered,
    now: Timestamp,
  ) {
    let window = self.config.window_secs;
    let first = std::cmp::max(registered.watermark, now.saturating_sub(window * 2));
    let last = now + window;
    for id in registered.identity.identifiers() {
      for timestamp in first..=last {
        // Buckets before the base time cannot be represented as offsets
        let offset = match timestamp
          .checked_sub(self.base_time)
          .and_then(|offset| u32::try_from(offset).ok())
        {
          Some(offset) => offset,
          None => continue,
        };
        let tag = self.hasher.digest(id.as_bytes(), timestamp);
        debug_assert_eq!(tag.len(), TAG_LEN);
        index.insert(
          tag,
          HashEntry {
            identity: Arc::clone(&registered.identity),
            offset,
          },
        );
      }
    }
    registered.watermark = last;
  }
}

impl TagResolver for TimedIdentityTable {
  fn resolve(&self, tag: &[u8]) -> Result<ResolvedIdentity, AuthenticationError> {
    self.lookup(tag)
  }
}
