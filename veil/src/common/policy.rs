// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-level session policies
use std::{collections::HashMap, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
  /// Bound on reading and authenticating a request header
  pub handshake: Duration,
  /// Idle time after which a session with traffic in both directions is torn down
  pub connection_idle: Duration,
  /// Idle bound once the downlink has finished
  pub uplink_only: Duration,
  /// Idle bound once the uplink has finished
  pub downlink_only: Duration,
}

impl Default for Timeouts {
  fn default() -> Self {
    Self {
      handshake: Duration::from_secs(4),
      connection_idle: Duration::from_secs(300),
      uplink_only: Duration::from_secs(2),
      downlink_only: Duration::from_secs(5),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionPolicy {
  pub timeouts: Timeouts,
}

#[cfg_attr(test, mockall::automock)]
pub trait PolicyManager: Send + Sync {
  fn for_level(&self, level: u32) -> SessionPolicy;
}

/// Fixed policies by level, with a fallback for unlisted levels
#[derive(Debug, Clone, Default)]
pub struct LevelPolicyManager {
  levels: HashMap<u32, SessionPolicy>,
  fallback: SessionPolicy,
}

impl LevelPolicyManager {
  pub fn new(fallback: SessionPolicy) -> Self {
    Self {
      levels: HashMap::new(),
      fallback,
    }
  }

  pub fn with_level(mut self, level: u32, policy: SessionPolicy) -> Self {
    self.levels.insert(level, policy);
    self
  }
}

impl PolicyManager for LevelPolicyManager {
  fn for_level(&self, level: u32) -> SessionPolicy {
    self.levels.get(&level).copied().unwrap_or(self.fallback)
  }
}
