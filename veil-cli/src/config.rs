// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! JSON server configuration
use anyhow::{Context as AnyhowContext, Result};
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};
use veil::common::{
  authentication::{Identity, SecretId},
  policy::{LevelPolicyManager, SessionPolicy, Timeouts},
  protocol::Destination,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
  pub listen: SocketAddr,
  #[serde(default)]
  pub users: Vec<UserConfig>,
  /// Timeouts per user level; levels without an entry use the defaults
  #[serde(default)]
  pub levels: HashMap<u32, LevelConfig>,
  #[serde(default)]
  pub redirect: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
  pub email: String,
  #[serde(default)]
  pub level: u32,
  pub id: uuid::Uuid,
  #[serde(default)]
  pub alter_id: u16,
}

/// Timeouts in whole seconds; anything omitted keeps its default
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LevelConfig {
  pub handshake: Option<u64>,
  pub connection_idle: Option<u64>,
  pub uplink_only: Option<u64>,
  pub downlink_only: Option<u64>,
}

impl LevelConfig {
  pub fn timeouts(&self) -> Timeouts {
    let defaults = Timeouts::default();
    let secs = |v: Option<u64>, default: Duration| v.map(Duration::from_secs).unwrap_or(default);
    Timeouts {
      handshake: secs(self.handshake, defaults.handshake),
      connection_idle: secs(self.connection_idle, defaults.connection_idle),
      uplink_only: secs(self.uplink_only, defaults.uplink_only),
      downlink_only: secs(self.downlink_only, defaults.downlink_only),
    }
  }
}

impl ServerConfig {
  pub fn load(path: &Path) -> Result<Self> {
    let raw = std::fs::read(path)
      .with_context(|| format!("Failed reading config file {}", path.display()))?;
    Self::from_slice(&raw)
  }

  pub fn from_slice(raw: &[u8]) -> Result<Self> {
    let config: Self = serde_json::from_slice(raw).context("Config file is not valid")?;
    config.redirect()?;
    Ok(config)
  }

  pub fn identities(&self) -> impl Iterator<Item = Identity> + '_ {
    self.users.iter().map(|user| {
      Identity::new(user.email.clone(), user.level, SecretId::from(user.id))
        .with_alternate_count(user.alter_id)
    })
  }

  pub fn policies(&self) -> LevelPolicyManager {
    self.levels.iter().fold(
      LevelPolicyManager::default(),
      |policies, (level, config)| {
        policies.with_level(
          *level,
          SessionPolicy {
            timeouts: config.timeouts(),
          },
        )
      },
    )
  }

  pub fn redirect(&self) -> Result<Option<Destination>> {
    self
      .redirect
      .as_deref()
      .map(|r| {
        r.parse::<Destination>()
          .with_context(|| format!("Invalid redirect {r:?}"))
      })
      .transpose()
  }
}
