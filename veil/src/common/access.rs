// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use super::protocol::Destination;

pub const ACCESS_LOG_TARGET: &str = "veil::access";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
  Accepted,
  Rejected,
}

impl std::fmt::Display for AccessStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      AccessStatus::Accepted => "accepted",
      AccessStatus::Rejected => "rejected",
    })
  }
}

/// One access decision for an inbound request
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
  pub from: SocketAddr,
  pub to: Option<&'a Destination>,
  pub status: AccessStatus,
  pub identity: Option<&'a str>,
  pub reason: Option<String>,
}

impl<'a> AccessRecord<'a> {
  pub fn accepted(from: SocketAddr, to: &'a Destination, identity: &'a str) -> Self {
    Self {
      from,
      to: Some(to),
      status: AccessStatus::Accepted,
      identity: Some(identity),
      reason: None,
    }
  }

  pub fn rejected<E: std::fmt::Display + ?Sized>(from: SocketAddr, reason: &E) -> Self {
    Self {
      from,
      to: None,
      status: AccessStatus::Rejected,
      identity: None,
      reason: Some(reason.to_string()),
    }
  }

  pub fn emit(&self) {
    tracing::info!(
      target: ACCESS_LOG_TARGET,
      from = %self.from,
      to = self.to.map(tracing::field::display),
      status = %self.status,
      email = self.identity,
      reason = self.reason.as_deref(),
      "access"
    );
  }
}
