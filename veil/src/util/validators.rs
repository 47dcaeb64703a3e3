// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument parsers for command-line front ends
use anyhow::{Context, Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::common::{authentication::SecretId, protocol::Destination};

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .with_context(|| format!("Could not resolve {v:?}"))?
    .next()
    .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
}

/// Parses a user id in UUID form
pub fn parse_secret_id(v: &str) -> Result<SecretId> {
  v.parse::<SecretId>()
    .map_err(|e| AnyErr::msg(format!("User id must be a UUID: {e}")))
}

pub fn parse_destination(v: &str) -> Result<Destination> {
  v.parse::<Destination>().map_err(Into::into)
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_secret_id(v: &str) -> Result<(), String> {
  parse_secret_id(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_destination(v: &str) -> Result<(), String> {
  parse_destination(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_well_formed_arguments() {
    assert!(validate_socketaddr("127.0.0.1:8080").is_ok());
    assert!(validate_secret_id("b831381d-6324-4d53-ad4f-8cda48b30811").is_ok());
    assert!(validate_destination("udp:1.1.1.1:53").is_ok());
    assert!(validate_destination("example.com:443").is_ok());
  }

  #[test]
  fn rejects_malformed_arguments() {
    assert!(validate_socketaddr("not an address").is_err());
    assert!(validate_secret_id("b831381d").is_err());
    assert!(validate_destination("example.com").is_err());
    assert!(validate_existing_file("/definitely/not/here.json").is_err());
  }
}
