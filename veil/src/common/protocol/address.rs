// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  net::{IpAddr, SocketAddr},
  str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
  Tcp,
  Udp,
}

impl std::fmt::Display for Network {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Network::Tcp => "tcp",
      Network::Udp => "udp",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
  Ip(IpAddr),
  Domain(String),
}

impl std::fmt::Display for Address {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Address::Ip(IpAddr::V6(v6)) => write!(f, "[{}]", v6),
      Address::Ip(ip) => write!(f, "{}", ip),
      Address::Domain(domain) => f.write_str(domain),
    }
  }
}

/// Where a relayed session is headed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
  pub network: Network,
  pub address: Address,
  pub port: u16,
}

impl Destination {
  pub fn tcp(address: Address, port: u16) -> Self {
    Self {
      network: Network::Tcp,
      address,
      port,
    }
  }

  pub fn udp(address: Address, port: u16) -> Self {
    Self {
      network: Network::Udp,
      address,
      port,
    }
  }

  /// Resolves domains through the system resolver, taking the first result
  pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
    match &self.address {
      Address::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
      Address::Domain(domain) => tokio::net::lookup_host((domain.as_str(), self.port))
        .await?
        .next()
        .ok_or_else(|| {
          std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {}", domain),
          )
        }),
    }
  }
}

impl From<SocketAddr> for Destination {
  fn from(addr: SocketAddr) -> Self {
    Self::tcp(Address::Ip(addr.ip()), addr.port())
  }
}

impl std::fmt::Display for Destination {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}:{}", self.network, self.address, self.port)
  }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DestinationParseError {
  #[error("Destination must be of the form [tcp:|udp:]host:port")]
  MissingPort,
  #[error("Invalid port {0:?}")]
  InvalidPort(String),
  #[error("Destination host must not be empty")]
  EmptyHost,
  #[error("Domain names are limited to 255 bytes")]
  DomainTooLong,
}

impl FromStr for Destination {
  type Err = DestinationParseError;

  /// Parses `host:port`, optionally prefixed by `tcp:` or `udp:`; IPv6 hosts are bracketed
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (network, rest) = if let Some(rest) = s.strip_prefix("tcp:") {
      (Network::Tcp, rest)
    } else if let Some(rest) = s.strip_prefix("udp:") {
      (Network::Udp, rest)
    } else {
      (Network::Tcp, s)
    };
    let (host, port) = rest
      .rsplit_once(':')
      .ok_or(DestinationParseError::MissingPort)?;
    let port = port
      .parse::<u16>()
      .map_err(|_| DestinationParseError::InvalidPort(port.to_string()))?;
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .unwrap_or(host);
    if host.is_empty() {
      return Err(DestinationParseError::EmptyHost);
    }
    let address = match host.parse::<IpAddr>() {
      Ok(ip) => Address::Ip(ip),
      Err(_) if host.len() > 255 => return Err(DestinationParseError::DomainTooLong),
      Err(_) => Address::Domain(host.to_string()),
    };
    Ok(Self {
      network,
      address,
      port,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::net::{IpAddr, Ipv6Addr};

  use super::{Address, Destination, DestinationParseError, Network};

  #[test]
  fn parse_and_display() {
    let dest: Destination = "udp:[::1]:53".parse().unwrap();
    assert_eq!(dest.network, Network::Udp);
    assert_eq!(dest.address, Address::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    assert_eq!(dest.to_string(), "udp:[::1]:53");

    let dest: Destination = "example.com:443".parse().unwrap();
    assert_eq!(dest, Destination::tcp(Address::Domain("example.com".into()), 443));
    assert_eq!(dest.to_string(), "tcp:example.com:443");
  }

  #[test]
  fn parse_errors() {
    assert_eq!(
      "example.com".parse::<Destination>(),
      Err(DestinationParseError::MissingPort)
    );
    assert_eq!(
      ":80".parse::<Destination>(),
      Err(DestinationParseError::EmptyHost)
    );
    assert!(matches!(
      "host:http".parse::<Destination>(),
      Err(DestinationParseError::InvalidPort(_))
    ));
  }

  #[tokio::test]
  async fn ip_destinations_resolve_without_lookup() {
    let dest: Destination = "127.0.0.1:8080".parse().unwrap();
    assert_eq!(dest.resolve().await.unwrap(), "127.0.0.1:8080".parse().unwrap());
  }
}
