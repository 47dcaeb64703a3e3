// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A minimal tag-authenticated request framing
//!
//! ```text
//! tag[16] | version=1 | command (1=tcp, 2=udp) | port u16 BE | atyp | address
//! atyp: 1 = IPv4 (4 bytes), 2 = domain (u8 length + bytes), 3 = IPv6 (16 bytes)
//! ```
//!
//! TCP bodies follow the header unframed; UDP bodies are length-prefixed packets.
use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr},
  sync::Arc,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncReadExt;

use super::{
  address::{Address, Destination, Network},
  packet::{PacketReader, PacketWriter},
  traits::{
    BoxedAsyncRead, BoxedAsyncWrite, CodecError, FramingError, InboundCodec, RequestHeader,
  },
};
use crate::common::{
  authentication::{AuthTag, TagResolver, TAG_LEN},
  buf::{BufferPool, MultiBufferReader, MultiBufferWriter, StreamReader, StreamWriter},
};

pub const VERSION: u8 = 1;

const COMMAND_TCP: u8 = 1;
const COMMAND_UDP: u8 = 2;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 2;
const ATYP_IPV6: u8 = 3;

#[derive(Debug, Clone)]
pub struct TaggedCodec {
  pool: Arc<BufferPool>,
}

impl Default for TaggedCodec {
  fn default() -> Self {
    Self::with_pool(BufferPool::shared())
  }
}

impl TaggedCodec {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_pool(pool: Arc<BufferPool>) -> Self {
    Self { pool }
  }
}

/// Serializes a request header for `destination`, authenticated by `tag`
pub fn encode_request(tag: &AuthTag, destination: &Destination) -> Result<Vec<u8>, FramingError> {
  let mut header = Vec::with_capacity(TAG_LEN + 4 + 1 + 256);
  header.extend_from_slice(tag);
  header.push(VERSION);
  header.push(match destination.network {
    Network::Tcp => COMMAND_TCP,
    Network::Udp => COMMAND_UDP,
  });
  header.extend_from_slice(&destination.port.to_be_bytes());
  match &destination.address {
    Address::Ip(IpAddr::V4(v4)) => {
      header.push(ATYP_IPV4);
      header.extend_from_slice(&v4.octets());
    }
    Address::Ip(IpAddr::V6(v6)) => {
      header.push(ATYP_IPV6);
      header.extend_from_slice(&v6.octets());
    }
    Address::Domain(domain) => {
      let length = u8::try_from(domain.len()).map_err(|_| FramingError::InvalidDomain)?;
      header.push(ATYP_DOMAIN);
      header.push(length);
      header.extend_from_slice(domain.as_bytes());
    }
  }
  Ok(header)
}

/// The body reader for a session over `network`, shared by both ends of the protocol
pub fn body_reader_for(
  network: Network,
  pool: &Arc<BufferPool>,
  reader: BoxedAsyncRead,
) -> Box<dyn MultiBufferReader> {
  match network {
    Network::Tcp => Box::new(StreamReader::with_pool(reader, Arc::clone(pool))),
    Network::Udp => Box::new(PacketReader::with_pool(reader, Arc::clone(pool))),
  }
}

/// The body writer for a session over `network`, shared by both ends of the protocol
pub fn body_writer_for(network: Network, writer: BoxedAsyncWrite) -> Box<dyn MultiBufferWriter> {
  match network {
    Network::Tcp => Box::new(StreamWriter::new(writer)),
    Network::Udp => Box::new(PacketWriter::new(writer)),
  }
}

async fn read_destination(reader: &mut BoxedAsyncRead) -> Result<Destination, CodecError> {
  let version = reader.read_u8().await?;
  if version != VERSION {
    return Err(FramingError::UnsupportedVersion(version).into());
  }
  let network = match reader.read_u8().await? {
    COMMAND_TCP => Network::Tcp,
    COMMAND_UDP => Network::Udp,
    other => return Err(FramingError::UnknownCommand(other).into()),
  };
  let port = reader.read_u16().await?;
  let address = match reader.read_u8().await? {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      reader.read_exact(&mut octets).await?;
      Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      reader.read_exact(&mut octets).await?;
      Address::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
    }
    ATYP_DOMAIN => {
      let length = usize::from(reader.read_u8().await?);
      let mut domain = vec![0u8; length];
      reader.read_exact(&mut domain).await?;
      let domain = String::from_utf8(domain).map_err(|_| FramingError::InvalidDomain)?;
      if domain.is_empty() {
        return Err(FramingError::InvalidDomain.into());
      }
      Address::Domain(domain)
    }
    other => return Err(FramingError::UnknownAddressType(other).into()),
  };
  Ok(Destination {
    network,
    address,
    port,
  })
}

impl InboundCodec for TaggedCodec {
  fn decode_request<'a>(
    &'a self,
    reader: &'a mut BoxedAsyncRead,
    resolver: &'a dyn TagResolver,
  ) -> BoxFuture<'a, Result<RequestHeader, CodecError>> {
    async move {
      let mut tag: AuthTag = [0u8; TAG_LEN];
      reader.read_exact(&mut tag).await?;
      // Authenticate before parsing anything else
      let resolved = resolver.resolve(&tag)?;
      let destination = read_destination(reader).await?;
      Ok(RequestHeader {
        identity: resolved.identity,
        timestamp: resolved.timestamp,
        destination,
      })
    }
    .boxed()
  }

  fn body_reader(
    &self,
    header: &RequestHeader,
    reader: BoxedAsyncRead,
  ) -> Box<dyn MultiBufferReader> {
    body_reader_for(header.destination.network, &self.pool, reader)
  }

  fn body_writer(
    &self,
    header: &RequestHeader,
    writer: BoxedAsyncWrite,
  ) -> Box<dyn MultiBufferWriter> {
    body_writer_for(header.destination.network, writer)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::{encode_request, TaggedCodec};
  use crate::common::{
    authentication::{
      HmacMd5IdHasher, IdHasher, Identity, IdentityRegistry, ManualClock, SecretId, TableConfig,
      TimedIdentityTable,
    },
    protocol::{
      address::{Address, Destination},
      traits::{BoxedAsyncRead, CodecError, FramingError, InboundCodec},
    },
  };

  const NOW: u64 = 1_600_000_000;

  fn registry_with(id: SecretId) -> IdentityRegistry {
    let registry = IdentityRegistry::new(TimedIdentityTable::new(
      Arc::new(HmacMd5IdHasher),
      Arc::new(ManualClock::new(NOW)),
      TableConfig::default(),
    ));
    registry.add(Identity::new("erin", 2, id)).unwrap();
    registry
  }

  fn id() -> SecretId {
    "a3482e88-686a-4a58-8126-99c9df64b7bf".parse().unwrap()
  }

  async fn decode(
    wire: Vec<u8>,
    registry: &IdentityRegistry,
  ) -> Result<super::RequestHeader, CodecError> {
    let mut reader: BoxedAsyncRead = Box::new(std::io::Cursor::new(wire));
    TaggedCodec::new().decode_request(&mut reader, registry).await
  }

  #[tokio::test]
  async fn authenticated_request_decodes() {
    let registry = registry_with(id());
    let destination: Destination = "udp:dns.example:53".parse().unwrap();
    let tag = HmacMd5IdHasher.digest(id().as_bytes(), NOW - 30);
    let header = decode(encode_request(&tag, &destination).unwrap(), &registry)
      .await
      .unwrap();
    assert_eq!(header.destination, destination);
    assert_eq!(header.timestamp, NOW - 30);
    assert_eq!(header.identity.display_key(), "erin");
    assert_eq!(header.identity.level(), 2);
  }

  #[tokio::test]
  async fn unknown_tags_fail_authentication() {
    let registry = registry_with(id());
    let destination = Destination::tcp(Address::Domain("example.com".into()), 80);
    let err = decode(encode_request(&[7u8; 16], &destination).unwrap(), &registry)
      .await
      .unwrap_err();
    assert!(matches!(err, CodecError::Authentication(_)));
  }

  #[tokio::test]
  async fn bad_framing_is_reported() {
    let registry = registry_with(id());
    let tag = HmacMd5IdHasher.digest(id().as_bytes(), NOW);
    let mut wire = encode_request(&tag, &"10.0.0.1:22".parse().unwrap()).unwrap();
    wire[16] = 9;
    let err = decode(wire, &registry).await.unwrap_err();
    assert!(matches!(
      err,
      CodecError::Framing(FramingError::UnsupportedVersion(9))
    ));
  }

  #[tokio::test]
  async fn early_hangup_is_end_of_stream() {
    let registry = registry_with(id());
    let err = decode(vec![1, 2, 3], &registry).await.unwrap_err();
    assert!(err.is_end_of_stream());
  }

  #[test]
  fn long_domains_cannot_be_encoded() {
    let destination = Destination::tcp(Address::Domain("a".repeat(256)), 80);
    assert_eq!(
      encode_request(&[0u8; 16], &destination),
      Err(FramingError::InvalidDomain)
    );
  }
}
