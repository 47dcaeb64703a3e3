// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io, sync::Arc};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use super::address::Destination;
use crate::{
  common::{
    authentication::{AuthenticationError, Identity, TagResolver, Timestamp},
    buf::{MultiBufferReader, MultiBufferWriter},
    policy::SessionPolicy,
  },
  transfer::Link,
  util::cancellation::CancellationListener,
};

pub type BoxedAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
  #[error("Unsupported protocol version {0}")]
  UnsupportedVersion(u8),
  #[error("Unknown command {0:#04x}")]
  UnknownCommand(u8),
  #[error("Unknown address type {0:#04x}")]
  UnknownAddressType(u8),
  #[error("Domain name is not valid UTF-8")]
  InvalidDomain,
  #[error("Packet of {0} bytes exceeds the frame limit")]
  OversizedPacket(usize),
}

/// Failures decoding a request, kept apart from plain transport failures
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
  #[error("Request failed authentication")]
  Authentication(#[from] AuthenticationError),
  #[error("Malformed request header")]
  Framing(#[from] FramingError),
  #[error("Transport failed while reading request header")]
  Io(#[from] io::Error),
}

impl CodecError {
  /// The peer hung up before sending a complete header
  pub fn is_end_of_stream(&self) -> bool {
    matches!(self, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
  }
}

/// A decoded, authenticated request
#[derive(Debug, Clone)]
pub struct RequestHeader {
  pub identity: Arc<Identity>,
  /// Time bucket the peer's tag was generated for
  pub timestamp: Timestamp,
  pub destination: Destination,
}

/// Server-side wire format of an inbound protocol
pub trait InboundCodec: Send + Sync {
  fn decode_request<'a>(
    &'a self,
    reader: &'a mut BoxedAsyncRead,
    resolver: &'a dyn TagResolver,
  ) -> BoxFuture<'a, Result<RequestHeader, CodecError>>;

  /// Reads the request body sent after the header
  fn body_reader(&self, header: &RequestHeader, reader: BoxedAsyncRead)
    -> Box<dyn MultiBufferReader>;

  /// Writes the response stream back to the peer
  fn body_writer(
    &self,
    header: &RequestHeader,
    writer: BoxedAsyncWrite,
  ) -> Box<dyn MultiBufferWriter>;
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
  #[error("Destination {0} refused by dispatcher")]
  Refused(Destination),
  #[error("Failed to reach {destination}")]
  Unreachable {
    destination: Destination,
    #[source]
    source: io::Error,
  },
}

/// Provides the local end of a session bound for `destination`
///
/// `policy` is the one resolved for the session's identity; whatever relays
/// the far end of the link is bound by it as well.
pub trait Dispatcher: Send + Sync {
  fn dispatch<'a>(
    &'a self,
    destination: &'a Destination,
    policy: SessionPolicy,
    shutdown: CancellationListener,
  ) -> BoxFuture<'a, Result<Link, DispatchError>>;
}

impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
  fn dispatch<'a>(
    &'a self,
    destination: &'a Destination,
    policy: SessionPolicy,
    shutdown: CancellationListener,
  ) -> BoxFuture<'a, Result<Link, DispatchError>> {
    (**self).dispatch(destination, policy, shutdown)
  }
}
