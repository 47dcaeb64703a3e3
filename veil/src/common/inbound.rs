// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection orchestration: authenticate, dispatch, and relay
use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
  access::AccessRecord,
  authentication::{Identity, IdentityManager, IdentityRegistry, RegistryError},
  policy::PolicyManager,
  protocol::{BoxedAsyncRead, CodecError, DispatchError, Dispatcher, InboundCodec},
};
use crate::{
  transfer::{DuplexPump, TransferError, TransferStats},
  util::cancellation::CancellationListener,
};

/// Level whose handshake timeout bounds header decoding, before any identity is known
const HANDSHAKE_POLICY_LEVEL: u32 = 0;

#[derive(thiserror::Error, Debug)]
pub enum InboundError {
  #[error("Handshake failed")]
  Handshake(#[from] CodecError),
  #[error("Handshake not completed within {0:?}")]
  HandshakeTimeout(Duration),
  #[error("Dispatch failed")]
  Dispatch(#[from] DispatchError),
  #[error("Relay failed")]
  Transfer(#[from] TransferError),
}

pub struct InboundHandler {
  codec: Arc<dyn InboundCodec>,
  identities: Arc<IdentityRegistry>,
  dispatcher: Arc<dyn Dispatcher>,
  policies: Arc<dyn PolicyManager>,
}

impl std::fmt::Debug for InboundHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InboundHandler")
      .field("identities", &self.identities.len())
      .finish_non_exhaustive()
  }
}

impl InboundHandler {
  pub fn new(
    codec: Arc<dyn InboundCodec>,
    identities: Arc<IdentityRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    policies: Arc<dyn PolicyManager>,
  ) -> Self {
    Self {
      codec,
      identities,
      dispatcher,
      policies,
    }
  }

  pub fn identities(&self) -> &Arc<IdentityRegistry> {
    &self.identities
  }

  /// Serves one accepted connection to completion
  ///
  /// Failed handshakes close the connection without a reply; the cause only
  /// reaches the access log.
  #[tracing::instrument(level = "debug", skip(self, connection, shutdown), err)]
  pub async fn process<S>(
    &self,
    connection: S,
    peer: SocketAddr,
    shutdown: &CancellationListener,
  ) -> Result<TransferStats, InboundError>
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (reader, writer) = tokio::io::split(connection);
    let mut reader: BoxedAsyncRead = Box::new(reader);

    let handshake_timeout = self
      .policies
      .for_level(HANDSHAKE_POLICY_LEVEL)
      .timeouts
      .handshake;
    let decoded = tokio::time::timeout(
      handshake_timeout,
      self.codec.decode_request(&mut reader, &*self.identities),
    )
    .await;
    let header = match decoded {
      Ok(Ok(header)) => header,
      Ok(Err(e)) => {
        // Peers that hang up mid-header are not worth an access entry
        if !e.is_end_of_stream() {
          AccessRecord::rejected(peer, &e).emit();
        }
        return Err(e.into());
      }
      Err(_elapsed) => {
        let e = InboundError::HandshakeTimeout(handshake_timeout);
        AccessRecord::rejected(peer, &e).emit();
        return Err(e);
      }
    };
    AccessRecord::accepted(
      peer,
      &header.destination,
      header.identity.display_key(),
    )
    .emit();

    let policy = self.policies.for_level(header.identity.level());
    let link = self
      .dispatcher
      .dispatch(&header.destination, policy, shutdown.clone())
      .await?;
    let (link_reader, link_writer) = link.into_parts();
    let request = self.codec.body_reader(&header, reader);
    let response = self.codec.body_writer(&header, Box::new(writer));

    let stats = DuplexPump::new(shutdown.child_token(), policy.timeouts)
      .run((request, link_writer), (link_reader, response))
      .await?;
    tracing::debug!(
      uplink = stats.uplink,
      downlink = stats.downlink,
      destination = %header.destination,
      "session finished"
    );
    Ok(stats)
  }
}

impl IdentityManager for InboundHandler {
  fn add_identity(&self, identity: Identity) -> BoxFuture<'_, Result<(), RegistryError>> {
    self.identities.add_identity(identity)
  }

  fn remove_identity<'a>(
    &'a self,
    display_key: &'a str,
  ) -> BoxFuture<'a, Result<(), RegistryError>> {
    self.identities.remove_identity(display_key)
  }
}

#[cfg(test)]
mod tests {
  use std::{net::SocketAddr, sync::Arc, time::Duration};

  use futures::future::{BoxFuture, FutureExt};
  use mockall::predicate::eq;
  use parking_lot::Mutex;
  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::{InboundError, InboundHandler};
  use crate::{
    common::{
      authentication::{
        HmacMd5IdHasher, IdHasher, Identity, IdentityManager, IdentityRegistry, ManualClock,
        RegistryError, SecretId, TableConfig, TimedIdentityTable,
      },
      policy::{MockPolicyManager, SessionPolicy, Timeouts},
      protocol::{
        tagged::{encode_request, TaggedCodec},
        CodecError, DispatchError, Destination, Dispatcher,
      },
    },
    transfer::{copy, link_pair, CopyOptions, Link},
    util::cancellation::CancellationListener,
  };

  const NOW: u64 = 1_690_000_000;

  /// Echoes every session back to its sender
  #[derive(Default)]
  struct EchoDispatcher {
    dispatched: Mutex<Vec<(Destination, SessionPolicy)>>,
  }

  impl Dispatcher for EchoDispatcher {
    fn dispatch<'a>(
      &'a self,
      destination: &'a Destination,
      policy: SessionPolicy,
      _shutdown: CancellationListener,
    ) -> BoxFuture<'a, Result<Link, DispatchError>> {
      self.dispatched.lock().push((destination.clone(), policy));
      let (near, far) = link_pair(4);
      tokio::task::spawn(async move {
        let (mut reader, mut writer) = far.into_parts();
        copy(&mut reader, &mut writer, CopyOptions::new()).await.ok();
        writer.close().await.ok();
      });
      futures::future::ready(Ok(near)).boxed()
    }
  }

  fn secret() -> SecretId {
    "0b6a8c5e-4f42-4cf1-9a48-3dbd2bd71b0c".parse().unwrap()
  }

  fn handler(policies: MockPolicyManager) -> (InboundHandler, Arc<EchoDispatcher>) {
    let registry = Arc::new(IdentityRegistry::new(TimedIdentityTable::new(
      Arc::new(HmacMd5IdHasher),
      Arc::new(ManualClock::new(NOW)),
      TableConfig::default(),
    )));
    registry
      .add(Identity::new("frank@example.com", 3, secret()).with_alternate_count(1))
      .unwrap();
    let dispatcher = Arc::new(EchoDispatcher::default());
    let handler = InboundHandler::new(
      Arc::new(TaggedCodec::new()),
      registry,
      dispatcher.clone(),
      Arc::new(policies),
    );
    (handler, dispatcher)
  }

  fn peer() -> SocketAddr {
    "198.51.100.4:50123".parse().unwrap()
  }

  fn level_three_policy() -> SessionPolicy {
    SessionPolicy {
      timeouts: Timeouts {
        connection_idle: Duration::from_secs(900),
        ..Timeouts::default()
      },
    }
  }

  #[tokio::test]
  async fn authenticated_sessions_are_relayed() {
    let mut policies = MockPolicyManager::new();
    policies
      .expect_for_level()
      .with(eq(0))
      .times(1)
      .returning(|_| SessionPolicy::default());
    policies
      .expect_for_level()
      .with(eq(3))
      .times(1)
      .returning(|_| level_three_policy());
    let (handler, dispatcher) = handler(policies);

    let (mut client, server) = duplex(64 * 1024);
    let destination: Destination = "example.org:443".parse().unwrap();
    let tag = HmacMd5IdHasher.digest(secret().as_bytes(), NOW + 12);
    let mut request = encode_request(&tag, &destination).unwrap();
    request.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");

    let serving = tokio::task::spawn(async move {
      handler
        .process(server, peer(), &CancellationListener::default())
        .await
    });
    client.write_all(&request).await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();

    let stats = serving.await.unwrap().unwrap();
    assert_eq!(echoed, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(stats.uplink, echoed.len() as u64);
    assert_eq!(stats.downlink, echoed.len() as u64);
    assert_eq!(
      *dispatcher.dispatched.lock(),
      vec![(destination, level_three_policy())]
    );
  }

  #[tokio::test]
  async fn unknown_tags_are_rejected_before_dispatch() {
    let mut policies = MockPolicyManager::new();
    policies
      .expect_for_level()
      .returning(|_| SessionPolicy::default());
    let (handler, dispatcher) = handler(policies);

    let (mut client, server) = duplex(1024);
    let request = encode_request(&[0xAA; 16], &"example.org:80".parse().unwrap()).unwrap();
    client.write_all(&request).await.unwrap();
    let err = handler
      .process(server, peer(), &CancellationListener::default())
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      InboundError::Handshake(CodecError::Authentication(_))
    ));
    assert!(dispatcher.dispatched.lock().is_empty());
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn silent_peers_hit_the_handshake_timeout() {
    let mut policies = MockPolicyManager::new();
    policies
      .expect_for_level()
      .returning(|_| SessionPolicy::default());
    let (handler, _dispatcher) = handler(policies);

    let (_client, server) = duplex(1024);
    let err = handler
      .process(server, peer(), &CancellationListener::default())
      .await
      .unwrap_err();
    assert!(matches!(err, InboundError::HandshakeTimeout(t) if t == Duration::from_secs(4)));
  }

  #[tokio::test]
  async fn removed_identities_are_refused_immediately() {
    let mut policies = MockPolicyManager::new();
    policies
      .expect_for_level()
      .returning(|_| SessionPolicy::default());
    let (handler, _dispatcher) = handler(policies);
    handler.remove_identity("FRANK@example.com").await.unwrap();

    let (mut client, server) = duplex(1024);
    let tag = HmacMd5IdHasher.digest(secret().as_bytes(), NOW);
    let request = encode_request(&tag, &"example.org:80".parse().unwrap()).unwrap();
    client.write_all(&request).await.unwrap();
    let err = handler
      .process(server, peer(), &CancellationListener::default())
      .await
      .unwrap_err();
    assert!(matches!(err, InboundError::Handshake(_)));
    assert!(matches!(
      handler.remove_identity("frank@example.com").await,
      Err(RegistryError::IdentityNotFound(_))
    ));
  }
}
