// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use futures::stream::StreamExt;
use std::{net::SocketAddr, sync::Arc};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use veil::{
  common::{
    authentication::SecretId,
    buf::{StreamReader, StreamWriter},
    outbound::TaggedOutbound,
    protocol::Destination,
  },
  transfer::Link,
  util::cancellation::CancellationListener,
};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub server: SocketAddr,
  pub id: SecretId,
  pub alter_id: u16,
  pub listen: SocketAddr,
  pub target: Destination,
}

/// Forwards every connection accepted on `listen` to `target` through the server
#[tracing::instrument(skip(args), fields(server = %args.server, target = %args.target), err)]
pub async fn client_main(args: self::ClientArgs) -> Result<()> {
  let shutdown = CancellationToken::new();
  let sigint_handler_task = tokio::task::spawn({
    let shutdown_trigger = shutdown.clone();
    async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    }
  });

  let listener = tokio::net::TcpListener::bind(args.listen)
    .await
    .context("Failed binding local listener")?;
  tracing::info!(listen = %listener.local_addr()?, "forwarding local connections");

  let outbound = Arc::new(TaggedOutbound::new(args.server, args.id, args.alter_id));
  let target = Arc::new(args.target);
  let listener_shutdown = CancellationListener::from(shutdown.clone());
  TcpListenerStream::new(listener)
    .take_until({
      let listener_shutdown = listener_shutdown.clone();
      async move { listener_shutdown.cancelled().await }
    })
    .for_each_concurrent(None, |accepted| {
      let outbound = Arc::clone(&outbound);
      let target = Arc::clone(&target);
      let shutdown = listener_shutdown.clone();
      async move {
        let stream = match accepted {
          Ok(stream) => stream,
          Err(e) => {
            tracing::warn!(error = %e, "failed to accept local connection");
            return;
          }
        };
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let local = Link::new(StreamReader::new(reader), StreamWriter::new(writer));
        let relay = async move {
          match outbound.relay(&target, local, &shutdown).await {
            Ok(stats) => tracing::debug!(?stats, "local connection finished"),
            Err(e) => tracing::debug!(error = %e, "local connection failed"),
          }
        };
        let relay = relay.instrument(tracing::debug_span!("local", ?peer));
        if let Err(e) = tokio::task::spawn(relay).await {
          tracing::error!(error = %e, "relay task panicked");
        }
      }
    })
    .await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}
