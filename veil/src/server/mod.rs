// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accept loop feeding TCP connections to an [InboundHandler]

use std::{net::SocketAddr, sync::Arc};

use futures::stream::StreamExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing_futures::Instrument;

use crate::{common::inbound::InboundHandler, util::cancellation::CancellationListener};

pub struct InboundServer {
  listener: TcpListener,
  handler: Arc<InboundHandler>,
}

impl InboundServer {
  pub async fn bind(addr: SocketAddr, handler: Arc<InboundHandler>) -> std::io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(listen = %listener.local_addr()?, "inbound server bound");
    Ok(Self { listener, handler })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Serves connections until `shutdown` fires, then waits for open sessions to end
  ///
  /// Open sessions observe the same shutdown and wind down with it.
  pub async fn run(self, shutdown: CancellationListener) {
    let handler = self.handler;
    let connections = TcpListenerStream::new(self.listener).take_until({
      let shutdown = shutdown.clone();
      async move { shutdown.cancelled().await }
    });

    connections
      .for_each_concurrent(None, |accepted| {
        let handler = Arc::clone(&handler);
        let shutdown = shutdown.clone();
        async move {
          let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
              tracing::warn!(error = %e, "failed to accept connection");
              return;
            }
          };
          let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
              tracing::debug!(error = %e, "connection closed before peer address was read");
              return;
            }
          };
          // Sessions run on their own tasks so a slow one never stalls accepts
          let session = tokio::task::spawn(
            async move {
              if let Err(e) = handler.process(stream, peer, &shutdown).await {
                tracing::debug!(error = %e, "session ended with error");
              }
            }
            .instrument(tracing::debug_span!("session", %peer)),
          );
          if let Err(e) = session.await {
            tracing::error!(error = %e, "session task panicked");
          }
        }
      })
      .instrument(tracing::info_span!("inbound_server"))
      .await;
    tracing::info!("inbound server stopped");
  }
}
