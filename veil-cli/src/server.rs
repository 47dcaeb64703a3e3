// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::config::ServerConfig;
use anyhow::{Context as AnyhowContext, Result};
use futures::future::TryFutureExt;
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use veil::{
  common::{
    authentication::{IdentityRegistry, TimedIdentityTable},
    inbound::InboundHandler,
    protocol::{freedom::FreedomDispatcher, tagged::TaggedCodec},
  },
  server::InboundServer,
};

/// Parameters used to run a veil server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub config: PathBuf,
  pub port: Option<u16>,
  pub test_only: bool,
}

/// Run a veil server relaying sessions for every configured user
#[tracing::instrument(skip(args), fields(config = ?args.config), err)]
pub async fn server_main(args: self::ServerArgs) -> Result<()> {
  let mut config = ServerConfig::load(&args.config)?;
  if let Some(port) = args.port {
    config.listen.set_port(port);
  }
  if args.test_only {
    tracing::info!(users = config.users.len(), listen = %config.listen, "configuration OK");
    return Ok(());
  }

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let table = TimedIdentityTable::spawn_default();
  let registry = Arc::new(IdentityRegistry::new(Arc::clone(&table)));
  for identity in config.identities() {
    registry
      .add(identity)
      .context("Configured users must be unique")?;
  }
  tracing::info!(users = registry.len(), "identities registered");

  let dispatcher = FreedomDispatcher::new().with_redirect(config.redirect()?);
  let handler = Arc::new(InboundHandler::new(
    Arc::new(TaggedCodec::new()),
    registry,
    Arc::new(dispatcher),
    Arc::new(config.policies()),
  ));

  let server = InboundServer::bind(config.listen, handler)
    .map_err(|e| anyhow::Error::new(e).context("Failed binding listen address"))
    .await?;
  server.run(shutdown.into()).await;

  table.close().await;
  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}
