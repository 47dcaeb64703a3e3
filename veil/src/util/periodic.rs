// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{ops::ControlFlow, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Runs a synchronous job on a fixed interval until stopped
///
/// The first execution happens one interval after spawning. Dropping the
/// handle stops the task.
#[derive(Debug)]
pub struct PeriodicTask {
  stop: CancellationToken,
  handle: Option<tokio::task::JoinHandle<()>>,
}

impl PeriodicTask {
  pub fn spawn<F>(name: &'static str, interval: Duration, mut execute: F) -> Self
  where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
  {
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    let handle = tokio::task::spawn(
      async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
          tokio::select! {
            _ = stopped.cancelled() => break,
            _ = ticker.tick() => {
              if execute().is_break() {
                break;
              }
            }
          }
        }
        tracing::trace!("periodic task exiting");
      }
      .instrument(tracing::span!(tracing::Level::TRACE, "periodic", task = name)),
    );
    Self {
      stop,
      handle: Some(handle),
    }
  }

  pub fn is_finished(&self) -> bool {
    self
      .handle
      .as_ref()
      .map_or(true, tokio::task::JoinHandle::is_finished)
  }

  /// Stops the task and waits for any execution in progress to finish
  pub async fn close(mut self) {
    self.stop.cancel();
    if let Some(handle) = self.handle.take() {
      if let Err(e) = handle.await {
        tracing::warn!(error = ?e, "periodic task panicked");
      }
    }
  }
}

impl Drop for PeriodicTask {
  fn drop(&mut self) {
    self.stop.cancel();
  }
}
