// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::Future;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Child tokens can be produced from it, allowing sub-cancellation,
/// but the interface does not expose a way to cancel the inner token.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// Drives `task` unless cancellation arrives first, in which case `None` is returned
  ///
  /// An already-cancelled listener never polls the task.
  pub async fn run_until_cancelled<F: Future>(&self, task: F) -> Option<F::Output> {
    tokio::select! {
      biased;
      _ = self.token.cancelled() => None,
      res = task => Some(res),
    }
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
  };

  use tokio_util::sync::CancellationToken;

  use super::CancellationListener;

  #[tokio::test]
  async fn child_tokens_do_not_cancel_their_parent() {
    let root = CancellationToken::new();
    let listener = CancellationListener::from(root.clone());
    let child = listener.child_token();
    child.cancel();
    assert!(!listener.is_cancelled());
    root.cancel();
    assert!(listener.is_cancelled());
    assert!(listener.child_token().is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn run_until_cancelled_abandons_pending_work() {
    let root = CancellationToken::new();
    let listener = CancellationListener::from(root.clone());
    assert_eq!(listener.run_until_cancelled(async { 7 }).await, Some(7));

    let canceller = tokio::task::spawn(async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      root.cancel();
    });
    let res = listener
      .run_until_cancelled(tokio::time::sleep(Duration::from_secs(60)))
      .await;
    assert_eq!(res, None);
    canceller.await.unwrap();

    let polled = AtomicBool::new(false);
    let res = listener
      .run_until_cancelled(async { polled.store(true, Ordering::SeqCst) })
      .await;
    assert_eq!(res, None);
    assert!(!polled.load(Ordering::SeqCst));
  }
}
