// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityState {
  pub last_activity: Instant,
  pub deadline: Instant,
  pub timeout: Duration,
}

#[derive(Debug)]
struct Inner {
  state: Mutex<ActivityState>,
  reconfigured: Notify,
  token: CancellationToken,
  stopped: CancellationToken,
  fired: AtomicBool,
}

impl Inner {
  fn expire(&self) {
    self.fired.store(true, Ordering::SeqCst);
    self.token.cancel();
  }
}

/// Idle deadline shared by both directions of a transfer
///
/// Cancels its token once no activity has been reported for the configured
/// timeout. Dropping the timer stops the watcher without cancelling.
#[derive(Debug)]
pub struct ActivityTimer {
  inner: Arc<Inner>,
}

impl ActivityTimer {
  /// Starts watching for inactivity; must be called within a tokio runtime
  ///
  /// A zero timeout cancels `token` immediately.
  pub fn spawn(token: CancellationToken, timeout: Duration) -> Self {
    let now = Instant::now();
    let inner = Arc::new(Inner {
      state: Mutex::new(ActivityState {
        last_activity: now,
        deadline: now + timeout,
        timeout,
      }),
      reconfigured: Notify::new(),
      stopped: token.child_token(),
      token,
      fired: AtomicBool::new(false),
    });
    if timeout.is_zero() {
      inner.expire();
    } else {
      tokio::task::spawn(
        Self::watch(Arc::clone(&inner))
          .instrument(tracing::span!(tracing::Level::TRACE, "activity_timer")),
      );
    }
    Self { inner }
  }

  async fn watch(inner: Arc<Inner>) {
    loop {
      let deadline = inner.state.lock().deadline;
      tokio::select! {
        _ = inner.stopped.cancelled() => return,
        _ = inner.reconfigured.notified() => continue,
        _ = tokio::time::sleep_until(deadline) => {
          let state = *inner.state.lock();
          // Activity since the sleep began moved the deadline forward
          if Instant::now() < state.deadline {
            continue;
          }
          tracing::debug!(timeout = ?state.timeout, "activity timer expired");
          inner.expire();
          return;
        }
      }
    }
  }

  /// Pushes the deadline forward by the current timeout
  pub fn update(&self) {
    let now = Instant::now();
    let mut state = self.inner.state.lock();
    state.last_activity = now;
    state.deadline = now + state.timeout;
  }

  /// Replaces the idle timeout, counting as activity; zero cancels immediately
  pub fn set_timeout(&self, timeout: Duration) {
    if self.inner.stopped.is_cancelled() {
      return;
    }
    if timeout.is_zero() {
      self.inner.expire();
      return;
    }
    {
      let now = Instant::now();
      let mut state = self.inner.state.lock();
      state.timeout = timeout;
      state.last_activity = now;
      state.deadline = now + timeout;
    }
    self.inner.reconfigured.notify_one();
  }

  /// Stops watching without cancelling the token
  pub fn stop(&self) {
    self.inner.stopped.cancel();
  }

  pub fn token(&self) -> &CancellationToken {
    &self.inner.token
  }

  pub fn state(&self) -> ActivityState {
    *self.inner.state.lock()
  }

  /// Whether the token was cancelled by this timer rather than externally
  pub fn has_fired(&self) -> bool {
    self.inner.fired.load(Ordering::SeqCst)
  }
}

impl Drop for ActivityTimer {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;

  use super::ActivityTimer;

  #[tokio::test(start_paused = true)]
  async fn fires_after_idle_timeout() {
    let token = CancellationToken::new();
    let timer = ActivityTimer::spawn(token.clone(), Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!token.is_cancelled());
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert!(token.is_cancelled());
    assert!(timer.has_fired());
  }

  #[tokio::test(start_paused = true)]
  async fn updates_postpone_deadline() {
    let token = CancellationToken::new();
    let timer = ActivityTimer::spawn(token.clone(), Duration::from_secs(5));
    for _ in 0..4 {
      tokio::time::sleep(Duration::from_secs(3)).await;
      timer.update();
    }
    assert!(!token.is_cancelled());
    tokio::time::timeout(Duration::from_secs(6), token.cancelled())
      .await
      .expect("timer must fire once updates stop");
  }

  #[tokio::test(start_paused = true)]
  async fn shorter_timeout_takes_effect_immediately() {
    let token = CancellationToken::new();
    let timer = ActivityTimer::spawn(token.clone(), Duration::from_secs(300));
    timer.set_timeout(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(2001)).await;
    assert!(token.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn zero_timeout_cancels_immediately() {
    let token = CancellationToken::new();
    let timer = ActivityTimer::spawn(token.clone(), Duration::from_secs(300));
    timer.set_timeout(Duration::ZERO);
    assert!(token.is_cancelled());
    assert!(timer.has_fired());
  }

  #[tokio::test(start_paused = true)]
  async fn stopped_timer_never_cancels() {
    let token = CancellationToken::new();
    let timer = ActivityTimer::spawn(token.clone(), Duration::from_secs(1));
    timer.stop();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!token.is_cancelled());
    assert!(!timer.has_fired());
  }
}
