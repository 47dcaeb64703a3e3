// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{future::Future, time::Duration};

#[derive(thiserror::Error, Debug)]
#[error("Gave up after {attempts} attempts")]
pub struct RetryError<E: std::error::Error + 'static> {
  pub attempts: u32,
  #[source]
  pub last: E,
}

/// Runs `operation` until it succeeds or `attempts` runs have failed
///
/// The delay before retry `n` is `base * 2^(n-1)`.
pub async fn exponential_backoff<T, E, F, Fut>(
  attempts: u32,
  base: Duration,
  mut operation: F,
) -> Result<T, RetryError<E>>
where
  E: std::error::Error + 'static,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let attempts = attempts.max(1);
  let mut delay = base;
  let mut attempt = 1;
  loop {
    match operation().await {
      Ok(value) => return Ok(value),
      Err(last) if attempt >= attempts => return Err(RetryError { attempts, last }),
      Err(e) => {
        tracing::debug!(attempt, error = %e, ?delay, "retrying after failure");
        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2);
        attempt += 1;
      }
    }
  }
}
